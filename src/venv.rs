use crate::interpreter::Interpreter;
use crate::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const VIRTUALENV_PY: &str = include_str!("data-files/virtualenv.py");
pub const PYVENV_CFG: &str = "pyvenv.cfg";

/// The handful of `pyvenv.cfg` keys we read and write. Lines may end in `\n`
/// or `\r\n`; keys we don't recognize are ignored so that venvs written by a
/// newer layout still load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyvenvCfg {
    pub home: PathBuf,
    pub include_system_site_packages: bool,
    pub interpreter_relpath: Option<String>,
    pub site_packages_relpath: Option<String>,
}

impl PyvenvCfg {
    pub fn parse(text: &str) -> Result<PyvenvCfg> {
        let mut home = None;
        let mut include_system_site_packages = false;
        let mut interpreter_relpath = None;
        let mut site_packages_relpath = None;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => bail!("line {:?} is not `key = value`", line),
            };
            match key {
                "home" => home = Some(PathBuf::from(value)),
                "include-system-site-packages" => {
                    include_system_site_packages = match value {
                        "true" => true,
                        "false" => false,
                        _ => bail!("bad boolean {:?} for {}", value, key),
                    }
                }
                "interpreter-relpath" => interpreter_relpath = Some(value.to_owned()),
                "site-packages-relpath" => site_packages_relpath = Some(value.to_owned()),
                // forward compatibility
                _ => (),
            }
        }

        Ok(PyvenvCfg {
            home: home.ok_or_else(|| eyre!("missing `home` key"))?,
            include_system_site_packages,
            interpreter_relpath,
            site_packages_relpath,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("home = {}\n", self.home.display()));
        out.push_str(&format!(
            "include-system-site-packages = {}\n",
            self.include_system_site_packages
        ));
        if let Some(relpath) = &self.interpreter_relpath {
            out.push_str(&format!("interpreter-relpath = {}\n", relpath));
        }
        if let Some(relpath) = &self.site_packages_relpath {
            out.push_str(&format!("site-packages-relpath = {}\n", relpath));
        }
        out
    }
}

/// A materialized virtual environment and the layout recorded in its
/// `pyvenv.cfg`.
#[derive(Debug, Clone)]
pub struct Virtualenv {
    pub root: PathBuf,
    pub home: PathBuf,
    pub include_system_site_packages: bool,
    pub interpreter_relpath: String,
    pub site_packages_relpath: String,
}

pub fn default_interpreter_relpath() -> &'static str {
    if cfg!(windows) {
        "Scripts/python.exe"
    } else {
        "bin/python"
    }
}

/// `Lib/site-packages` on Windows; `lib/pythonX.Y/site-packages` elsewhere,
/// with a `pypy` prefix for PyPy distributions new enough to use one (older
/// PyPy keeps a bare top-level `site-packages`).
pub fn site_packages_relpath(interpreter: &Interpreter) -> String {
    if cfg!(windows) {
        return "Lib/site-packages".into();
    }
    if interpreter.is_pypy() {
        let modern = Version::parse(&interpreter.markers.implementation_version)
            .map(|v| v >= Version::from_release(vec![2, 8]))
            .unwrap_or(true);
        if !modern {
            return "site-packages".into();
        }
        return format!(
            "lib/pypy{}.{}/site-packages",
            interpreter.version.major, interpreter.version.minor
        );
    }
    format!(
        "lib/python{}.{}/site-packages",
        interpreter.version.major, interpreter.version.minor
    )
}

impl Virtualenv {
    pub fn python(&self) -> PathBuf {
        self.root.join(&self.interpreter_relpath)
    }

    pub fn bin_dir(&self) -> PathBuf {
        let relpath = Path::new(&self.interpreter_relpath);
        match relpath.parent() {
            Some(parent) => self.root.join(parent),
            None => self.root.clone(),
        }
    }

    pub fn site_packages(&self) -> PathBuf {
        self.root.join(&self.site_packages_relpath)
    }

    /// Create a bare venv at `root` for `interpreter`. Python 3 gets the
    /// interpreter link and directories directly; Python 2 goes through the
    /// embedded virtualenv.py, since it has no `venv` machinery of its own.
    pub fn create(
        interpreter: &Interpreter,
        root: &Path,
        system_site_packages: bool,
        include_pip: bool,
    ) -> Result<Virtualenv> {
        context!("creating venv at {}", root.display());
        let home = interpreter
            .canonical_python
            .parent()
            .ok_or_else(|| CzexError::UnparentedPython(interpreter.canonical_python.clone()))?
            .to_path_buf();

        let venv = Virtualenv {
            root: root.to_owned(),
            home,
            include_system_site_packages: system_site_packages,
            interpreter_relpath: default_interpreter_relpath().to_owned(),
            site_packages_relpath: site_packages_relpath(interpreter),
        };

        fs::create_dir_all(root)?;
        if interpreter.version.major < 3 {
            venv.run_embedded_virtualenv(interpreter)?;
        } else {
            venv.link_interpreter(interpreter)?;
        }
        fs::create_dir_all(venv.site_packages())?;

        let cfg = PyvenvCfg {
            home: venv.home.clone(),
            include_system_site_packages: system_site_packages,
            interpreter_relpath: Some(venv.interpreter_relpath.clone()),
            site_packages_relpath: Some(venv.site_packages_relpath.clone()),
        };
        fs::write(root.join(PYVENV_CFG), cfg.render())?;

        if include_pip && interpreter.version.major >= 3 {
            venv.ensure_pip(interpreter)?;
        }
        Ok(venv)
    }

    #[cfg(unix)]
    fn link_interpreter(&self, interpreter: &Interpreter) -> Result<()> {
        use std::os::unix::fs::symlink;

        let bin_dir = self.bin_dir();
        fs::create_dir_all(&bin_dir)?;
        symlink(&interpreter.canonical_python, self.python())?;
        let major = interpreter.version.major;
        let minor = interpreter.version.minor;
        for alias in [format!("python{major}"), format!("python{major}.{minor}")] {
            let alias_path = bin_dir.join(alias);
            if !alias_path.exists() {
                symlink("python", &alias_path)?;
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    fn link_interpreter(&self, interpreter: &Interpreter) -> Result<()> {
        let bin_dir = self.bin_dir();
        fs::create_dir_all(&bin_dir)?;
        fs::copy(&interpreter.canonical_python, self.python())?;
        Ok(())
    }

    fn run_embedded_virtualenv(&self, interpreter: &Interpreter) -> Result<()> {
        let script_path = self.root.join(".virtualenv.py");
        fs::write(&script_path, VIRTUALENV_PY)?;
        let output = Command::new(&interpreter.canonical_python)
            .arg(&script_path)
            .args(["--no-download", "--no-pip", "--no-setuptools", "--no-wheel", "."])
            .current_dir(&self.root)
            .output()
            .wrap_err_with(|| {
                format!("failed to run {}", interpreter.canonical_python.display())
            })?;
        fs::remove_file(&script_path)?;
        if !output.status.success() {
            bail!(
                "virtualenv.py failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn ensure_pip(&self, interpreter: &Interpreter) -> Result<()> {
        if !interpreter.has_ensurepip {
            bail!(
                "pip requested but {} has no ensurepip module",
                interpreter.canonical_python.display()
            );
        }
        let output = Command::new(self.python())
            .args(["-m", "ensurepip", "--default-pip"])
            .output()
            .wrap_err("failed to spawn ensurepip")?;
        if !output.status.success() {
            bail!(
                "ensurepip failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Open an existing venv. `pyvenv.cfg` must parse and its `home` must
    /// still hold a python; relpath keys written by older tools are
    /// synthesized from the resolved interpreter, the same way `create`
    /// computes them.
    pub fn load(root: &Path, interpreter: &Interpreter) -> Result<Virtualenv> {
        context!("loading venv at {}", root.display());
        let cfg_err = |reason: String| -> eyre::Report {
            CzexError::InvalidPyvenvCfgFile {
                venv: root.to_owned(),
                reason,
            }
            .into()
        };

        let text = fs::read_to_string(root.join(PYVENV_CFG))
            .map_err(|e| cfg_err(format!("unreadable: {}", e)))?;
        let cfg = PyvenvCfg::parse(&text).map_err(|e| cfg_err(e.to_string()))?;

        if !home_has_python(&cfg.home) {
            return Err(CzexError::UnparentedPython(cfg.home.clone()).into());
        }

        Ok(Virtualenv {
            root: root.to_owned(),
            home: cfg.home,
            include_system_site_packages: cfg.include_system_site_packages,
            interpreter_relpath: cfg
                .interpreter_relpath
                .unwrap_or_else(|| default_interpreter_relpath().to_owned()),
            site_packages_relpath: cfg
                .site_packages_relpath
                .unwrap_or_else(|| site_packages_relpath(interpreter)),
        })
    }
}

fn home_has_python(home: &Path) -> bool {
    if !home.is_dir() {
        return false;
    }
    let Ok(entries) = fs::read_dir(home) else {
        return false;
    };
    entries.filter_map(|e| e.ok()).any(|entry| {
        entry
            .file_name()
            .to_str()
            .map(|name| {
                name == "python"
                    || name == "python.exe"
                    || name.starts_with("python2")
                    || name.starts_with("python3")
                    || name.starts_with("pypy")
            })
            .unwrap_or(false)
    })
}
