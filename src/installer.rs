use crate::interpreter::Interpreter;
use crate::pex_info::{PexInfo, WheelLayout};
use crate::prelude::*;
use crate::venv::Virtualenv;
use crate::archive::{Archive, ExtractOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

const LAUNCHER_BODY: &str = include_str!("data-files/venv_pex.py");
const REPL_BODY: &str = include_str!("data-files/venv_pex_repl.py");
pub const DEPS_DIR: &str = ".deps";
pub const MAIN_PY: &str = "__main__.py";
pub const PEX_ALIAS: &str = "pex";
pub const REPL_NAME: &str = "pex-repl";

/// A wheel that survived tag selection, plus whatever its `.layout.json`
/// told us about a relocatable stash.
#[derive(Debug, Clone)]
pub struct SelectedWheel {
    pub filename: String,
    pub name: WheelName,
    pub stash_dir: Option<String>,
}

/// Turns `(archive, interpreter)` into a fully installed venv tree. The
/// caller provides the scratch directory to build into (`work_dir`) and the
/// path the venv will eventually live at (`dest_path`); every emitted shebang
/// and launcher refers to the final location, never the scratch.
pub struct VenvPex<'a> {
    archive: &'a mut Archive,
    pex_info: &'a PexInfo,
    interpreter: &'a Interpreter,
}

impl<'a> VenvPex<'a> {
    pub fn new(
        archive: &'a mut Archive,
        pex_info: &'a PexInfo,
        interpreter: &'a Interpreter,
    ) -> VenvPex<'a> {
        VenvPex {
            archive,
            pex_info,
            interpreter,
        }
    }

    /// Wheels from the manifest that this interpreter can use: at least one
    /// of the wheel's tags must rank. None means the manifest lists no
    /// distributions at all.
    pub fn select_wheels(&mut self) -> Result<Option<Vec<SelectedWheel>>> {
        if self.pex_info.distributions.is_empty() {
            return Ok(None);
        }
        let ranked = self.interpreter.ranked_tags();
        let mut selected = Vec::new();
        for filename in self.pex_info.distributions.keys() {
            let name: WheelName = filename.as_str().try_into()?;
            if ranked.wheel_rank(&name).is_none() {
                debug!("skipping {} (no compatible tag)", filename);
                continue;
            }
            let layout_entry =
                format!("{}/{}/{}", DEPS_DIR, filename, WheelLayout::FILE_NAME);
            let stash_dir = match self.archive.entry_bytes(&layout_entry)? {
                Some(raw) => WheelLayout::from_bytes(&raw)?.stash_dir,
                None => None,
            };
            selected.push(SelectedWheel {
                filename: filename.clone(),
                name,
                stash_dir,
            });
        }
        Ok(Some(selected))
    }

    /// The whole state machine: venv, extract, spread, cleanup, shebangs,
    /// launchers, manifest. Runs inside create_atomic, so a failure anywhere
    /// aborts the publication and leaves no trace.
    pub fn install(&mut self, dest_path: &Path, work_dir: &Path) -> Result<Virtualenv> {
        context!("installing venv for {}", self.archive.path().display());
        let venv = Virtualenv::create(
            self.interpreter,
            work_dir,
            self.pex_info.venv_system_site_packages,
            false,
        )?;

        if let Some(wheels) = self.select_wheels()? {
            self.extract_wheels(&venv, &wheels)?;
            spread_wheels(&venv, &wheels)?;
            let deps_root = venv.site_packages().join(DEPS_DIR);
            if deps_root.is_dir() {
                fs::remove_dir_all(&deps_root)?;
            }
        }

        rewrite_shebangs(&venv, dest_path)?;
        self.emit_main(&venv, dest_path)?;
        self.emit_repl(&venv, dest_path)?;

        // last: by the time the manifest lands, every wheel has been spread
        fs::write(work_dir.join(PexInfo::ENTRY_NAME), self.pex_info.raw())?;
        Ok(venv)
    }

    fn extract_wheels(&mut self, venv: &Virtualenv, wheels: &[SelectedWheel]) -> Result<()> {
        let prefixes: Vec<String> = wheels
            .iter()
            .map(|w| format!("{}/{}/", DEPS_DIR, w.filename))
            .collect();
        self.archive.parallel_extract(
            &venv.site_packages(),
            |name| prefixes.iter().any(|prefix| name.starts_with(prefix)),
            &ExtractOptions::default(),
        )
    }

    fn final_python(&self, venv: &Virtualenv, dest_path: &Path) -> PathBuf {
        dest_path.join(&venv.interpreter_relpath)
    }

    fn final_bin_dir(&self, venv: &Virtualenv, dest_path: &Path) -> PathBuf {
        match Path::new(&venv.interpreter_relpath).parent() {
            Some(parent) => dest_path.join(parent),
            None => dest_path.to_owned(),
        }
    }

    fn emit_main(&self, venv: &Virtualenv, dest_path: &Path) -> Result<()> {
        let info = self.pex_info;
        let prologue = format!(
            "#!{}\n",
            self.final_python(venv, dest_path).display()
        );
        let epilogue = indoc::formatdoc! {r#"

                if __name__ == "__main__":
                    sys.exit(
                        boot(
                            shebang_python={},
                            venv_bin_dir={},
                            bin_path={},
                            strip_pex_env={},
                            inject_env={},
                            inject_args={},
                            entry_point={},
                            script={},
                            hermetic_re_exec={},
                        )
                    )
            "#,
            py_str(&self.final_python(venv, dest_path).to_string_lossy()),
            py_str(&self.final_bin_dir(venv, dest_path).to_string_lossy()),
            py_str(&info.venv_bin_path.to_string()),
            py_bool(info.strip_pex_env),
            py_dict(info.inject_env.iter()),
            py_list(&info.inject_args),
            py_opt(info.entry_point.as_deref()),
            py_opt(info.script.as_deref()),
            py_bool(info.venv_hermetic_scripts),
        };

        let main_path = venv.root.join(MAIN_PY);
        write_executable(
            &main_path,
            format!("{}{}{}", prologue, LAUNCHER_BODY, epilogue).as_bytes(),
        )?;

        let alias = venv.root.join(PEX_ALIAS);
        #[cfg(unix)]
        std::os::unix::fs::symlink(MAIN_PY, &alias)?;
        #[cfg(not(unix))]
        fs::copy(&main_path, &alias)?;
        Ok(())
    }

    fn emit_repl(&self, venv: &Virtualenv, dest_path: &Path) -> Result<()> {
        let info = self.pex_info;
        let env = &self.interpreter.markers;

        // requirements whose markers hold in this venv's interpreter
        let mut active = Vec::new();
        for requirement in &info.requirements {
            let applies = match requirement.split_once(';') {
                Some((_, marker_text)) => marker::Expr::parse(marker_text)
                    .and_then(|expr| expr.eval(env))
                    .unwrap_or_else(|err| {
                        warn!("cannot evaluate marker on {:?}: {}", requirement, err);
                        true
                    }),
                None => true,
            };
            if applies {
                active.push(requirement.clone());
            }
        }

        let banner = format!(
            "czex {} venv REPL ({} of {} requirements active)",
            env!("CARGO_PKG_VERSION"),
            active.len(),
            info.requirements.len(),
        );
        let mut details = format!("venv: {}\n", dest_path.display());
        for requirement in &active {
            details.push_str(&format!("  {}\n", requirement));
        }

        let prologue = format!(
            "#!{}\n",
            self.final_python(venv, dest_path).display()
        );
        let epilogue = indoc::formatdoc! {r#"

                if __name__ == "__main__":
                    sys.exit(repl({}, {}, {}, {}))
            "#,
            py_str(">>> "),
            py_str("... "),
            py_str(&banner),
            py_str(&details),
        };
        write_executable(
            &venv.root.join(REPL_NAME),
            format!("{}{}{}", prologue, REPL_BODY, epilogue).as_bytes(),
        )
    }
}

fn write_executable(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Move the extracted wheel trees from `<site-packages>/.deps/<wheel>/` into
/// their final shape, one worker per CPU (capped by wheel count). Workers
/// touch disjoint wheel directories; the only shared state is the error slot.
fn spread_wheels(venv: &Virtualenv, wheels: &[SelectedWheel]) -> Result<()> {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = available.min(wheels.len());
    if workers < 2 {
        for wheel in wheels {
            spread_wheel(venv, wheel)?;
        }
        return Ok(());
    }

    let error_slot = AtomicI32::new(0);
    let results = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let error_slot = &error_slot;
                scope.spawn(move || -> Result<()> {
                    for wheel in wheels.iter().skip(worker).step_by(workers) {
                        if error_slot.load(Ordering::SeqCst) != 0 {
                            return Ok(());
                        }
                        if let Err(err) = spread_wheel(venv, wheel) {
                            let code = err
                                .downcast_ref::<CzexError>()
                                .map(CzexError::code)
                                .unwrap_or(1);
                            let _ = error_slot.compare_exchange(
                                0,
                                code,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            );
                            return Err(err);
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("spread worker panicked"))
            .collect::<Vec<_>>()
    });
    for result in results {
        result?;
    }
    Ok(())
}

fn spread_wheel(venv: &Virtualenv, wheel: &SelectedWheel) -> Result<()> {
    context!("spreading {}", wheel.filename);
    let wheel_dir = venv.site_packages().join(DEPS_DIR).join(&wheel.filename);
    if !wheel_dir.is_dir() {
        // wheel listed in the manifest but absent from the archive
        bail!("archive has no {}/{} tree", DEPS_DIR, wheel.filename);
    }
    let site_packages = venv.site_packages();
    for entry in fs::read_dir(&wheel_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_str() == Some(WheelLayout::FILE_NAME) {
            continue;
        }
        let is_stash = match &wheel.stash_dir {
            Some(stash) => file_name.to_str() == Some(stash.as_str()),
            None => false,
        };
        if is_stash && entry.path().is_dir() {
            // relocate the stash relative to the venv root
            merge_move(&entry.path(), &venv.root)?;
            fs::remove_dir_all(entry.path())?;
        } else {
            merge_move_entry(&entry.path(), &site_packages.join(&file_name))?;
        }
    }
    Ok(())
}

/// Merge the contents of `src` into the directory `dest`: files move,
/// directories are created and merged recursively.
fn merge_move(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        merge_move_entry(&entry.path(), &dest.join(entry.file_name()))?;
    }
    Ok(())
}

fn merge_move_entry(src: &Path, dest: &Path) -> Result<()> {
    if src.is_dir() {
        if dest.is_dir() {
            merge_move(src, dest)?;
            fs::remove_dir_all(src)?;
        } else {
            fs::rename(src, dest)?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dest)?;
    }
    Ok(())
}

/// Rewrite `#!python` placeholder shebangs in the venv's bin directory to
/// the final interpreter path, atomically per file (write a `.rewrite`
/// sibling, mark it executable, rename it over). Anything that doesn't carry
/// the placeholder is left alone.
#[cfg(unix)]
fn rewrite_shebangs(venv: &Virtualenv, dest_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let bin_dir = venv.bin_dir();
    if !bin_dir.is_dir() {
        return Ok(());
    }
    let shebang = format!(
        "#!{}",
        dest_path.join(&venv.interpreter_relpath).display()
    );

    for entry in fs::read_dir(&bin_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let data = fs::read(&path)?;
        let Some(first_newline) = data.iter().position(|&b| b == b'\n') else {
            continue;
        };
        let (first_line, rest) = data.split_at(first_newline);
        let (first_line, had_cr) = match first_line.strip_suffix(b"\r") {
            Some(stripped) => (stripped, true),
            None => (first_line, false),
        };
        if first_line != b"#!python" {
            continue;
        }

        context!("rewriting shebang of {}", path.display());
        let mut rewritten = Vec::with_capacity(data.len() + shebang.len());
        rewritten.extend_from_slice(shebang.as_bytes());
        if had_cr {
            rewritten.push(b'\r');
        }
        rewritten.extend_from_slice(rest);

        let file_name = entry.file_name();
        let tmp_path = bin_dir.join(format!(".{}.rewrite", file_name.to_string_lossy()));
        fs::write(&tmp_path, &rewritten)?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o755))?;
        fs::rename(&tmp_path, &path)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn rewrite_shebangs(_venv: &Virtualenv, _dest_path: &Path) -> Result<()> {
    Ok(())
}

// Python literal rendering for the generated boot(...) call and REPL prelude.

fn py_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

fn py_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

fn py_opt(value: Option<&str>) -> String {
    match value {
        Some(value) => py_str(value),
        None => "None".to_owned(),
    }
}

fn py_list(values: &[String]) -> String {
    let rendered: Vec<String> = values.iter().map(|v| py_str(v)).collect();
    format!("[{}]", rendered.join(", "))
}

fn py_dict<'a, I>(entries: I) -> String
where
    I: Iterator<Item = (&'a String, &'a String)>,
{
    let rendered: Vec<String> = entries
        .map(|(k, v)| format!("{}: {}", py_str(k), py_str(v)))
        .collect();
    format!("{{{}}}", rendered.join(", "))
}
