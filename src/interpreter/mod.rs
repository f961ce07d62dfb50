use crate::cachedir::{sha256, urlsafe_b64, CacheRoot};
use crate::prelude::*;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

#[cfg(target_os = "linux")]
pub mod linux;

// The probe script is an opaque blob; its contract is just "writes the
// descriptor to the path it's given, as JSON".
const PROBE_SCRIPT: &str = include_str!("../data-files/interpreter.py");
pub const INFO_FILE: &str = "info.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
    pub releaselevel: String,
}

impl Display for PythonVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// Everything we know about one python executable, as reported by the probe
/// script. Serialized verbatim as the cache's `info.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interpreter {
    pub python: PathBuf,
    pub canonical_python: PathBuf,
    pub prefix: PathBuf,
    pub base_prefix: PathBuf,
    pub version: PythonVersion,
    pub markers: MarkerEnvironment,
    #[serde(default)]
    pub is_framework: bool,
    #[serde(default)]
    pub has_ensurepip: bool,
    /// Most preferred first; order is rank.
    pub supported_tags: Vec<Tag>,
}

/// The path as the user named it, made absolute without resolving symlinks:
/// the descriptor records the invoked path and the symlink-resolved path as
/// two separate facts, and the cache is keyed by the former.
fn absolutize(python: &Path) -> Result<PathBuf> {
    if python.is_absolute() {
        Ok(python.to_owned())
    } else {
        Ok(std::env::current_dir()?.join(python))
    }
}

impl Interpreter {
    /// Identify `python`, reusing the cached descriptor when one exists.
    /// The cache entry is keyed by the absolute executable path and
    /// published atomically, so concurrent bootstraps probe at most once.
    pub fn identify(cache: &CacheRoot, python: &Path) -> Result<Interpreter> {
        context!("identifying {}", python.display());
        let ident_err = |reason: String| -> eyre::Report {
            CzexError::InterpreterIdentification {
                python: python.to_owned(),
                reason,
            }
            .into()
        };

        let absolute = absolutize(python)
            .map_err(|e| ident_err(format!("cannot make path absolute: {}", e)))?;
        let mut entry = cache.interpreter_entry(&absolute);
        entry.create_atomic(&absolute, |scratch, _, absolute| {
            run_probe(absolute, scratch)
        })?;

        let raw = fs::read(entry.path().join(INFO_FILE))
            .map_err(|e| ident_err(format!("cached descriptor unreadable: {}", e)))?;
        let interpreter: Interpreter = serde_json::from_slice(&raw)
            .map_err(|e| ident_err(format!("cached descriptor corrupt: {}", e)))?;
        Ok(interpreter)
    }

    pub fn implementation(&self) -> &str {
        &self.markers.platform_python_implementation
    }

    pub fn is_pypy(&self) -> bool {
        self.implementation().eq_ignore_ascii_case("pypy")
    }

    /// The probe's `python_full_version` marker, as a [`Version`]. A probe
    /// that reported something unparseable is a broken interpreter, not a
    /// bad user input, and errors accordingly.
    pub fn python_full_version(&self) -> Result<Version> {
        Version::parse(&self.markers.python_full_version).map_err(|e| {
            CzexError::VersionParse {
                python: self.canonical_python.clone(),
                version: self.markers.python_full_version.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    pub fn ranked_tags(&self) -> RankedTags {
        RankedTags::from_ordered(&self.supported_tags)
    }

    /// Key material distinguishing venvs built by different interpreters.
    pub fn fingerprint(&self) -> String {
        let mut material = self.canonical_python.to_string_lossy().into_owned();
        material.push('\0');
        material.push_str(&self.markers.python_full_version);
        urlsafe_b64(&sha256(material.as_bytes()))
    }
}

fn run_probe(python: &Path, scratch: &Path) -> Result<()> {
    let ident_err = |reason: String| -> eyre::Report {
        CzexError::InterpreterIdentification {
            python: python.to_owned(),
            reason,
        }
        .into()
    };

    let mut cmd = Command::new(python);
    cmd.arg("-sE")
        .arg("-c")
        .arg(PROBE_SCRIPT)
        .arg(INFO_FILE)
        .current_dir(scratch);

    #[cfg(target_os = "linux")]
    match linux::detect(python) {
        Ok(Some(info)) => {
            cmd.arg("--linux-info").arg(serde_json::to_string(&info)?);
        }
        Ok(None) => (),
        Err(err) => {
            // a probe without libc info still produces a usable descriptor
            warn!("could not detect libc for {}: {}", python.display(), err);
        }
    }

    let output = cmd
        .output()
        .map_err(|e| ident_err(format!("failed to spawn: {}", e)))?;
    if !output.status.success() {
        return Err(ident_err(format!(
            "probe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if !scratch.join(INFO_FILE).is_file() {
        return Err(ident_err("probe wrote no descriptor".into()));
    }
    Ok(())
}

/// The newest 3.x minor among some descriptors; feeds the version bound of
/// `InterpreterConstraints::matching_versions`.
pub fn newest_minor<'a, I>(interpreters: I) -> Option<u32>
where
    I: IntoIterator<Item = &'a Interpreter>,
{
    interpreters
        .into_iter()
        .filter(|i| i.version.major == 3)
        .map(|i| i.version.minor)
        .max()
}

#[cfg(unix)]
fn looks_like_python(name: &str) -> bool {
    // `python`, `pypy`, `python3`, `python3.12`, `pypy2.7`, ... but not the
    // assorted neighbors: `python3-config`, `python.py` shims, etc.
    if name.ends_with("-config") || name.ends_with(".py") {
        return false;
    }
    static PYTHON_NAME_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(?:python|pypy)(?:[0-9](?:\.[0-9][0-9]?)?)?$").unwrap());
    PYTHON_NAME_RE.is_match(name)
}

#[cfg(windows)]
fn looks_like_python(name: &str) -> bool {
    static PYTHON_NAME_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i-u)^(?:python|pypy)w?\.exe$").unwrap());
    PYTHON_NAME_RE.is_match(name)
}

#[cfg(unix)]
fn is_runnable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return false;
    }
    // skip shell wrappers
    let mut magic = [0u8; 2];
    match fs::File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => &magic != b"#!",
        Err(_) => false,
    }
}

#[cfg(windows)]
fn is_runnable(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// The files on a PATH-like list that plausibly are python executables, in
/// PATH order. Identification happens later, one candidate at a time.
pub fn search_path_candidates(search_path: &OsStr) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for dir in std::env::split_paths(search_path) {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut in_dir: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(looks_like_python)
                    .unwrap_or(false)
            })
            .filter(|path| is_runnable(path))
            .collect();
        in_dir.sort();
        candidates.extend(in_dir);
    }
    candidates
}

/// Walk a search path and yield a descriptor per identifiable python.
/// Candidates that fail to probe are logged and skipped; duplicates (the same
/// interpreter reached through different names) are the caller's problem.
pub struct InterpreterIter<'a> {
    cache: &'a CacheRoot,
    candidates: std::vec::IntoIter<PathBuf>,
}

impl<'a> InterpreterIter<'a> {
    pub fn from_search_path(
        cache: &'a CacheRoot,
        search_path: Option<OsString>,
    ) -> Result<InterpreterIter<'a>> {
        let search_path = match search_path.or_else(|| std::env::var_os("PATH")) {
            Some(path) if !path.is_empty() => path,
            _ => return Err(CzexError::NoSearchPath.into()),
        };
        Ok(InterpreterIter {
            cache,
            candidates: search_path_candidates(&search_path).into_iter(),
        })
    }
}

impl<'a> Iterator for InterpreterIter<'a> {
    type Item = Interpreter;

    fn next(&mut self) -> Option<Interpreter> {
        loop {
            let candidate = self.candidates.next()?;
            match Interpreter::identify(self.cache, &candidate) {
                Ok(interpreter) => return Some(interpreter),
                Err(err) => {
                    warn!("skipping {}: {}", candidate.display(), err);
                }
            }
        }
    }
}
