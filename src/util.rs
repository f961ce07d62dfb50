use crate::prelude::*;
use std::io;
use std::path::{Path, PathBuf};

/// Work around an annoyance in Rust's standard traits -- if you define
/// TryFrom<&str>, then you probably also want TryFrom<String> and FromStr,
/// and the implementation is trivial in terms of TryFrom<&str>. So this macro
/// just generates the boilerplate for you.
#[macro_export]
macro_rules! try_from_str_boilerplate {
    ($name:ident) => {
        impl std::convert::TryFrom<String> for $name {
            type Error = eyre::Report;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                (&*s).try_into()
            }
        }

        impl std::str::FromStr for $name {
            type Err = eyre::Report;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.try_into()
            }
        }
    };
}

// fs2's lock functions on Unix are thin wrappers around flock(2), and in
// particular don't handle EINTR.
pub fn retry_interrupted<F>(mut f: F) -> io::Result<()>
where
    F: FnMut() -> io::Result<()>,
{
    loop {
        match f() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// Owner for the scratch directories one operation allocates. Everything is
/// deleted when the collector goes out of scope, except directories that were
/// explicitly kept.
///
/// Scratch space lands wherever `TMPDIR`/`TEMP`/`TMP` point, unless the caller
/// asks for a specific parent (which create_atomic does, so that its final
/// rename never crosses a filesystem boundary).
pub struct TempDirs {
    dirs: Vec<tempfile::TempDir>,
}

impl TempDirs {
    pub fn new() -> TempDirs {
        TempDirs { dirs: vec![] }
    }

    pub fn create(&mut self, prefix: &str) -> Result<PathBuf> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir().map_err(|e| {
            CzexError::NonUnique {
                dir: std::env::temp_dir(),
                reason: e.to_string(),
            }
        })?;
        let path = dir.path().to_path_buf();
        self.dirs.push(dir);
        Ok(path)
    }

    pub fn create_in(&mut self, base: &Path, prefix: &str) -> Result<PathBuf> {
        let non_unique = |e: &std::io::Error| CzexError::NonUnique {
            dir: base.to_owned(),
            reason: e.to_string(),
        };
        std::fs::create_dir_all(base).map_err(|e| non_unique(&e))?;
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(base)
            .map_err(|e| non_unique(&e))?;
        let path = dir.path().to_path_buf();
        self.dirs.push(dir);
        Ok(path)
    }

    /// Detach `path` from the collector so it survives scope exit. Returns
    /// false if the collector doesn't own `path`.
    pub fn keep(&mut self, path: &Path) -> bool {
        match self.dirs.iter().position(|d| d.path() == path) {
            Some(i) => {
                let _ = self.dirs.remove(i).into_path();
                true
            }
            None => false,
        }
    }
}

impl Default for TempDirs {
    fn default() -> Self {
        TempDirs::new()
    }
}
