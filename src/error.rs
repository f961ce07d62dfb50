use std::path::PathBuf;
use thiserror::Error;

/// The failures callers may want to tell apart. Parsing errors are reported
/// to the caller, who decides whether to skip the input or abort; everything
/// else is fatal to the operation that hit it.
#[derive(Error, Debug)]
pub enum CzexError {
    #[error("invalid version {0:?}")]
    InvalidVersion(String),
    #[error("invalid comparison operator {0:?}")]
    InvalidOperator(String),
    #[error("invalid specifier clause {clause:?}: {reason}")]
    InvalidSpecifierClause { clause: String, reason: String },
    #[error("unknown python implementation {0:?} (expected CPython or PyPy)")]
    InvalidPythonImpl(String),
    #[error("invalid wheel filename {name:?}: {reason}")]
    InvalidWheelName { name: String, reason: String },

    #[error("archive has no PEX-INFO entry")]
    PexInfoNotFound,
    #[error("invalid pyvenv.cfg in {venv}: {reason}")]
    InvalidPyvenvCfgFile { venv: PathBuf, reason: String },
    #[error("python executable {0} has no parent directory")]
    UnparentedPython(PathBuf),

    #[error("failed to read archive directory of {path}: {reason}")]
    ZipOpen { path: PathBuf, reason: String },
    #[error("archive has no entry named {0:?}")]
    ZipEntryNotFound(String),
    #[error("bad metadata for archive entry {name:?}: {reason}")]
    ZipEntryMetadata { name: String, reason: String },
    #[error("failed to open archive file {path}: {reason}")]
    ZipFileOpen { path: PathBuf, reason: String },
    #[error("failed extracting archive entry {name:?}: {reason}")]
    ZipFileRead { name: String, reason: String },
    #[error("archive entry {name:?} is too large ({size} bytes)")]
    ZipEntryTooLarge { name: String, size: u64 },

    #[error("failed to identify python at {python}: {reason}")]
    InterpreterIdentification { python: PathBuf, reason: String },
    #[error("python at {python} reported an unparseable version {version:?}: {reason}")]
    VersionParse {
        python: PathBuf,
        version: String,
        reason: String,
    },
    #[error("no usable search path for python interpreters")]
    NoSearchPath,
    #[error("could not allocate a unique scratch directory under {dir}: {reason}")]
    NonUnique { dir: PathBuf, reason: String },
}

impl CzexError {
    /// Nonzero code for the parallel extractor's shared error slot. The slot
    /// only needs to tell workers "someone already failed"; the main thread
    /// reports the real error.
    pub fn code(&self) -> i32 {
        use CzexError::*;
        match self {
            ZipOpen { .. } => 10,
            ZipEntryNotFound(..) => 11,
            ZipEntryMetadata { .. } => 12,
            ZipFileOpen { .. } => 13,
            ZipFileRead { .. } => 14,
            ZipEntryTooLarge { .. } => 15,
            _ => 1,
        }
    }
}
