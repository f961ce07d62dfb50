use crate::cachedir::{urlsafe_b64, CacheRoot};
use crate::installer::{VenvPex, MAIN_PY};
use crate::interpreter::Interpreter;
use crate::pex_info::PexInfo;
use crate::prelude::*;
use crate::venv::Virtualenv;
use crate::archive::Archive;
use std::ffi::OsString;
use std::path::Path;

/// The venv cache key: the archive identity (27 chars of base64'd pex_hash)
/// joined with a short interpreter fingerprint, so that two pythons
/// installing the same archive never share an entry.
fn venv_cache_key(pex_info: &PexInfo, interpreter: &Interpreter) -> Result<String> {
    let hash = pex_info.pex_hash_bytes()?.ok_or_else(|| {
        eyre!("archive manifest has no pex_hash; refusing to cache a venv for it")
    })?;
    let fingerprint = interpreter.fingerprint();
    Ok(format!("{}-{}", urlsafe_b64(&hash), &fingerprint[..8]))
}

/// Identify the interpreter, read the manifest, and create (or reuse) the
/// fully installed venv for this `(archive, interpreter)` pair. Returns the
/// venv and whether this call built it.
pub fn ensure_venv(
    cache: &CacheRoot,
    python: &Path,
    archive_path: &Path,
) -> Result<(Virtualenv, bool)> {
    let interpreter = Interpreter::identify(cache, python)?;

    let mut archive = Archive::open(archive_path)?;
    let raw = archive
        .entry_bytes(PexInfo::ENTRY_NAME)?
        .ok_or(CzexError::PexInfoNotFound)?;
    let pex_info = PexInfo::from_bytes(&raw)?;

    let constraints = pex_info.constraints();
    if !constraints.is_empty() {
        let version = interpreter.python_full_version()?;
        if !constraints.satisfied_by(interpreter.implementation(), &version)? {
            bail!(
                "{} is {} {}, which satisfies none of the archive's interpreter \
                 constraints ({})",
                python.display(),
                interpreter.implementation(),
                version,
                pex_info
                    .interpreter_constraints
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>()
                    .join(" OR "),
            );
        }
    }

    let key = venv_cache_key(&pex_info, &interpreter)?;
    let mut entry = cache.venv_entry(&key);
    let dest = entry.path().to_owned();
    let built = entry.create_atomic(
        (&mut archive, &pex_info, &interpreter),
        |scratch, _, (archive, pex_info, interpreter)| {
            VenvPex::new(archive, pex_info, interpreter).install(&dest, scratch)?;
            Ok(())
        },
    )?;
    if built {
        info!("installed venv {}", dest.display());
    } else {
        debug!("reusing venv {}", dest.display());
    }

    let venv = Virtualenv::load(&dest, &interpreter)?;
    Ok((venv, built))
}

/// The whole pipeline: materialize the venv, then hand control to its
/// python. On POSIX this process is replaced outright; on Windows we spawn,
/// wait, and translate the child's fate into an exit code.
pub fn boot(
    cache: &CacheRoot,
    python: &Path,
    archive_path: &Path,
    args: &[OsString],
) -> Result<i32> {
    let (venv, _) = ensure_venv(cache, python, archive_path)?;
    let venv_python = venv.python();
    let main_py = venv.root.join(MAIN_PY);
    hand_off(&venv_python, &main_py, args)
}

#[cfg(unix)]
fn hand_off(venv_python: &Path, main_py: &Path, args: &[OsString]) -> Result<i32> {
    use std::os::unix::process::CommandExt;

    // only returns on failure
    let err = std::process::Command::new(venv_python)
        .arg(main_py)
        .args(args)
        .exec();
    Err(eyre!("failed to exec {}: {}", venv_python.display(), err))
}

#[cfg(windows)]
fn hand_off(venv_python: &Path, main_py: &Path, args: &[OsString]) -> Result<i32> {
    // a crash gets its own sentinel; other NTSTATUS-style terminations
    // another, so callers can tell them from ordinary exit codes
    const EXIT_CRASHED: i32 = -75;
    const EXIT_ABNORMAL: i32 = -76;

    let status = std::process::Command::new(venv_python)
        .arg(main_py)
        .args(args)
        .status()
        .wrap_err_with(|| format!("failed to spawn {}", venv_python.display()))?;
    Ok(match status.code() {
        Some(code) if (code as u32) == 0xC000_0005 => EXIT_CRASHED,
        Some(code) if (code as u32) & 0xC000_0000 == 0xC000_0000 => EXIT_ABNORMAL,
        Some(code) => code,
        // terminated without an exit code; the closest POSIX analogue is
        // death-by-signal
        None => -1,
    })
}
