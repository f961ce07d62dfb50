use crate::prelude::*;
use crate::util::{retry_interrupted, TempDirs};
use fs2::FileExt;
use ring::digest;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

// On-disk layout:
//
//   <cache_root>/
//     interpreters/0/<b64(sha256(python path))>/info.json
//     venvs/0/<b64(pex_hash)>-<interpreter fingerprint>/...
//
// The scheme digit exists so a future incompatible layout can live alongside
// this one. Each entry directory has an advisory lock file BESIDE it
// (`<entry>.lock` in the parent): publication has to be a single rename onto
// a name that doesn't exist yet, and a failed build has to leave nothing
// behind, so the lock can't live inside the entry itself.
pub const CACHE_SCHEME: &str = "0";

pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

pub fn urlsafe_b64(data: &[u8]) -> String {
    data_encoding::BASE64URL_NOPAD.encode(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Shared,
    Exclusive,
}

/// A cache directory entry: a path, plus an optional advisory lock with the
/// monotonic-or-downgrading state machine around it. Multiple readers hold
/// the shared lock on a published entry; exactly one writer holds the
/// exclusive lock while building one.
pub struct CacheDir {
    path: PathBuf,
    lock: Option<File>,
    state: LockState,
}

impl CacheDir {
    pub fn new(path: PathBuf) -> CacheDir {
        CacheDir {
            path,
            lock: None,
            state: LockState::Unlocked,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// A sub-directory reference: same allocation scheme, no lock state.
    pub fn join(&self, parts: &[&str]) -> CacheDir {
        let mut path = self.path.clone();
        for part in parts {
            path.push(part);
        }
        CacheDir::new(path)
    }

    fn lock_path(&self) -> Result<PathBuf> {
        let mut basename = self
            .path
            .file_name()
            .ok_or_else(|| eyre!("cache path {} has no file name", self.path.display()))?
            .to_os_string();
        basename.push(".lock");
        Ok(self.path.with_file_name(basename))
    }

    fn open_lock_file(&self) -> Result<File> {
        let lock_path = self.lock_path()?;
        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir)
                .wrap_err_with(|| format!("failed to create directory {}", dir.display()))?;
        }
        // On Windows, the lock file must be opened in write mode -- append
        // mode isn't good enough.
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&lock_path)
            .wrap_err_with(|| format!("failed to open lock file {}", lock_path.display()))?;
        Ok(file)
    }

    /// Acquire (or keep) a shared lock. Exclusive holders downgrade, which is
    /// atomic from the caller's perspective. Returns whether the state
    /// changed.
    pub fn read_lock(&mut self) -> Result<bool> {
        match self.state {
            LockState::Shared => Ok(false),
            LockState::Unlocked => {
                let file = self.open_lock_file()?;
                retry_interrupted(|| file.lock_shared())?;
                self.lock = Some(file);
                self.state = LockState::Shared;
                Ok(true)
            }
            LockState::Exclusive => {
                // flock downgrades in place
                let file = self.lock.as_ref().expect("exclusive lock must have a file");
                retry_interrupted(|| file.lock_shared())?;
                self.state = LockState::Shared;
                Ok(true)
            }
        }
    }

    /// Acquire (or keep) an exclusive lock. Upgrading from shared may release
    /// the lock briefly, so callers must re-check anything they learned under
    /// the shared lock. Returns whether the state changed.
    pub fn write_lock(&mut self) -> Result<bool> {
        match self.state {
            LockState::Exclusive => Ok(false),
            LockState::Unlocked => {
                let file = self.open_lock_file()?;
                retry_interrupted(|| file.lock_exclusive())?;
                self.lock = Some(file);
                self.state = LockState::Exclusive;
                Ok(true)
            }
            LockState::Shared => {
                let file = self.lock.as_ref().expect("shared lock must have a file");
                retry_interrupted(|| file.unlock())?;
                retry_interrupted(|| file.lock_exclusive())?;
                self.state = LockState::Exclusive;
                Ok(true)
            }
        }
    }

    /// Drop the lock and close its file handle.
    pub fn unlock(&mut self) -> Result<()> {
        if let Some(file) = self.lock.take() {
            retry_interrupted(|| file.unlock())?;
        }
        self.state = LockState::Unlocked;
        Ok(())
    }

    /// Create-or-reuse. Under the exclusive lock: if the entry is already
    /// published, downgrade and report reuse. Otherwise build into a scratch
    /// sibling and publish it with one rename -- readers see the whole tree
    /// or nothing. A failed build removes the scratch and leaves no entry. A
    /// concurrent publisher winning the race is fine; the loser's scratch is
    /// discarded. Returns true if this call built the entry.
    pub fn create_atomic<Ctx, F>(&mut self, ctx: Ctx, build_fn: F) -> Result<bool>
    where
        F: FnOnce(&Path, &mut TempDirs, Ctx) -> Result<()>,
    {
        context!("materializing {}", self.path.display());
        self.write_lock()?;
        if self.path.is_dir() {
            self.read_lock()?;
            return Ok(false);
        }

        let parent = self
            .path
            .parent()
            .ok_or_else(|| eyre!("cache path {} has no parent", self.path.display()))?;
        let mut temp_dirs = TempDirs::new();
        // sibling of the final name, so the rename can't cross filesystems
        let scratch = temp_dirs.create_in(parent, ".work-")?;

        if let Err(err) = build_fn(&scratch, &mut temp_dirs, ctx) {
            // temp_dirs cleans the scratch up on drop
            self.unlock()?;
            return Err(err);
        }

        temp_dirs.keep(&scratch);
        if let Err(rename_err) = fs::rename(&scratch, &self.path) {
            let _ = fs::remove_dir_all(&scratch);
            if !self.path.is_dir() {
                self.unlock()?;
                return Err(eyre!(
                    "failed to publish {}: {}",
                    self.path.display(),
                    rename_err
                ));
            }
            // somebody else published while we weren't holding the lock
            // continuously (shared->exclusive upgrades release briefly)
        }

        self.read_lock()?;
        Ok(true)
    }
}

impl Drop for CacheDir {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

/// The root of the on-disk cache; hands out [`CacheDir`] entries for venvs
/// and interpreter descriptors.
pub struct CacheRoot {
    base: PathBuf,
}

impl CacheRoot {
    pub fn new(base: PathBuf) -> CacheRoot {
        CacheRoot { base }
    }

    /// `CZEX_CACHE_ROOT` if set, else the platform cache directory.
    pub fn from_env() -> CacheRoot {
        let base = match std::env::var_os("CZEX_CACHE_ROOT") {
            Some(base) if !base.is_empty() => PathBuf::from(base),
            _ => PROJECT_DIRS.cache_dir().to_path_buf(),
        };
        CacheRoot::new(base)
    }

    pub fn path(&self) -> &Path {
        &self.base
    }

    pub fn venv_entry(&self, key: &str) -> CacheDir {
        CacheDir::new(self.base.join("venvs").join(CACHE_SCHEME).join(key))
    }

    pub fn interpreter_entry(&self, python: &Path) -> CacheDir {
        let key = urlsafe_b64(&sha256(python.as_os_str().to_string_lossy().as_bytes()));
        CacheDir::new(
            self.base
                .join("interpreters")
                .join(CACHE_SCHEME)
                .join(key),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lock_state_transitions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = CacheDir::new(tmp.path().join("entry"));
        assert_eq!(dir.state(), LockState::Unlocked);

        // unlocked -> shared
        assert!(dir.read_lock().unwrap());
        assert_eq!(dir.state(), LockState::Shared);
        // shared -> shared is a no-op
        assert!(!dir.read_lock().unwrap());
        // shared -> exclusive upgrades
        assert!(dir.write_lock().unwrap());
        assert_eq!(dir.state(), LockState::Exclusive);
        // exclusive -> exclusive is a no-op
        assert!(!dir.write_lock().unwrap());
        // exclusive -> shared downgrades
        assert!(dir.read_lock().unwrap());
        assert_eq!(dir.state(), LockState::Shared);

        dir.unlock().unwrap();
        assert_eq!(dir.state(), LockState::Unlocked);
    }

    #[test]
    fn test_join_unlinks_lock_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = CacheDir::new(tmp.path().join("entry"));
        dir.read_lock().unwrap();
        let sub = dir.join(&["a", "b"]);
        assert_eq!(sub.path(), tmp.path().join("entry").join("a").join("b"));
        assert_eq!(sub.state(), LockState::Unlocked);
    }

    #[test]
    fn test_create_atomic_builds_then_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = CacheDir::new(tmp.path().join("entry"));

        let built = dir
            .create_atomic((), |scratch, _, ()| {
                fs::write(scratch.join("payload"), b"v1")?;
                Ok(())
            })
            .unwrap();
        assert!(built);
        assert_eq!(dir.state(), LockState::Shared);
        assert_eq!(fs::read(dir.path().join("payload")).unwrap(), b"v1");

        drop(dir);
        let mut dir = CacheDir::new(tmp.path().join("entry"));
        let built = dir
            .create_atomic((), |scratch, _, ()| {
                fs::write(scratch.join("payload"), b"v2")?;
                Ok(())
            })
            .unwrap();
        assert!(!built);
        // the original payload survived
        assert_eq!(fs::read(dir.path().join("payload")).unwrap(), b"v1");
    }

    #[test]
    fn test_create_atomic_failure_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = CacheDir::new(tmp.path().join("entry"));

        let result = dir.create_atomic((), |scratch, _, ()| {
            fs::write(scratch.join("partial"), b"junk")?;
            bail!("boom");
        });
        assert!(result.is_err());
        assert!(!dir.path().exists());

        // no scratch directories left behind either
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.path().is_dir())
            .collect();
        assert!(leftovers.is_empty(), "found {:?}", leftovers);
    }

    #[test]
    fn test_create_atomic_race() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("entry");
        let builds = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let target = target.clone();
                let builds = Arc::clone(&builds);
                scope.spawn(move || {
                    let mut dir = CacheDir::new(target);
                    let built = dir
                        .create_atomic((), |scratch, _, ()| {
                            // stagger the writers a bit
                            std::thread::sleep(std::time::Duration::from_millis(
                                fastrand::u64(0..5),
                            ));
                            fs::write(scratch.join("who"), format!("worker-{worker}"))?;
                            fs::create_dir(scratch.join("sub"))?;
                            fs::write(scratch.join("sub/deep"), b"data")?;
                            Ok(())
                        })
                        .unwrap();
                    if built {
                        builds.fetch_add(1, Ordering::SeqCst);
                    }
                    // every caller sees a complete tree
                    assert!(dir.path().join("who").is_file());
                    assert!(dir.path().join("sub/deep").is_file());
                });
            }
        });

        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_root_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = CacheRoot::new(tmp.path().to_path_buf());
        let venv = root.venv_entry("somekey");
        assert_eq!(venv.path(), tmp.path().join("venvs").join("0").join("somekey"));

        let interp = root.interpreter_entry(Path::new("/usr/bin/python3"));
        let name = interp.path().file_name().unwrap().to_str().unwrap().to_owned();
        assert_eq!(interp.path().parent().unwrap(), tmp.path().join("interpreters").join("0"));
        // sha256 -> 43 chars of urlsafe base64, no padding
        assert_eq!(name.len(), 43);
        assert!(!name.contains('='));
    }
}
