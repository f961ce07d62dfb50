use crate::prelude::*;
use crate::tree::NicePathBuf;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::mpsc;
use zip::ZipArchive;

// Entries we're willing to pull into memory wholesale (PEX-INFO,
// .layout.json); anything bigger goes through streaming extraction instead.
const MAX_ENTRY_SLICE: u64 = 64 * 1024 * 1024;

/// A readable zip archive (ZIP64 included, courtesy of the zip crate). The
/// writable counterpart is [`ArchiveWriter`].
pub struct Archive {
    path: PathBuf,
    z: ZipArchive<File>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractOptions {
    /// Worker count for parallel extraction; None means
    /// `min(num_entries, available CPUs)`. Anything below 2 runs serially.
    pub workers: Option<usize>,
}

fn open_archive_file(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        CzexError::ZipFileOpen {
            path: path.to_owned(),
            reason: e.to_string(),
        }
        .into()
    })
}

impl Archive {
    pub fn open(path: &Path) -> Result<Archive> {
        context!("opening archive {}", path.display());
        let file = open_archive_file(path)?;
        let z = ZipArchive::new(file).map_err(|e| CzexError::ZipOpen {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Archive {
            path: path.to_owned(),
            z,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_entries(&self) -> usize {
        self.z.len()
    }

    /// Pull one entry into memory. Missing entries are `None`, so callers can
    /// probe for optional metadata without special-casing an error kind.
    pub fn entry_bytes(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        use zip::result::ZipError;
        let mut entry = match self.z.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(e) => {
                return Err(CzexError::ZipEntryMetadata {
                    name: name.to_owned(),
                    reason: e.to_string(),
                }
                .into())
            }
        };
        if entry.size() > MAX_ENTRY_SLICE {
            return Err(CzexError::ZipEntryTooLarge {
                name: name.to_owned(),
                size: entry.size(),
            }
            .into());
        }
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf).map_err(|e| CzexError::ZipFileRead {
            name: name.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Some(buf))
    }

    /// Like [`Archive::entry_bytes`], but absence is an error.
    pub fn required_entry_bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        self.entry_bytes(name)?
            .ok_or_else(|| CzexError::ZipEntryNotFound(name.to_owned()).into())
    }

    /// Extract a single named entry under `dest`.
    pub fn extract_entry(&mut self, name: &str, dest: &Path) -> Result<()> {
        let index = (0..self.z.len())
            .find(|&i| {
                self.z
                    .by_index_raw(i)
                    .map(|e| e.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| CzexError::ZipEntryNotFound(name.to_owned()))?;
        extract_index(&mut self.z, index, dest)
    }

    /// The reference serial extractor: every entry matching `predicate`, in
    /// central-directory order.
    pub fn extract_matching<F>(&mut self, dest: &Path, predicate: F) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        for index in self.matching_indices(&predicate)? {
            extract_index(&mut self.z, index, dest)?;
        }
        Ok(())
    }

    /// Extract all entries matching `predicate` under `dest`, fanning the
    /// work out over a bounded pool. Each worker opens its own handle on the
    /// archive; entries are assigned round-robin so a worker only ever
    /// touches its own handle. The first failure is stored in a shared slot,
    /// the other workers notice and bail, and the main thread reports it.
    pub fn parallel_extract<F>(
        &mut self,
        dest: &Path,
        predicate: F,
        options: &ExtractOptions,
    ) -> Result<()>
    where
        F: Fn(&str) -> bool,
    {
        // One pass over the central directory, on this thread.
        let tasks = self.matching_indices(&predicate)?;

        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = options.workers.unwrap_or(available).min(tasks.len());
        if workers < 2 {
            for index in tasks {
                extract_index(&mut self.z, index, dest)?;
            }
            return Ok(());
        }

        let path = self.path.clone();
        let error_slot = AtomicI32::new(0);

        let worker_results = std::thread::scope(|scope| {
            let mut senders = Vec::with_capacity(workers);
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let (tx, rx) = mpsc::channel::<usize>();
                senders.push(tx);
                let path = &path;
                let error_slot = &error_slot;
                handles.push(scope.spawn(move || -> Result<()> {
                    let file = open_archive_file(path)?;
                    let mut z = ZipArchive::new(file).map_err(|e| CzexError::ZipOpen {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                    for index in rx {
                        if error_slot.load(Ordering::SeqCst) != 0 {
                            // someone else already failed
                            return Ok(());
                        }
                        if let Err(err) = extract_index(&mut z, index, dest) {
                            let code = err
                                .downcast_ref::<CzexError>()
                                .map(CzexError::code)
                                .unwrap_or(1);
                            // first writer wins
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
                }));
            }

            for (position, index) in tasks.into_iter().enumerate() {
                // keyed by worker id, so each worker reuses its own handle
                let _ = senders[position % workers].send(index);
            }
            drop(senders);

            handles
                .into_iter()
                .map(|h| h.join().expect("extraction worker panicked"))
                .collect::<Vec<_>>()
        });

        for result in worker_results {
            result?;
        }
        Ok(())
    }

    fn matching_indices<F>(&mut self, predicate: &F) -> Result<Vec<usize>>
    where
        F: Fn(&str) -> bool,
    {
        let mut indices = Vec::new();
        for index in 0..self.z.len() {
            let entry = self.z.by_index_raw(index).map_err(|e| {
                CzexError::ZipEntryMetadata {
                    name: format!("#{index}"),
                    reason: e.to_string(),
                }
            })?;
            if predicate(entry.name()) {
                indices.push(index);
            }
        }
        Ok(indices)
    }
}

/// Decompress entry `index` under `dest`. Directory entries (name ending in
/// `/`) become directories; everything else becomes a file, with intermediate
/// directories created as needed and unix execute bits preserved. Entry names
/// are validated so they can't escape `dest`.
fn extract_index(z: &mut ZipArchive<File>, index: usize, dest: &Path) -> Result<()> {
    let mut entry = z.by_index(index).map_err(|e| CzexError::ZipEntryMetadata {
        name: format!("#{index}"),
        reason: e.to_string(),
    })?;
    let raw_name = entry.name().to_owned();
    context!("unpacking archive member {}", raw_name);
    let nice: NicePathBuf = raw_name.as_str().try_into()?;
    let full_path = dest.join(nice.to_native());
    let read_err = |e: io::Error| CzexError::ZipFileRead {
        name: raw_name.clone(),
        reason: e.to_string(),
    };

    if raw_name.ends_with('/') {
        fs::create_dir_all(&full_path).map_err(read_err)?;
        return Ok(());
    }
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent).map_err(read_err)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let executable = entry.unix_mode().map(|m| m & 0o111 != 0).unwrap_or(false);
        options.mode(if executable { 0o777 } else { 0o666 });
    }
    let mut file = options.open(&full_path).map_err(read_err)?;
    io::copy(&mut entry, &mut file).map_err(read_err)?;
    Ok(())
}

/// Write-side access, mode create (fail if the file exists) or truncate
/// (clobber). Mostly exercised by the tests that synthesize archives.
pub struct ArchiveWriter {
    w: zip::ZipWriter<File>,
}

impl ArchiveWriter {
    pub fn create(path: &Path, truncate: bool) -> Result<ArchiveWriter> {
        let mut options = OpenOptions::new();
        options.write(true);
        if truncate {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path).map_err(|e| CzexError::ZipFileOpen {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(ArchiveWriter {
            w: zip::ZipWriter::new(file),
        })
    }

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        self.w.start_file(name, options)?;
        self.w.write_all(data)?;
        Ok(())
    }

    pub fn add_executable(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o755);
        self.w.start_file(name, options)?;
        self.w.write_all(data)?;
        Ok(())
    }

    pub fn add_dir(&mut self, name: &str) -> Result<()> {
        let options = zip::write::FileOptions::default();
        self.w.add_directory(name, options)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.w.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn build_test_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let mut w = ArchiveWriter::create(path, false).unwrap();
        for (name, data) in entries {
            if name.ends_with('/') {
                w.add_dir(name.trim_end_matches('/')).unwrap();
            } else {
                w.add_file(name, data).unwrap();
            }
        }
        w.finish().unwrap();
    }

    fn tree_of(root: &Path) -> BTreeMap<String, Vec<u8>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let entry = entry.unwrap();
                let path = entry.path();
                let rel = path
                    .strip_prefix(root)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .replace('\\', "/");
                if path.is_dir() {
                    out.insert(format!("{rel}/"), vec![]);
                    walk(root, &path, out);
                } else {
                    out.insert(rel, fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn many_entries() -> Vec<(String, Vec<u8>)> {
        let mut entries = vec![("lib/".to_owned(), vec![])];
        for i in 0..40 {
            entries.push((
                format!("lib/pkg{:02}/module.py", i),
                format!("print({i})").into_bytes(),
            ));
        }
        entries
    }

    #[test]
    fn test_entry_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("a.zip");
        build_test_archive(&zip_path, &[("hello.txt", b"hi"), ("sub/deep.txt", b"deep")]);

        let mut archive = Archive::open(&zip_path).unwrap();
        assert_eq!(archive.num_entries(), 2);
        assert_eq!(archive.entry_bytes("hello.txt").unwrap().unwrap(), b"hi");
        assert_eq!(archive.entry_bytes("missing.txt").unwrap(), None);
        assert!(archive.required_entry_bytes("missing.txt").is_err());
    }

    #[test]
    fn test_extract_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("a.zip");
        build_test_archive(&zip_path, &[("hello.txt", b"hi"), ("sub/deep.txt", b"deep")]);

        let dest = tmp.path().join("out");
        let mut archive = Archive::open(&zip_path).unwrap();
        archive.extract_entry("sub/deep.txt", &dest).unwrap();
        assert_eq!(fs::read(dest.join("sub/deep.txt")).unwrap(), b"deep");
        assert!(!dest.join("hello.txt").exists());

        let err = archive.extract_entry("missing.txt", &dest).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CzexError>(),
            Some(CzexError::ZipEntryNotFound(_))
        ));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let not_zip = tmp.path().join("nope.zip");
        fs::write(&not_zip, b"definitely not a zip file").unwrap();
        assert!(Archive::open(&not_zip).is_err());
        assert!(Archive::open(&tmp.path().join("missing.zip")).is_err());
    }

    #[test]
    fn test_create_mode_respects_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.zip");
        build_test_archive(&path, &[("x", b"1")]);
        assert!(ArchiveWriter::create(&path, false).is_err());
        // truncate mode clobbers
        let mut w = ArchiveWriter::create(&path, true).unwrap();
        w.add_file("y", b"2").unwrap();
        w.finish().unwrap();
        let mut archive = Archive::open(&path).unwrap();
        assert_eq!(archive.entry_bytes("x").unwrap(), None);
        assert_eq!(archive.entry_bytes("y").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_parallel_matches_serial() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("many.zip");
        let entries = many_entries();
        let borrowed: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect();
        build_test_archive(&zip_path, &borrowed);

        let serial_dest = tmp.path().join("serial");
        let parallel_dest = tmp.path().join("parallel");
        let mut archive = Archive::open(&zip_path).unwrap();
        archive.extract_matching(&serial_dest, |_| true).unwrap();
        archive
            .parallel_extract(
                &parallel_dest,
                |_| true,
                &ExtractOptions { workers: Some(4) },
            )
            .unwrap();

        assert_eq!(tree_of(&serial_dest), tree_of(&parallel_dest));
        assert_eq!(tree_of(&serial_dest).len(), 41);
    }

    #[test]
    fn test_parallel_predicate_filters() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("many.zip");
        let entries = many_entries();
        let borrowed: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect();
        build_test_archive(&zip_path, &borrowed);

        let dest = tmp.path().join("some");
        let mut archive = Archive::open(&zip_path).unwrap();
        archive
            .parallel_extract(
                &dest,
                |name| name.starts_with("lib/pkg00/") || name.starts_with("lib/pkg01/"),
                &ExtractOptions { workers: Some(3) },
            )
            .unwrap();
        let tree = tree_of(&dest);
        assert!(tree.contains_key("lib/pkg00/module.py"));
        assert!(tree.contains_key("lib/pkg01/module.py"));
        assert!(!tree.contains_key("lib/pkg02/module.py"));
    }

    #[test]
    fn test_single_worker_degrades_to_serial() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("many.zip");
        let entries = many_entries();
        let borrowed: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect();
        build_test_archive(&zip_path, &borrowed);

        let dest = tmp.path().join("one");
        let mut archive = Archive::open(&zip_path).unwrap();
        archive
            .parallel_extract(&dest, |_| true, &ExtractOptions { workers: Some(1) })
            .unwrap();
        assert_eq!(tree_of(&dest).len(), 41);
    }

    #[test]
    fn test_hostile_entry_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("evil.zip");
        build_test_archive(&zip_path, &[("../escape.txt", b"boo")]);

        let dest = tmp.path().join("dest");
        let mut archive = Archive::open(&zip_path).unwrap();
        assert!(archive.extract_matching(&dest, |_| true).is_err());
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let zip_path = tmp.path().join("x.zip");
        let mut w = ArchiveWriter::create(&zip_path, false).unwrap();
        w.add_executable("bin/tool", b"#!/bin/sh\n").unwrap();
        w.add_file("data.txt", b"plain").unwrap();
        w.finish().unwrap();

        let dest = tmp.path().join("dest");
        let mut archive = Archive::open(&zip_path).unwrap();
        archive.extract_matching(&dest, |_| true).unwrap();

        let tool_mode = fs::metadata(dest.join("bin/tool")).unwrap().permissions().mode();
        assert!(tool_mode & 0o111 != 0);
        let data_mode = fs::metadata(dest.join("data.txt")).unwrap().permissions().mode();
        assert!(data_mode & 0o111 == 0);
    }
}
