//! Narrow filesystem surface used by the update pipeline.
//!
//! Paths are `/`-separated and relative to the storage root, e.g.
//! `main/app/ota.py`. On the device the root is the FAT mount point.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::error::StorageError;

/// Chunk size for file copies; small on purpose, heap is tight.
pub const COPY_CHUNK: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

pub trait Storage: Send + Sync {
    fn list(&self, dir: &str) -> Result<Vec<DirEntry>, StorageError>;
    fn kind(&self, path: &str) -> Option<EntryKind>;
    /// Creates one directory level. Succeeds if it already exists.
    fn mkdir(&self, path: &str) -> Result<(), StorageError>;
    fn open_read<'a>(&'a self, path: &str) -> Result<Box<dyn Read + 'a>, StorageError>;
    /// Opens `path` for writing, truncating existing content.
    fn create<'a>(&'a self, path: &str) -> Result<Box<dyn Write + 'a>, StorageError>;
    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;
    fn remove_file(&self, path: &str) -> Result<(), StorageError>;
    fn remove_dir(&self, path: &str) -> Result<(), StorageError>;

    fn exists(&self, path: &str) -> bool {
        self.kind(path).is_some()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.kind(path) == Some(EntryKind::Dir)
    }
}

/// Joins path segments, skipping empty ones.
pub fn join(base: &str, rest: &str) -> String {
    let base = base.trim_end_matches('/');
    let rest = rest.trim_start_matches('/');
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{rest}"),
    }
}

/// Parent directory of a relative path, `""` for top-level entries.
pub fn parent(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map(|(head, _)| head)
        .unwrap_or("")
}

/// Creates every directory level of `path`.
pub fn mkdirs(storage: &dyn Storage, path: &str) -> Result<(), StorageError> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current = join(&current, part);
        storage.mkdir(&current)?;
    }
    Ok(())
}

/// Removes a directory tree depth-first.
pub fn rmtree(storage: &dyn Storage, dir: &str) -> Result<(), StorageError> {
    for entry in storage.list(dir)? {
        let path = join(dir, &entry.name);
        match entry.kind {
            EntryKind::Dir => rmtree(storage, &path)?,
            EntryKind::File => storage.remove_file(&path)?,
        }
    }
    storage.remove_dir(dir)
}

/// Streams `from` into `to` in `COPY_CHUNK` pieces.
pub fn copy_file(storage: &dyn Storage, from: &str, to: &str) -> Result<u64, StorageError> {
    let mut reader = storage.open_read(from)?;
    let mut writer = storage.create(to)?;
    let mut buf = [0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| StorageError::from_io(from, e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|e| StorageError::from_io(to, e))?;
        total += n as u64;
    }
    writer.flush().map_err(|e| StorageError::from_io(to, e))?;
    Ok(total)
}

/// Recursively copies a directory tree, creating `to` when missing.
pub fn copy_dir(storage: &dyn Storage, from: &str, to: &str) -> Result<(), StorageError> {
    if !storage.is_dir(to) {
        mkdirs(storage, to)?;
    }
    for entry in storage.list(from)? {
        let src = join(from, &entry.name);
        let dst = join(to, &entry.name);
        match entry.kind {
            EntryKind::Dir => copy_dir(storage, &src, &dst)?,
            EntryKind::File => {
                copy_file(storage, &src, &dst)?;
            }
        }
    }
    Ok(())
}

pub fn read_to_string(storage: &dyn Storage, path: &str) -> Result<String, StorageError> {
    let mut reader = storage.open_read(path)?;
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .map_err(|e| StorageError::from_io(path, e))?;
    Ok(text)
}

pub fn write_string(storage: &dyn Storage, path: &str, text: &str) -> Result<(), StorageError> {
    let mut writer = storage.create(path)?;
    writer
        .write_all(text.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|e| StorageError::from_io(path, e))
}

/// `std::fs` backed storage rooted at a mount point.
pub struct StdFsStorage {
    root: PathBuf,
}

impl StdFsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        // never climbs above the mount root
        for part in path.split('/').filter(|p| !matches!(*p, "" | "." | "..")) {
            full.push(part);
        }
        full
    }
}

impl Storage for StdFsStorage {
    fn list(&self, dir: &str) -> Result<Vec<DirEntry>, StorageError> {
        let entries = fs::read_dir(self.resolve(dir)).map_err(|e| StorageError::from_io(dir, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::from_io(dir, e))?;
            let file_type = entry.file_type().map_err(|e| StorageError::from_io(dir, e))?;
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: if file_type.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn kind(&self, path: &str) -> Option<EntryKind> {
        let meta = fs::metadata(self.resolve(path)).ok()?;
        Some(if meta.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        })
    }

    fn mkdir(&self, path: &str) -> Result<(), StorageError> {
        match fs::create_dir(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StorageError::from_io(path, e)),
        }
    }

    fn open_read<'a>(&'a self, path: &str) -> Result<Box<dyn Read + 'a>, StorageError> {
        let file = fs::File::open(self.resolve(path)).map_err(|e| StorageError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    fn create<'a>(&'a self, path: &str) -> Result<Box<dyn Write + 'a>, StorageError> {
        let file =
            fs::File::create(self.resolve(path)).map_err(|e| StorageError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        fs::rename(self.resolve(from), self.resolve(to)).map_err(|e| {
            match (e.kind(), e.raw_os_error()) {
                (std::io::ErrorKind::Unsupported, _) | (_, Some(18)) => {
                    StorageError::RenameUnsupported {
                        from: from.to_string(),
                        to: to.to_string(),
                    }
                }
                _ => StorageError::from_io(from, e),
            }
        })
    }

    fn remove_file(&self, path: &str) -> Result<(), StorageError> {
        fs::remove_file(self.resolve(path)).map_err(|e| StorageError::from_io(path, e))
    }

    fn remove_dir(&self, path: &str) -> Result<(), StorageError> {
        fs::remove_dir(self.resolve(path)).map_err(|e| StorageError::from_io(path, e))
    }
}
