//! Host storage abstraction. The engine performs all file access through
//! [`Storage`] so tests can run against an in-memory implementation with
//! fault injection.

use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod disk;
pub mod mem;

pub use disk::DiskStorage;
pub use mem::MemStorage;

pub trait SequentialFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

pub trait RandomAccessFile: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Durable flush; returns only after the data reached stable storage.
    fn sync(&mut self) -> Result<()>;
}

/// Held for the lifetime of an open database; dropping it releases the lock.
pub trait DirLock: Send + Sync {}

pub trait Storage: Send + Sync {
    fn create(&self, path: &Path) -> Result<Box<dyn WritableFile>>;
    fn open_sequential(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;
    fn open_random_access(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>>;
    fn exists(&self, path: &Path) -> bool;
    /// File names (not paths) directly inside `dir`.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;
    fn remove(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn create_dir_all(&self, dir: &Path) -> Result<()>;
    fn file_size(&self, path: &Path) -> Result<u64>;
    /// Takes an exclusive advisory lock; fails with `ResourceBusy` if some
    /// other holder has it.
    fn lock(&self, path: &Path) -> Result<Box<dyn DirLock>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Journal,
    Table,
    Manifest,
    Current,
    Lock,
    Temp,
}

pub fn journal_file_name(dir: &Path, num: u64) -> PathBuf {
    dir.join(format!("{:06}.log", num))
}

pub fn table_file_name(dir: &Path, num: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", num))
}

pub fn manifest_file_name(dir: &Path, num: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", num))
}

pub fn current_file_name(dir: &Path) -> PathBuf {
    dir.join("CURRENT")
}

pub fn lock_file_name(dir: &Path) -> PathBuf {
    dir.join("LOCK")
}

pub fn temp_file_name(dir: &Path, num: u64) -> PathBuf {
    dir.join(format!("{:06}.dbtmp", num))
}

/// Inverse of the naming scheme above; `None` for foreign files.
pub fn parse_file_name(name: &str) -> Option<(FileKind, u64)> {
    match name {
        "CURRENT" => return Some((FileKind::Current, 0)),
        "LOCK" => return Some((FileKind::Lock, 0)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        return rest.parse().ok().map(|num| (FileKind::Manifest, num));
    }
    if let Some(stem) = name.strip_suffix(".log") {
        return stem.parse().ok().map(|num| (FileKind::Journal, num));
    }
    if let Some(stem) = name.strip_suffix(".sst") {
        return stem.parse().ok().map(|num| (FileKind::Table, num));
    }
    if let Some(stem) = name.strip_suffix(".dbtmp") {
        return stem.parse().ok().map(|num| (FileKind::Temp, num));
    }
    None
}

/// Points CURRENT at `MANIFEST-<manifest_num>` via a temp file and an
/// atomic rename.
pub fn set_current_file(
    storage: &dyn Storage,
    dir: &Path,
    manifest_num: u64,
) -> Result<()> {
    let tmp = temp_file_name(dir, manifest_num);
    let contents = format!("MANIFEST-{:06}\n", manifest_num);
    let result = (|| {
        let mut file = storage.create(&tmp)?;
        file.append(contents.as_bytes())?;
        file.sync()?;
        storage.rename(&tmp, &current_file_name(dir))
    })();
    if result.is_err() {
        let _ = storage.remove(&tmp);
    }
    result
}

/// Reads CURRENT and returns the manifest file name it points at.
pub fn read_current_file(storage: &dyn Storage, dir: &Path) -> Result<String> {
    let mut file = storage.open_sequential(&current_file_name(dir))?;
    let mut contents = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        contents.extend_from_slice(&buf[..n]);
    }
    let name = std::str::from_utf8(&contents)
        .map_err(|_| crate::Error::corruption("CURRENT is not utf-8"))?
        .trim_end_matches('\n');
    if name.is_empty() || !name.starts_with("MANIFEST-") {
        return Err(crate::Error::corruption("CURRENT does not name a manifest"));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("000007.log"), Some((FileKind::Journal, 7)));
        assert_eq!(parse_file_name("000042.sst"), Some((FileKind::Table, 42)));
        assert_eq!(
            parse_file_name("MANIFEST-000003"),
            Some((FileKind::Manifest, 3))
        );
        assert_eq!(parse_file_name("CURRENT"), Some((FileKind::Current, 0)));
        assert_eq!(parse_file_name("LOCK"), Some((FileKind::Lock, 0)));
        assert_eq!(parse_file_name("000009.dbtmp"), Some((FileKind::Temp, 9)));
        assert_eq!(parse_file_name("hello.txt"), None);
        assert_eq!(parse_file_name("MANIFEST-abc"), None);
    }

    #[test]
    fn test_name_roundtrip() {
        let dir = Path::new("/db");
        for (path, kind, num) in [
            (journal_file_name(dir, 12), FileKind::Journal, 12),
            (table_file_name(dir, 9000), FileKind::Table, 9000),
            (manifest_file_name(dir, 1), FileKind::Manifest, 1),
        ] {
            let name = path.file_name().unwrap().to_str().unwrap().to_string();
            assert_eq!(parse_file_name(&name), Some((kind, num)));
        }
    }
}
