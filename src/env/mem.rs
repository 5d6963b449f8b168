use crate::env::{DirLock, RandomAccessFile, SequentialFile, Storage, WritableFile};
use crate::error::Error;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// In-memory storage for tests. Supports injecting write failures for
/// files whose name contains a given substring, which is how the manifest
/// failure scenarios are driven. Clones share the same file system.
#[derive(Default, Clone)]
pub struct MemStorage {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    files: HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
    dirs: HashSet<PathBuf>,
    locked: HashSet<PathBuf>,
    fail_writes_containing: Option<String>,
}

impl MemStorage {
    pub fn new() -> MemStorage {
        MemStorage::default()
    }

    /// All subsequent appends and syncs to files whose name contains
    /// `needle` fail with an injected io error.
    pub fn fail_writes_containing(&self, needle: &str) {
        self.inner.lock().unwrap().fail_writes_containing = Some(needle.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.inner.lock().unwrap().fail_writes_containing = None;
    }

    fn lookup(&self, path: &Path) -> Result<Arc<Mutex<Vec<u8>>>> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }
}

fn not_found(path: &Path) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    ))
}

fn should_fail(inner: &Arc<Mutex<Inner>>, path: &Path) -> bool {
    let inner = inner.lock().unwrap();
    match &inner.fail_writes_containing {
        Some(needle) => path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.contains(needle.as_str())),
        None => false,
    }
}

struct MemWritableFile {
    inner: Arc<Mutex<Inner>>,
    path: PathBuf,
    data: Arc<Mutex<Vec<u8>>>,
}

impl WritableFile for MemWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        if should_fail(&self.inner, &self.path) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write error",
            )));
        }
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if should_fail(&self.inner, &self.path) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected sync error",
            )));
        }
        Ok(())
    }
}

struct MemSequentialFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: usize,
}

impl SequentialFile for MemSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock().unwrap();
        let n = buf.len().min(data.len().saturating_sub(self.pos));
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct MemRandomAccessFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl RandomAccessFile for MemRandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of file",
            )));
        }
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }
}

struct MemDirLock {
    inner: Arc<Mutex<Inner>>,
    path: PathBuf,
}

impl DirLock for MemDirLock {}

impl Drop for MemDirLock {
    fn drop(&mut self) {
        self.inner.lock().unwrap().locked.remove(&self.path);
    }
}

impl Storage for MemStorage {
    fn create(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let data = Arc::new(Mutex::new(Vec::new()));
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(path.to_path_buf(), data.clone());
        Ok(Box::new(MemWritableFile {
            inner: self.inner.clone(),
            path: path.to_path_buf(),
            data,
        }))
    }

    fn open_sequential(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let data = self.lookup(path)?;
        Ok(Box::new(MemSequentialFile { data, pos: 0 }))
    }

    fn open_random_access(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>> {
        let data = self.lookup(path)?;
        Ok(Arc::new(MemRandomAccessFile { data }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.lock().unwrap().files.contains_key(path)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut names = Vec::new();
        for path in inner.files.keys() {
            if path.parent() == Some(dir) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match self.inner.lock().unwrap().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(not_found(path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.files.remove(from) {
            Some(data) => {
                inner.files.insert(to.to_path_buf(), data);
                Ok(())
            }
            None => Err(not_found(from)),
        }
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        self.inner.lock().unwrap().dirs.insert(dir.to_path_buf());
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let data = self.lookup(path)?;
        let len = data.lock().unwrap().len();
        Ok(len as u64)
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn DirLock>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.locked.insert(path.to_path_buf()) {
            return Err(Error::ResourceBusy(format!(
                "lock {} already held",
                path.display()
            )));
        }
        Ok(Box::new(MemDirLock {
            inner: self.inner.clone(),
            path: path.to_path_buf(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read() {
        let storage = MemStorage::new();
        let path = Path::new("/db/000001.log");
        let mut file = storage.create(path).unwrap();
        file.append(b"abcdef").unwrap();
        drop(file);

        let mut buf = [0u8; 3];
        storage
            .open_random_access(path)
            .unwrap()
            .read_at(2, &mut buf)
            .unwrap();
        assert_eq!(&buf, b"cde");
        assert_eq!(storage.file_size(path).unwrap(), 6);
    }

    #[test]
    fn test_rename_and_list() {
        let storage = MemStorage::new();
        storage.create(Path::new("/db/a")).unwrap();
        storage
            .rename(Path::new("/db/a"), Path::new("/db/b"))
            .unwrap();
        let names = storage.list(Path::new("/db")).unwrap();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn test_injected_write_failure() {
        let storage = MemStorage::new();
        let mut file = storage.create(Path::new("/db/MANIFEST-000001")).unwrap();
        file.append(b"ok").unwrap();
        storage.fail_writes_containing("MANIFEST");
        assert!(file.append(b"fails").is_err());
        storage.clear_write_failures();
        file.append(b"ok again").unwrap();
    }

    #[test]
    fn test_lock_exclusion() {
        let storage = MemStorage::new();
        let path = Path::new("/db/LOCK");
        let guard = storage.lock(path).unwrap();
        assert!(storage.lock(path).is_err());
        drop(guard);
        storage.lock(path).unwrap();
    }
}
