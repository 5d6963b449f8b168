use crate::env::{DirLock, RandomAccessFile, SequentialFile, Storage, WritableFile};
use crate::error::Error;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

/// `std::fs` backed storage.
#[derive(Default, Clone, Copy)]
pub struct DiskStorage;

struct DiskSequentialFile {
    reader: BufReader<File>,
}

impl SequentialFile for DiskSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.reader.read(buf)?)
    }
}

struct DiskRandomAccessFile {
    #[cfg(unix)]
    file: File,
    #[cfg(not(unix))]
    file: std::sync::Mutex<File>,
}

impl RandomAccessFile for DiskRandomAccessFile {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }
}

struct DiskWritableFile {
    writer: BufWriter<File>,
}

impl WritableFile for DiskWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

/// Advisory lock on the LOCK file, released when the handle drops.
struct DiskFileLock {
    _file: File,
}

impl DirLock for DiskFileLock {}

#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<()> {
    Ok(())
}

impl Storage for DiskStorage {
    fn create(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(DiskWritableFile {
            writer: BufWriter::new(file),
        }))
    }

    fn open_sequential(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        Ok(Box::new(DiskSequentialFile {
            reader: BufReader::new(File::open(path)?),
        }))
    }

    fn open_random_access(&self, path: &Path) -> Result<Arc<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        #[cfg(unix)]
        return Ok(Arc::new(DiskRandomAccessFile { file }));
        #[cfg(not(unix))]
        return Ok(Arc::new(DiskRandomAccessFile {
            file: std::sync::Mutex::new(file),
        }));
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn create_dir_all(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn lock(&self, path: &Path) -> Result<Box<dyn DirLock>> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        if let Err(e) = try_lock(&file) {
            return Err(Error::ResourceBusy(format!(
                "lock {}: {}",
                path.display(),
                e
            )));
        }
        // Record the holder for debugging.
        let _ = writeln!(file, "{}", std::process::id());
        let _ = file.flush();
        Ok(Box::new(DiskFileLock { _file: file }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{lock_file_name, Storage};

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = DiskStorage;
        let path = dir.path().join("data");

        let mut file = storage.create(&path).unwrap();
        file.append(b"hello ").unwrap();
        file.append(b"world").unwrap();
        file.sync().unwrap();
        drop(file);

        assert_eq!(storage.file_size(&path).unwrap(), 11);

        let mut buf = [0u8; 5];
        let file = storage.open_random_access(&path).unwrap();
        file.read_at(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        let mut seq = storage.open_sequential(&path).unwrap();
        let mut out = [0u8; 11];
        let mut read = 0;
        while read < out.len() {
            let n = seq.read(&mut out[read..]).unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = DiskStorage;
        let path = lock_file_name(dir.path());

        let held = storage.lock(&path).unwrap();
        // flock is per-open-file, so a second handle in the same process
        // still conflicts.
        assert!(storage.lock(&path).is_err());
        drop(held);
        storage.lock(&path).unwrap();
    }
}
