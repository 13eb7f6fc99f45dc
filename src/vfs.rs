//! The filesystem abstraction the disk task writes through.
//!
//! The disk task only ever does positioned reads and writes of whole byte
//! ranges, so the surface here is deliberately small. Production uses
//! [`OsFs`]; tests use [`MemFs`], which can also simulate a slow disk.

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// Metadata about a filesystem entry.
#[derive(Clone, Copy, Debug)]
pub struct FileStat {
    pub len: u64,
    pub is_file: bool,
    pub mtime: SystemTime,
}

/// An open file supporting positioned I/O.
///
/// Positioned calls may write or read fewer bytes than asked; callers loop
/// until the full range is transferred.
pub trait VfsFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    /// Flushes written data to durable storage.
    fn sync_data(&self) -> io::Result<()>;
}

/// The filesystem capability the disk task is constructed over.
pub trait Vfs: Send + Sync + 'static {
    /// Opens (creating if missing) a file for positioned reads and writes.
    fn open(&self, path: &Path) -> io::Result<Box<dyn VfsFile>>;
    fn stat(&self, path: &Path) -> io::Result<FileStat>;
    fn exists(&self, path: &Path) -> bool;
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    fn delete_file(&self, path: &Path) -> io::Result<()>;
    /// Deletes a directory and everything below it.
    fn delete_dir(&self, path: &Path) -> io::Result<()>;
}

/// The operating system filesystem.
#[derive(Debug, Default, Clone)]
pub struct OsFs;

impl Vfs for OsFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn VfsFile>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let meta = fs::metadata(path)?;
        Ok(FileStat {
            len: meta.len(),
            is_file: meta.is_file(),
            mtime: meta.modified()?,
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        Ok(entries)
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn delete_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }
}

impl VfsFile for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }

    fn sync_data(&self) -> io::Result<()> {
        std::fs::File::sync_data(self)
    }
}

/// An in-memory filesystem for tests.
///
/// Files are growable byte vectors behind a shared map. `write_latency` adds
/// a sleep to every write call, which is how the slow-disk backpressure
/// scenarios are driven.
#[derive(Clone, Default)]
pub struct MemFs {
    inner: Arc<Mutex<HashMap<PathBuf, MemEntry>>>,
    write_latency: Option<Duration>,
}

#[derive(Clone)]
struct MemEntry {
    data: Arc<Mutex<Vec<u8>>>,
    mtime: SystemTime,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::default(),
            write_latency: Some(latency),
        }
    }

    /// Returns a copy of the file's contents, for assertions.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.get(path).map(|e| e.data.lock().unwrap().clone())
    }

    /// Pre-populates a file, for seeding and recheck tests.
    pub fn put(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            path.into(),
            MemEntry {
                data: Arc::new(Mutex::new(data)),
                mtime: SystemTime::now(),
            },
        );
    }
}

impl Vfs for MemFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn VfsFile>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entry(path.to_path_buf())
            .or_insert_with(|| MemEntry {
                data: Arc::default(),
                mtime: SystemTime::now(),
            });
        Ok(Box::new(MemFile {
            data: Arc::clone(&entry.data),
            write_latency: self.write_latency,
        }))
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.get(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no such file")
        })?;
        let stat = FileStat {
            len: entry.data.lock().unwrap().len() as u64,
            is_file: true,
            mtime: entry.mtime,
        };
        Ok(stat)
    }

    fn exists(&self, path: &Path) -> bool {
        let inner = self.inner.lock().unwrap();
        let path = path.to_path_buf();
        inner.contains_key(&path)
            || inner.keys().any(|k| k.starts_with(&path))
    }

    fn mkdir_all(&self, _path: &Path) -> io::Result<()> {
        // directories are implicit in the flat map
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .keys()
            .filter(|k| k.parent() == Some(path))
            .cloned()
            .collect())
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no such file")
        })?;
        Ok(())
    }

    fn delete_dir(&self, path: &Path) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let path = path.to_path_buf();
        inner.retain(|k, _| !k.starts_with(&path));
        Ok(())
    }
}

struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    write_latency: Option<Duration>,
}

impl VfsFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let take = buf.len().min(data.len() - offset);
        buf[..take].copy_from_slice(&data[offset..offset + take]);
        Ok(take)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if let Some(latency) = self.write_latency {
            std::thread::sleep(latency);
        }
        let mut data = self.data.lock().unwrap();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn sync_data(&self) -> io::Result<()> {
        Ok(())
    }
}
