#![forbid(unsafe_code)]

//! Byte-addressed backends the pager reads pages from and writes them to.

use std::fs::{File, OpenOptions};
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom, Write};
use std::io::{self, ErrorKind};
use std::path::Path;

#[cfg(not(unix))]
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::types::{LarchError, Result};

/// Random-access storage underneath a pager.
///
/// Reads must be exact: a read that runs past the end reports
/// [`ErrorKind::UnexpectedEof`], which the pager turns into corruption.
pub trait StoreIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes starting at `off`.
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`; the store grows as needed.
    fn write_all_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Durability barrier.
    fn flush(&self) -> Result<()>;
    /// Bytes currently in the store.
    fn size(&self) -> Result<u64>;
    /// Whether the store has never been written.
    fn is_fresh(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }
}

/// A store file on disk.
pub struct FileBackend {
    file: File,
    #[cfg(not(unix))]
    cursor: Mutex<()>,
}

impl FileBackend {
    /// Opens `path` read-write, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            #[cfg(not(unix))]
            cursor: Mutex::new(()),
        })
    }
}

#[cfg(unix)]
impl StoreIo for FileBackend {
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(dst, off)?;
        Ok(())
    }

    fn write_all_at(&self, off: u64, src: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(src, off)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(not(unix))]
impl StoreIo for FileBackend {
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let _cursor = self.cursor.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(off))?;
        file.read_exact(dst)?;
        Ok(())
    }

    fn write_all_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let _cursor = self.cursor.lock();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(off))?;
        file.write_all(src)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// A store that lives in a growable buffer and vanishes on drop.
#[derive(Default)]
pub struct MemBackend {
    buf: RwLock<Vec<u8>>,
}

impl MemBackend {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn span(off: u64, len: usize) -> Result<std::ops::Range<usize>> {
    let start = usize::try_from(off).map_err(|_| LarchError::Invalid("offset overflow"))?;
    let end = start
        .checked_add(len)
        .ok_or(LarchError::Invalid("offset overflow"))?;
    Ok(start..end)
}

impl StoreIo for MemBackend {
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let range = span(off, dst.len())?;
        let buf = self.buf.read();
        let src = buf.get(range).ok_or_else(|| {
            LarchError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of memory store",
            ))
        })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_all_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let range = span(off, src.len())?;
        let mut buf = self.buf.write();
        if range.end > buf.len() {
            buf.resize(range.end, 0);
        }
        buf[range].copy_from_slice(src);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.buf.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_backend_reads_what_it_wrote() -> Result<()> {
        let dir = tempdir()?;
        let backend = FileBackend::open(dir.path().join("store.bin"))?;
        assert!(backend.is_fresh()?);
        backend.write_all_at(512, b"page")?;
        backend.flush()?;
        let mut buf = [0u8; 4];
        backend.read_exact_at(512, &mut buf)?;
        assert_eq!(&buf, b"page");
        assert_eq!(backend.size()?, 516);
        Ok(())
    }

    #[test]
    fn short_reads_surface_as_eof() -> Result<()> {
        let dir = tempdir()?;
        let file = FileBackend::open(dir.path().join("store.bin"))?;
        let mem = MemBackend::new();
        mem.write_all_at(0, &[7; 4])?;
        let mut buf = [0u8; 8];
        for backend in [&file as &dyn StoreIo, &mem] {
            match backend.read_exact_at(0, &mut buf) {
                Err(LarchError::Io(err)) => assert_eq!(err.kind(), ErrorKind::UnexpectedEof),
                other => panic!("expected eof, got {other:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn memory_backend_zero_fills_gaps() -> Result<()> {
        let mem = MemBackend::new();
        mem.write_all_at(10, &[1, 2, 3])?;
        assert_eq!(mem.size()?, 13);
        let mut buf = [9u8; 4];
        mem.read_exact_at(9, &mut buf)?;
        assert_eq!(buf, [0, 1, 2, 3]);
        Ok(())
    }
}
