#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use crate::types::{CacheError, Result};

/// Positioned file I/O used by the page swappers.
pub trait FileIo: Send + Sync + 'static {
    /// Reads into `dst` starting at `off`, stopping early only at end of file.
    ///
    /// Returns the number of bytes read.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize>;
    /// Writes all of `src` at `off`, extending the file when needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes file data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// How [`StdFileIo::open_with`] treats a missing or existing file.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenMode {
    /// Create the file when it does not exist.
    pub create: bool,
    /// Drop existing contents.
    pub truncate: bool,
}

/// [`FileIo`] over a shared `std::fs::File`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens (creating if missing) a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(
            path,
            OpenMode {
                create: true,
                truncate: false,
            },
        )
    }

    /// Opens a file for read-write access with explicit create/truncate rules.
    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(mode.create)
            .truncate(mode.truncate)
            .open(path)
            .map_err(CacheError::from)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

#[cfg(unix)]
fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(dst, off)
}

#[cfg(unix)]
fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(src, off)
}

#[cfg(windows)]
fn read_some(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(dst, off)
}

#[cfg(windows)]
fn write_some(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(src, off)
}

#[cfg(not(any(unix, windows)))]
fn read_some(_file: &File, _dst: &mut [u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positional reads unsupported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn write_some(_file: &File, _src: &[u8], _off: u64) -> io::Result<usize> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positional writes unsupported on this platform",
    ))
}

fn read_up_to(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < dst.len() {
        match read_some(file, &mut dst[filled..], off) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                off += n as u64;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    while !src.is_empty() {
        match write_some(file, src, off) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "positional write wrote zero bytes",
                ))
            }
            Ok(n) => {
                src = &src[n..];
                off += n as u64;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        read_up_to(self.file(), off, dst).map_err(CacheError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        write_all(self.file(), off, src).map_err(CacheError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(CacheError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(CacheError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(CacheError::from)
    }
}
