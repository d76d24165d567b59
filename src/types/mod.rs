#![forbid(unsafe_code)]
//! Identifiers and the error type shared by every page cache component.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Logical page number inside one mapped file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Identity of a mapped file inside the cache. `0` is reserved for "unbound".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u32);

/// Index of a frame in the frame pool.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FrameId(pub u32);

/// Transaction id supplied by the surrounding storage engine.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxId(pub u64);

/// Id of the implicit transaction that precedes every real one.
///
/// A read baseline at or below this id has nothing to be stale against.
pub const BASE_TX_ID: TxId = TxId(1);

impl FileId {
    /// Marker stored in frames that hold no page.
    pub const UNBOUND: FileId = FileId(0);
}

impl FrameId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl PageId {
    /// Returns the following page id.
    pub const fn next(self) -> PageId {
        PageId(self.0 + 1)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<u64> for TxId {
    fn from(value: u64) -> Self {
        TxId(value)
    }
}

/// Errors surfaced by the page cache.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// Underlying storage failure outside of a page fault.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Rejected cache or mapping configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The file is already mapped with another page size.
    #[error(
        "cannot map {path:?} with page size {requested}: already mapped with page size {mapped}"
    )]
    ConfigurationConflict {
        /// Mapped path.
        path: PathBuf,
        /// Page size of the live mapping.
        mapped: usize,
        /// Page size of the rejected request.
        requested: usize,
    },
    /// The cache has been closed.
    #[error("page cache is closed")]
    CacheClosed,
    /// The file has no live mapping.
    #[error("file {0:?} is not mapped")]
    FileNotMapped(PathBuf),
    /// The last unmap found cursors still pinned on the file.
    #[error("file {0:?} still has pinned pages")]
    FileInUse(PathBuf),
    /// Loading a page from its backing file failed.
    #[error("page fault for page {page_id} of {path:?} failed: {source}")]
    PageFaultFailure {
        /// File being faulted.
        path: PathBuf,
        /// Page being faulted.
        page_id: PageId,
        /// Failure reported by the swapper or evictor.
        #[source]
        source: Box<CacheError>,
    },
    /// Writing back an eviction victim failed.
    #[error("evicting page {page_id} of {path:?} failed: {source}")]
    EvictionFailure {
        /// File owning the victim.
        path: PathBuf,
        /// Victim page.
        page_id: PageId,
        /// Write failure.
        #[source]
        source: Box<CacheError>,
    },
    /// The cursor was used after `close()`.
    #[error("page cursor is closed")]
    CursorClosed,
    /// A linked cursor was reopened while the previous one is still open.
    #[error("previously opened linked cursor is still in use")]
    LinkedCursorInUse,
    /// Error raised by a caller through `set_cursor_exception`.
    #[error("cursor exception: {0}")]
    CursorException(String),
    /// Invalid argument or state.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Returns the I/O error kind at the root of this error, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            CacheError::Io(err) => Some(err.kind()),
            CacheError::PageFaultFailure { source, .. }
            | CacheError::EvictionFailure { source, .. } => source.io_kind(),
            _ => None,
        }
    }
}
