//! Sombra page cache.
//!
//! Maps fixed-size pages of on-disk files into a bounded pool of in-memory
//! frames. Cursors pin pages for optimistic reads or locked writes, a CLOCK
//! evictor reclaims frames under memory pressure, and version contexts let
//! long-running reads notice pages changed by newer transactions.

#![warn(missing_docs)]

pub mod primitives;
pub mod types;

pub use primitives::io::{FileIo, OpenMode, StdFileIo};
pub use primitives::pagecache::{
    AccessMode, ConfigError, CursorContext, DefaultSwapperFactory, IoOptions, MapOptions,
    PageCache, PageCacheOptions, PageCacheStats, PageCursor, PageSwapper, PagedFile,
    SingleFileSwapper, SwapperFactory, TransactionIdStore, VersionContext,
    VersionContextSupplier,
};
pub use types::{CacheError, FileId, PageId, Result, TxId, BASE_TX_ID};
