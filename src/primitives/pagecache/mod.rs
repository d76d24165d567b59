#![forbid(unsafe_code)]

mod cache;
mod cursor;
mod eviction;
mod frame;
mod options;
mod page;
mod paged_file;
mod stats;
mod swapper;
mod translation;
mod version;

pub use cache::PageCache;
pub use cursor::{AccessMode, IoOptions, PageCursor};
pub use options::{
    keep_free_watermark, ConfigError, MapOptions, PageCacheOptions, DEFAULT_CACHE_PAGES,
    DEFAULT_PAGE_SIZE, MIN_CACHE_PAGES, MIN_PAGE_SIZE,
};
pub use paged_file::PagedFile;
pub use stats::PageCacheStats;
pub use swapper::{DefaultSwapperFactory, PageSwapper, SingleFileSwapper, SwapperFactory};
pub use version::{
    CursorContext, TransactionIdStore, VersionContext, VersionContextSupplier,
};
