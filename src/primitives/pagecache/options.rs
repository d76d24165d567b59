#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CacheError, Result};

/// Default cache page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;
/// Frame count used when neither `cache_pages` nor `cache_bytes` is set.
pub const DEFAULT_CACHE_PAGES: usize = 1024;
/// Smallest usable frame pool.
pub const MIN_CACHE_PAGES: usize = 2;
/// Smallest page size the cache accepts.
pub const MIN_PAGE_SIZE: usize = 8;

/// Errors raised while loading [`PageCacheOptions`] from TOML.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read page cache config {path}: {source}")]
    Read {
        /// Config path.
        path: PathBuf,
        /// Read failure.
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`PageCacheOptions`].
    #[error("failed to parse page cache config {path}: {source}")]
    Parse {
        /// Config path, `<inline>` for strings.
        path: PathBuf,
        /// Parse failure.
        source: toml::de::Error,
    },
}

/// Construction-time settings for a [`crate::PageCache`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PageCacheOptions {
    /// Cache page size; a power of two no smaller than 8.
    pub page_size: usize,
    /// Memory budget in frames.
    pub cache_pages: Option<usize>,
    /// Memory budget in bytes, rounded down to whole frames.
    pub cache_bytes: Option<u64>,
    /// Run the background evictor thread.
    pub background_eviction: bool,
    /// Percentage of frames the evictor tries to keep free.
    pub keep_free_percent: usize,
    /// Explicit keep-free watermark, overriding the percentage.
    pub keep_free_pages: Option<usize>,
    /// Stripes per translation table.
    pub fault_lock_striping: usize,
    /// How long the evictor parks between checks.
    pub eviction_park_ms: u64,
}

impl Default for PageCacheOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: None,
            cache_bytes: None,
            background_eviction: true,
            keep_free_percent: 5,
            keep_free_pages: None,
            fault_lock_striping: 128,
            eviction_park_ms: 10,
        }
    }
}

impl PageCacheOptions {
    /// Options with the given page size and frame budget, everything else default.
    pub fn with_pages(page_size: usize, cache_pages: usize) -> Self {
        Self {
            page_size,
            cache_pages: Some(cache_pages),
            ..Self::default()
        }
    }

    /// Parses options from a TOML document.
    pub fn from_toml_str(contents: &str) -> std::result::Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub(crate) fn resolve(&self) -> Result<ResolvedOptions> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(CacheError::InvalidConfig(format!(
                "page size {} must be a power of two of at least {MIN_PAGE_SIZE}",
                self.page_size
            )));
        }
        let frames = match (self.cache_pages, self.cache_bytes) {
            (Some(_), Some(_)) => {
                return Err(CacheError::InvalidConfig(
                    "set either cache_pages or cache_bytes, not both".into(),
                ))
            }
            (Some(pages), None) => pages,
            (None, Some(bytes)) => usize::try_from(bytes / self.page_size as u64)
                .map_err(|_| CacheError::InvalidConfig("cache_bytes too large".into()))?,
            (None, None) => DEFAULT_CACHE_PAGES,
        };
        if frames < MIN_CACHE_PAGES {
            return Err(CacheError::InvalidConfig(format!(
                "cache needs at least {MIN_CACHE_PAGES} pages, got {frames}"
            )));
        }
        if frames > u32::MAX as usize >> 1 {
            return Err(CacheError::InvalidConfig(format!(
                "cache of {frames} pages is too large"
            )));
        }
        if self.keep_free_percent > 100 {
            return Err(CacheError::InvalidConfig(format!(
                "keep_free_percent {} exceeds 100",
                self.keep_free_percent
            )));
        }
        if self.fault_lock_striping == 0 {
            return Err(CacheError::InvalidConfig(
                "fault_lock_striping must be positive".into(),
            ));
        }
        let keep_free = self
            .keep_free_pages
            .unwrap_or_else(|| keep_free_watermark(frames, self.keep_free_percent))
            .min(frames - 1);
        Ok(ResolvedOptions {
            page_size: self.page_size,
            frames,
            keep_free,
            background_eviction: self.background_eviction,
            striping: self.fault_lock_striping,
            park: Duration::from_millis(self.eviction_park_ms.max(1)),
        })
    }
}

/// Number of frames the background evictor tries to keep on the free list.
pub fn keep_free_watermark(frames: usize, percent: usize) -> usize {
    let floor = (frames / 2).min(30);
    let scaled = (frames.saturating_mul(percent) / 100).min(100_000);
    floor.max(scaled)
}

#[derive(Clone, Debug)]
pub(crate) struct ResolvedOptions {
    pub(crate) page_size: usize,
    pub(crate) frames: usize,
    pub(crate) keep_free: usize,
    pub(crate) background_eviction: bool,
    pub(crate) striping: usize,
    pub(crate) park: Duration,
}

/// Per-file settings for [`crate::PageCache::map_with`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MapOptions {
    /// File page size; at most the cache page size.
    pub page_size: usize,
    /// Create the file when missing.
    pub create: bool,
    /// Drop existing contents on first map.
    pub truncate_existing: bool,
    /// Fixed record size used by record addressing helpers.
    pub record_size: Option<usize>,
    /// Let read cursors compare pages against their version context.
    pub version_tracking: bool,
    /// Remove the file, discarding unflushed pages, when the last mapping goes.
    pub delete_on_close: bool,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            create: true,
            truncate_existing: false,
            record_size: None,
            version_tracking: true,
            delete_on_close: false,
        }
    }
}

impl MapOptions {
    /// Default options with the given file page size.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self, cache_page_size: usize) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || self.page_size > cache_page_size {
            return Err(CacheError::InvalidConfig(format!(
                "file page size {} must be between {MIN_PAGE_SIZE} and the cache page size {cache_page_size}",
                self.page_size
            )));
        }
        if let Some(record) = self.record_size {
            if record == 0 || record > self.page_size {
                return Err(CacheError::InvalidConfig(format!(
                    "record size {record} must be between 1 and the file page size {}",
                    self.page_size
                )));
            }
        }
        Ok(())
    }
}
