//! Low-level primitives for building the page cache.
//!
//! Includes positional file I/O, per-frame lock words and latches, and the
//! page cache itself.

/// Concurrency primitives and synchronization.
///
/// Lock words, fault latches and backoff used by frames and cursors.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for positioned reads and writes against backing files.
pub mod io;

/// Page cache: frame pool, mapped files, cursors and eviction.
///
/// Maps file pages into a bounded set of frames shared by every mapped file.
pub mod pagecache;
