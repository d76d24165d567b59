//! Version contexts observed through cursors: stale pages and evicted transactions.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sombra_pagecache::{
    AccessMode, CursorContext, MapOptions, PageCache, PageCacheOptions, Result, TxId,
    VersionContextSupplier, BASE_TX_ID,
};
use tempfile::tempdir;

const PAGE: usize = 64;

fn small_cache(pages: usize) -> Result<PageCache> {
    PageCache::new(PageCacheOptions {
        background_eviction: false,
        ..PageCacheOptions::with_pages(PAGE, pages)
    })
}

fn supplier(last_closed: u64) -> (Arc<AtomicU64>, VersionContextSupplier) {
    let store = Arc::new(AtomicU64::new(last_closed));
    (store.clone(), VersionContextSupplier::new(store))
}

#[test]
fn reader_sees_page_from_newer_transaction() -> Result<()> {
    let dir = tempdir()?;
    let cache = small_cache(8)?;
    let file = cache.map(dir.path().join("newer.db"), PAGE)?;
    let (store, supplier) = supplier(10);

    let read_ctx = supplier.create_version_context();
    let reader_cursor_ctx = CursorContext::with_version(read_ctx.clone());

    let write_ctx = supplier.create_version_context();
    write_ctx.init_write(TxId(20));
    let write_cursor_ctx = CursorContext::with_version(write_ctx);
    let mut writer = file.io(0u64, AccessMode::SharedWrite, &write_cursor_ctx)?;
    assert!(writer.next()?);
    writer.put_u64(7);
    assert!(writer.next()?);
    writer.close();

    let mut reader = file.io(1u64, AccessMode::SharedRead, &reader_cursor_ctx)?;
    assert!(reader.next()?);
    assert!(read_ctx.is_dirty(), "page 1 was released by tx 20");

    store.store(20, Ordering::Release);
    read_ctx.restart_read();
    assert!(!read_ctx.is_dirty());
    assert_eq!(read_ctx.last_closed_transaction_id(), Some(TxId(20)));
    assert!(reader.next_page(1u64)?);
    assert!(!read_ctx.is_dirty(), "re-check against the new baseline");
    assert_eq!(read_ctx.additional_attempts(), 1);
    reader.close();
    file.close()?;
    cache.close()
}

#[test]
fn unchanged_pages_keep_context_clean() -> Result<()> {
    let dir = tempdir()?;
    let cache = small_cache(8)?;
    let file = cache.map(dir.path().join("clean.db"), PAGE)?;
    let (_, supplier) = supplier(10);

    let write_ctx = supplier.create_version_context();
    write_ctx.init_write(TxId(9));
    let write_cursor_ctx = CursorContext::with_version(write_ctx);
    let mut writer = file.io(0u64, AccessMode::Exclusive, &write_cursor_ctx)?;
    for _ in 0..3 {
        assert!(writer.next()?);
    }
    writer.close();

    let read_ctx = supplier.create_version_context();
    let read_cursor_ctx = CursorContext::with_version(read_ctx.clone());
    let mut reader = file.io(0u64, AccessMode::SharedRead, &read_cursor_ctx)?;
    while reader.next()? {}
    assert!(!read_ctx.is_dirty());
    Ok(())
}

#[test]
fn eviction_of_newer_page_marks_readers_dirty() -> Result<()> {
    let dir = tempdir()?;
    let cache = small_cache(2)?;
    let file = cache.map(dir.path().join("evicted.db"), PAGE)?;
    let (_, supplier) = supplier(10);

    let write_ctx = supplier.create_version_context();
    write_ctx.init_write(TxId(30));
    let write_cursor_ctx = CursorContext::with_version(write_ctx);
    let mut writer = file.io(0u64, AccessMode::SharedWrite, &write_cursor_ctx)?;
    assert!(writer.next()?);
    writer.put_u32(1);
    writer.close();

    let mut plain = file.io(1u64, AccessMode::SharedWrite, &CursorContext::none())?;
    for _ in 0..3 {
        assert!(plain.next()?);
    }
    plain.close();
    assert!(cache.stats().evictions >= 1);

    let read_ctx = supplier.create_version_context();
    let read_cursor_ctx = CursorContext::with_version(read_ctx.clone());
    let mut reader = file.io(3u64, AccessMode::SharedRead, &read_cursor_ctx)?;
    assert!(reader.next()?);
    assert!(read_ctx.is_dirty(), "file evicted a page from tx 30");
    reader.close();
    file.close()?;
    cache.close()
}

#[test]
fn base_baseline_and_untracked_files_ignore_versions() -> Result<()> {
    let dir = tempdir()?;
    let cache = small_cache(8)?;
    let (_, base) = supplier(BASE_TX_ID.0);
    let (_, later) = supplier(5);

    let tracked = cache.map(dir.path().join("tracked.db"), PAGE)?;
    let untracked = cache.map_with(
        dir.path().join("untracked.db"),
        &MapOptions {
            version_tracking: false,
            ..MapOptions::with_page_size(PAGE)
        },
    )?;
    for file in [&tracked, &untracked] {
        let ctx = later.create_version_context();
        ctx.init_write(TxId(50));
        let ctx = CursorContext::with_version(ctx);
        let mut writer = file.io(0u64, AccessMode::SharedWrite, &ctx)?;
        assert!(writer.next()?);
        writer.close();
    }

    let base_ctx = base.create_version_context();
    let base_cursor_ctx = CursorContext::with_version(base_ctx.clone());
    let mut reader = tracked.io(0u64, AccessMode::SharedRead, &base_cursor_ctx)?;
    assert!(reader.next()?);
    assert!(!base_ctx.is_dirty(), "nothing precedes the base transaction");
    reader.close();

    let later_ctx = later.create_version_context();
    let later_cursor_ctx = CursorContext::with_version(later_ctx.clone());
    let mut reader = untracked.io(0u64, AccessMode::SharedRead, &later_cursor_ctx)?;
    assert!(reader.next()?);
    assert!(!later_ctx.is_dirty(), "tracking disabled for this file");
    reader.close();

    let mut reader = tracked.io(0u64, AccessMode::SharedRead, &later_cursor_ctx)?;
    assert!(reader.next()?);
    assert!(later_ctx.is_dirty());
    reader.close();

    tracked.close()?;
    untracked.close()?;
    cache.close()
}
