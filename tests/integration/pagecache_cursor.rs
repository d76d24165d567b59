//! Cursor offsets, bounds handling, linked cursors and byte moves.

#![allow(missing_docs)]

use sombra_pagecache::{
    AccessMode, CacheError, CursorContext, IoOptions, PageCache, PageCacheOptions, PageId,
    PagedFile, Result,
};
use tempfile::{tempdir, TempDir};

const PAGE: usize = 64;

struct Harness {
    _dir: TempDir,
    cache: PageCache,
    file: PagedFile,
}

impl Harness {
    fn new(pages: u64) -> Result<Self> {
        let dir = tempdir()?;
        let cache = PageCache::new(PageCacheOptions::with_pages(PAGE, 8))?;
        let file = cache.map(dir.path().join("cursor.db"), PAGE)?;
        let mut cursor = file.io(0u64, AccessMode::Exclusive, &CursorContext::none())?;
        for page in 0..pages {
            assert!(cursor.next()?);
            for slot in 0..PAGE / 8 {
                cursor.put_u64((page << 8) | slot as u64);
            }
        }
        cursor.close();
        Ok(Self {
            _dir: dir,
            cache,
            file,
        })
    }
}

#[test]
fn typed_accessors_round_trip() -> Result<()> {
    let h = Harness::new(1)?;
    let mut w = h.file.io(0u64, AccessMode::SharedWrite, &CursorContext::none())?;
    assert!(w.next()?);
    w.put_u8(0xab);
    w.put_i8(-3);
    w.put_u16(0xbeef);
    w.put_i16(-1234);
    w.put_u32(0xdead_beef);
    w.put_i32(-7);
    w.put_u64(u64::MAX - 1);
    w.put_i64(i64::MIN);
    assert_eq!(w.offset(), 1 + 1 + 2 + 2 + 4 + 4 + 8 + 8);
    w.rewind();
    assert_eq!(w.get_u8(), 0xab);
    assert_eq!(w.get_i8(), -3);
    assert_eq!(w.get_u16(), 0xbeef);
    assert_eq!(w.get_i16(), -1234);
    assert_eq!(w.get_u32(), 0xdead_beef);
    assert_eq!(w.get_i32(), -7);
    assert_eq!(w.get_u64(), u64::MAX - 1);
    assert_eq!(w.get_i64(), i64::MIN);
    assert!(!w.check_and_clear_bounds_flag());
    w.close();
    h.file.close()?;
    h.cache.close()
}

#[test]
fn out_of_bounds_access_raises_flag_without_panicking() -> Result<()> {
    let h = Harness::new(1)?;
    let mut c = h.file.io(0u64, AccessMode::SharedWrite, &CursorContext::none())?;
    assert!(c.next()?);
    assert_eq!(c.get_u64_at(PAGE - 4), 0);
    assert!(c.check_and_clear_bounds_flag());
    assert!(!c.check_and_clear_bounds_flag(), "flag is cleared by the check");

    let before = c.get_u32_at(PAGE - 4);
    c.put_u64_at(PAGE - 4, 1);
    assert!(c.check_and_clear_bounds_flag());
    assert_eq!(c.get_u32_at(PAGE - 4), before, "out-of-bounds write is dropped");

    c.set_offset(PAGE + 1);
    assert_eq!(c.offset(), 0);
    assert!(c.check_and_clear_bounds_flag());

    c.set_offset(PAGE - 2);
    c.put_u32(9);
    assert!(c.check_and_clear_bounds_flag());

    let mut unbound = h.file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
    assert_eq!(unbound.get_u8_at(0), 0);
    assert!(unbound.check_and_clear_bounds_flag(), "unbound cursor has no page");
    Ok(())
}

#[test]
fn mark_restores_offset_and_flag() -> Result<()> {
    let h = Harness::new(1)?;
    let mut c = h.file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
    assert!(c.next()?);
    c.set_offset(16);
    c.mark();
    assert_eq!(c.get_u64(), 2);
    assert_eq!(c.offset(), 24);
    c.set_offset_to_mark();
    assert_eq!(c.offset(), 16);
    assert_eq!(c.get_u64(), 2);

    c.set_offset(PAGE + 8);
    c.mark();
    assert!(c.check_and_clear_bounds_flag());
    c.set_offset_to_mark();
    assert!(c.check_and_clear_bounds_flag(), "mark captured the raised flag");
    Ok(())
}

#[test]
fn linked_cursor_follows_parent_lifecycle() -> Result<()> {
    let h = Harness::new(3)?;
    let mut parent = h.file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
    assert!(parent.next()?);
    {
        let linked = parent.open_linked_cursor(2u64)?;
        assert!(linked.next()?);
        assert_eq!(linked.current_page_id(), Some(PageId(2)));
        assert_eq!(linked.mode(), AccessMode::SharedRead);
        assert_eq!(linked.get_u64_at(8), (2 << 8) | 1);
        linked.get_u8_at(PAGE);
    }
    assert!(
        matches!(parent.open_linked_cursor(1u64), Err(CacheError::LinkedCursorInUse)),
        "previous linked cursor still open"
    );
    assert!(parent.check_and_clear_bounds_flag(), "flag reported across the chain");
    assert!(!parent.should_retry()?);

    parent.close();
    assert!(parent.is_closed());
    Ok(())
}

#[test]
fn closed_linked_cursor_can_be_reopened() -> Result<()> {
    let h = Harness::new(3)?;
    let mut parent = h.file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
    assert!(parent.next()?);
    parent.open_linked_cursor(1u64)?.close();
    let linked = parent.open_linked_cursor(2u64)?;
    assert!(!linked.is_closed());
    assert!(linked.next()?);
    assert_eq!(linked.current_page_id(), Some(PageId(2)));
    parent.close();
    Ok(())
}

#[test]
fn cursor_exception_surfaces_once() -> Result<()> {
    let h = Harness::new(2)?;
    let mut c = h.file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
    assert!(c.next()?);
    c.set_cursor_exception("record header is corrupt");
    match c.check_and_clear_cursor_exception() {
        Err(CacheError::CursorException(msg)) => assert_eq!(msg, "record header is corrupt"),
        other => panic!("expected cursor exception, got {other:?}"),
    }
    c.check_and_clear_cursor_exception()?;

    c.open_linked_cursor(1u64)?.set_cursor_exception("linked");
    assert!(matches!(
        c.check_and_clear_cursor_exception(),
        Err(CacheError::CursorException(_))
    ));

    c.set_cursor_exception("dropped");
    c.clear_cursor_exception();
    c.check_and_clear_cursor_exception()?;

    c.set_cursor_exception("reset by next");
    assert!(c.next()?);
    c.check_and_clear_cursor_exception()?;
    Ok(())
}

#[test]
fn copy_to_clamps_to_both_pages() -> Result<()> {
    let h = Harness::new(2)?;
    let mut src = h.file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
    let mut dst = h.file.io(1u64, AccessMode::SharedWrite, &CursorContext::none())?;
    assert!(src.next()?);
    assert!(dst.next()?);

    assert_eq!(src.copy_to(0, &mut dst, 8, 16), 16);
    assert_eq!(dst.get_u64_at(8), 0);
    assert_eq!(dst.get_u64_at(16), 1);
    assert_eq!(dst.get_u64_at(24), (1 << 8) | 3);

    assert_eq!(src.copy_to(PAGE - 8, &mut dst, 0, 64), 8);
    assert_eq!(dst.get_u64_at(0), (PAGE / 8 - 1) as u64);
    assert_eq!(src.copy_to(48, &mut dst, PAGE - 4, 64), 4);

    assert_eq!(src.copy_to(PAGE, &mut dst, 0, 1), 0);
    assert!(src.check_and_clear_bounds_flag());
    Ok(())
}

#[test]
fn shift_bytes_moves_in_both_directions() -> Result<()> {
    let h = Harness::new(1)?;
    let mut c = h.file.io(0u64, AccessMode::Exclusive, &CursorContext::none())?;
    assert!(c.next()?);
    c.shift_bytes(0, 16, 8);
    assert_eq!(c.get_u64_at(0), 0);
    assert_eq!(c.get_u64_at(8), 0);
    assert_eq!(c.get_u64_at(16), 1);
    assert_eq!(c.get_u64_at(24), 3);

    c.shift_bytes(16, 16, -16);
    assert_eq!(c.get_u64_at(0), 1);
    assert_eq!(c.get_u64_at(8), 3);
    assert!(!c.check_and_clear_bounds_flag());

    c.shift_bytes(PAGE - 8, 8, 1);
    assert!(c.check_and_clear_bounds_flag());
    c.shift_bytes(0, 8, -1);
    assert!(c.check_and_clear_bounds_flag());
    Ok(())
}

#[test]
fn fill_and_zap() -> Result<()> {
    let h = Harness::new(1)?;
    let mut c = h.file.io(0u64, AccessMode::SharedWrite, &CursorContext::none())?;
    assert!(c.next()?);
    c.set_offset(4);
    c.put_fill(0xff, 8);
    assert_eq!(c.offset(), 12);
    assert_eq!(c.get_u32_at(4), u32::MAX);
    assert_eq!(c.get_u32_at(8), u32::MAX);
    assert_eq!(c.get_u32_at(12), 0);

    c.zap_page();
    let mut buf = [1u8; PAGE];
    c.get_bytes_at(0, &mut buf);
    assert!(buf.iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn next_page_to_current_page_keeps_pin() -> Result<()> {
    let h = Harness::new(3)?;
    let mut c = h.file.io(0u64, AccessMode::SharedRead, &CursorContext::none())?;
    assert!(c.next_page(1u64)?);
    c.set_offset(24);
    assert!(c.next_page(1u64)?);
    assert_eq!(c.offset(), 24, "staying on the page keeps the offset");
    assert!(c.next()?);
    assert_eq!(c.current_page_id(), Some(PageId(2)));
    assert!(!c.next()?);
    assert_eq!(c.page_size(), 0);
    Ok(())
}

#[test]
#[should_panic(expected = "cannot write through a SharedRead cursor")]
fn read_cursor_rejects_writes() {
    let h = Harness::new(1).unwrap();
    let mut c = h
        .file
        .io(0u64, AccessMode::SharedRead, &CursorContext::none())
        .unwrap();
    assert!(c.next().unwrap());
    c.put_u32_at(0, 1);
}

#[test]
#[should_panic(expected = "page cursor used after close")]
fn closed_cursor_rejects_access() {
    let h = Harness::new(1).unwrap();
    let mut c = h
        .file
        .io(0u64, AccessMode::SharedWrite, &CursorContext::none())
        .unwrap();
    assert!(c.next().unwrap());
    c.close();
    c.put_u64_at(0, 42);
}

#[test]
fn no_fault_cursor_binds_only_resident_pages() -> Result<()> {
    let Harness { _dir, cache, file } = Harness::new(3)?;
    let path = file.path().to_path_buf();
    file.close()?;
    let file = cache.map(&path, PAGE)?;

    let mut warm = file.io(1u64, AccessMode::SharedRead, &CursorContext::none())?;
    assert!(warm.next()?);
    warm.close();
    let faults = cache.stats().faults;

    let no_fault = IoOptions {
        no_fault: true,
        ..IoOptions::from(AccessMode::SharedRead)
    };
    let mut c = file.io(0u64, no_fault, &CursorContext::none())?;
    assert!(c.next()?, "page 0 exists but is not cached");
    assert_eq!(c.current_page_id(), None);
    assert_eq!(c.get_u64_at(0), 0);
    assert!(c.check_and_clear_bounds_flag());

    assert!(c.next()?);
    assert_eq!(c.current_page_id(), Some(PageId(1)));
    assert_eq!(c.get_u64_at(8), (1 << 8) | 1);
    assert!(!c.should_retry()?);

    assert!(c.next()?);
    assert_eq!(c.current_page_id(), None);
    assert!(!c.next()?, "past the last page");
    c.close();
    assert_eq!(cache.stats().faults, faults, "no page was faulted in");

    let writer = IoOptions {
        no_fault: true,
        ..IoOptions::from(AccessMode::SharedWrite)
    };
    let mut w = file.io(3u64, writer, &CursorContext::none())?;
    assert!(!w.next()?, "no_fault implies no_grow");
    w.close();
    assert_eq!(file.last_page_id()?, Some(PageId(2)));
    file.close()?;
    cache.close()
}
