#![forbid(unsafe_code)]
//! CLOCK eviction shared by faulting threads and the background evictor.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::cache::CacheCore;
use super::stats::CacheCounters;
use crate::types::{CacheError, FileId, FrameId, Result};

/// How long a fault waits for a pin release before sweeping again.
const RELEASE_WAIT: Duration = Duration::from_millis(10);

impl CacheCore {
    /// Returns a frame to fault into, evicting one if the free list is empty.
    ///
    /// Blocks while every frame is pinned.
    pub(crate) fn grab_free_frame(&self) -> Result<FrameId> {
        loop {
            self.ensure_open()?;
            if let Some(frame) = self.pool.pop_free() {
                if self.pool.free_len() < self.opts.keep_free {
                    self.wake_evictor();
                }
                return Ok(frame);
            }
            self.wake_evictor();
            match self.sweep_once()? {
                Some(frame) => {
                    CacheCounters::bump(&self.counters.cooperative_evictions);
                    return Ok(frame);
                }
                None => self.pool.wait_for_release(RELEASE_WAIT),
            }
        }
    }

    /// Advances the clock hand until one frame is evicted.
    ///
    /// Returns the evicted frame, unbound and unpinned, or `None` when two full
    /// turns found nothing evictable. The caller owns the returned frame.
    pub(crate) fn sweep_once(&self) -> Result<Option<FrameId>> {
        let victim = {
            let mut hand = self.hand.lock();
            let frames = self.pool.len();
            let mut found = None;
            for _ in 0..frames * 2 {
                let id = FrameId(*hand as u32);
                *hand = (*hand + 1) % frames;
                let frame = self.pool.frame(id);
                if frame.file() == FileId::UNBOUND || frame.pin_count() > 0 {
                    continue;
                }
                if frame.take_usage() {
                    continue;
                }
                if !frame.try_claim() {
                    continue;
                }
                if frame.file() == FileId::UNBOUND || !frame.lock.try_exclusive_lock() {
                    frame.release_claim();
                    continue;
                }
                found = Some(id);
                break;
            }
            found
        };
        let Some(id) = victim else {
            return Ok(None);
        };
        self.evict_claimed(id)?;
        Ok(Some(id))
    }

    /// Writes back and unbinds a frame that is claimed and exclusively locked.
    ///
    /// On failure the frame is released still bound and still dirty.
    pub(crate) fn evict_claimed(&self, id: FrameId) -> Result<()> {
        let frame = self.pool.frame(id);
        let file_id = frame.file();
        let page_id = frame.page_id();
        let file = self.files.read().get(&file_id).cloned();
        let Some(file) = file else {
            frame.unbind();
            frame.lock.explicitly_mark_clean();
            frame.lock.unlock_exclusive();
            frame.release_claim();
            return Ok(());
        };

        if frame.lock.is_modified() {
            let mut buf = vec![0u8; file.page_size];
            frame.page.read_into(0, &mut buf);
            if let Err(err) = file.swapper.write(page_id, &buf) {
                frame.lock.unlock_exclusive();
                frame.release_claim();
                CacheCounters::bump(&self.counters.eviction_errors);
                warn!(
                    path = %file.path.display(),
                    page = page_id.0,
                    error = %err,
                    "pagecache.evict.failed"
                );
                return Err(CacheError::EvictionFailure {
                    path: file.path.clone(),
                    page_id,
                    source: Box::new(err),
                });
            }
            CacheCounters::bump(&self.counters.eviction_flushes);
            CacheCounters::add(&self.counters.bytes_written, buf.len() as u64);
        }

        file.table.remove_resident(page_id, id);
        file.raise_highest_evicted_tx(frame.last_modified_tx());
        file.swapper.evicted(page_id);
        frame.unbind();
        frame.lock.explicitly_mark_clean();
        frame.lock.unlock_exclusive();
        frame.release_claim();
        CacheCounters::bump(&self.counters.evictions);
        trace!(file = %file_id, page = page_id.0, frame = id.0, "pagecache.evict");
        Ok(())
    }

    fn record_eviction_error(&self, err: CacheError) {
        *self.last_eviction_error.lock() = Some(Arc::new(err));
    }

    /// Evicts until the free list reaches the keep-free watermark or nothing is evictable.
    pub(crate) fn evict_to_watermark(&self) -> usize {
        let mut evicted = 0;
        while !self.is_closed() && self.pool.free_len() < self.opts.keep_free {
            match self.sweep_once() {
                Ok(Some(frame)) => {
                    self.pool.push_free(frame);
                    evicted += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    self.record_eviction_error(err);
                    break;
                }
            }
        }
        evicted
    }

    pub(crate) fn wake_evictor(&self) {
        let mut wake = self.evictor_wake.lock();
        *wake = true;
        self.evictor_cond.notify_one();
    }

    fn park_evictor(&self, timeout: Duration) {
        let mut wake = self.evictor_wake.lock();
        if !*wake {
            let _ = self.evictor_cond.wait_for(&mut wake, timeout);
        }
        *wake = false;
    }
}

/// Starts the background evictor thread.
pub(crate) fn spawn_evictor(core: Arc<CacheCore>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("pagecache-evictor".into())
        .spawn(move || run_evictor(&core))
        .map_err(CacheError::from)
}

fn run_evictor(core: &CacheCore) {
    debug!(keep_free = core.opts.keep_free, "pagecache.evictor.start");
    while !core.is_closed() {
        let evicted = core.evict_to_watermark();
        if evicted > 0 {
            trace!(evicted, free = core.pool.free_len(), "pagecache.evictor.pass");
        }
        core.park_evictor(core.opts.park);
    }
    debug!("pagecache.evictor.stop");
}
