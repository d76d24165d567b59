#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

const WORD: usize = 8;

/// Fixed-size byte buffer backing one frame.
///
/// Bytes live in little-endian lanes of atomic words so optimistic readers
/// can copy a page while a writer mutates it; torn results are caught by the
/// frame's lock stamp, never observed as undefined behaviour.
pub(crate) struct Page {
    words: Box<[AtomicU64]>,
}

impl Page {
    pub(crate) fn new(size: usize) -> Self {
        debug_assert!(size % WORD == 0, "page size must be word aligned");
        let words = (0..size / WORD).map(|_| AtomicU64::new(0)).collect();
        Self { words }
    }

    pub(crate) fn len(&self) -> usize {
        self.words.len() * WORD
    }

    /// Copies `dst.len()` bytes starting at `off` into `dst`.
    pub(crate) fn read_into(&self, off: usize, dst: &mut [u8]) {
        debug_assert!(off + dst.len() <= self.len());
        let mut pos = off;
        let mut filled = 0;
        while filled < dst.len() {
            let word = self.words[pos / WORD].load(Ordering::Relaxed).to_le_bytes();
            let lane = pos % WORD;
            let take = (WORD - lane).min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&word[lane..lane + take]);
            filled += take;
            pos += take;
        }
    }

    /// Copies `src` into the page starting at `off`.
    pub(crate) fn write_from(&self, off: usize, src: &[u8]) {
        debug_assert!(off + src.len() <= self.len());
        let mut pos = off;
        let mut done = 0;
        while done < src.len() {
            let lane = pos % WORD;
            let take = (WORD - lane).min(src.len() - done);
            let slot = &self.words[pos / WORD];
            if take == WORD {
                let mut bytes = [0u8; WORD];
                bytes.copy_from_slice(&src[done..done + WORD]);
                slot.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
            } else {
                let mut bytes = [0u8; WORD];
                bytes[lane..lane + take].copy_from_slice(&src[done..done + take]);
                let value = u64::from_le_bytes(bytes);
                let mask = lane_mask(lane, take);
                // Shared writers may own other lanes of the same word.
                let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                    Some((old & !mask) | (value & mask))
                });
            }
            done += take;
            pos += take;
        }
    }

    /// Sets `len` bytes starting at `off` to `byte`.
    pub(crate) fn fill(&self, off: usize, len: usize, byte: u8) {
        let chunk = [byte; 64];
        let mut pos = off;
        let end = off + len;
        while pos < end {
            let take = (end - pos).min(chunk.len());
            self.write_from(pos, &chunk[..take]);
            pos += take;
        }
    }

    /// Zeroes the whole page.
    pub(crate) fn zero(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Moves `len` bytes from `src` to `dst` inside the page; the ranges may overlap.
    pub(crate) fn copy_within(&self, src: usize, dst: usize, len: usize) {
        let mut tmp = vec![0u8; len];
        self.read_into(src, &mut tmp);
        self.write_from(dst, &tmp);
    }
}

fn lane_mask(lane: usize, len: usize) -> u64 {
    let bits = if len == WORD {
        u64::MAX
    } else {
        (1u64 << (len * 8)) - 1
    };
    bits << (lane * 8)
}
