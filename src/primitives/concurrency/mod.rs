#![forbid(unsafe_code)]
//! Per-frame lock word, fault latches and spin backoff.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

const EXL_MASK: u64 = 1 << 63;
const FLS_MASK: u64 = 1 << 62;
const MOD_MASK: u64 = 1 << 61;
const CNT_SHIFT: u32 = 48;
const CNT_UNIT: u64 = 1 << CNT_SHIFT;
const WLS_MASK: u64 = ((1 << 13) - 1) << CNT_SHIFT;
const SEQ_MASK: u64 = CNT_UNIT - 1;
/// Bits a read stamp must still match for the read to be valid.
const CHK_MASK: u64 = EXL_MASK | WLS_MASK | SEQ_MASK;

/// Lock word guarding one frame.
///
/// The word packs an exclusive bit, a flush bit, a modified bit, a count of
/// shared write locks and a 48-bit sequence. Readers never take the lock:
/// they record the sequence with [`PageLock::try_optimistic_read`] and later
/// ask [`PageLock::validate_read`] whether any writer overlapped them.
#[derive(Debug, Default)]
pub struct PageLock {
    state: AtomicU64,
}

fn next_seq(state: u64) -> u64 {
    (state & !SEQ_MASK) | ((state + 1) & SEQ_MASK)
}

impl PageLock {
    /// Creates an unlocked, clean lock word.
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Starts an optimistic read and returns its stamp.
    pub fn try_optimistic_read(&self) -> u64 {
        self.state.load(Ordering::Acquire) & SEQ_MASK
    }

    /// Returns true if no write or exclusive lock overlapped the read started at `stamp`.
    pub fn validate_read(&self, stamp: u64) -> bool {
        fence(Ordering::Acquire);
        self.state.load(Ordering::Relaxed) & CHK_MASK == stamp
    }

    /// Takes one shared write lock. Fails only while the exclusive lock is held.
    pub fn try_write_lock(&self) -> bool {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            if s & EXL_MASK != 0 {
                return false;
            }
            if s & WLS_MASK == WLS_MASK {
                // Counter saturated; the caller backs off and retries.
                return false;
            }
            match self.state.compare_exchange_weak(
                s,
                s + CNT_UNIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    fence(Ordering::Release);
                    return true;
                }
                Err(actual) => s = actual,
            }
        }
    }

    /// Releases one shared write lock, advancing the sequence and marking the frame modified.
    pub fn unlock_write(&self) {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(s & WLS_MASK != 0, "write lock not held");
            let n = (next_seq(s) - CNT_UNIT) | MOD_MASK;
            match self
                .state
                .compare_exchange_weak(s, n, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => s = actual,
            }
        }
    }

    /// Takes the exclusive lock. Requires no writers, no exclusive holder and no flush.
    pub fn try_exclusive_lock(&self) -> bool {
        let s = self.state.load(Ordering::Relaxed);
        if s & (EXL_MASK | FLS_MASK | WLS_MASK) != 0 {
            return false;
        }
        let won = self
            .state
            .compare_exchange(s, s | EXL_MASK, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if won {
            fence(Ordering::Release);
        }
        won
    }

    /// Releases the exclusive lock and advances the sequence.
    pub fn unlock_exclusive(&self) {
        self.release_exclusive(0);
    }

    /// Releases the exclusive lock, advances the sequence and marks the frame modified.
    pub fn unlock_exclusive_and_mark_modified(&self) {
        self.release_exclusive(MOD_MASK);
    }

    fn release_exclusive(&self, extra: u64) {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(s & EXL_MASK != 0, "exclusive lock not held");
            let n = (next_seq(s) & !EXL_MASK) | extra;
            match self
                .state
                .compare_exchange_weak(s, n, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => s = actual,
            }
        }
    }

    /// Turns a held exclusive lock into one shared write lock.
    pub fn unlock_exclusive_to_write(&self) {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(s & EXL_MASK != 0, "exclusive lock not held");
            let n = (next_seq(s) & !EXL_MASK) + CNT_UNIT;
            match self
                .state
                .compare_exchange_weak(s, n, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => s = actual,
            }
        }
    }

    /// Takes the flush lock and returns the stamp to hand back to [`PageLock::unlock_flush`].
    ///
    /// Writers may proceed while a flush lock is held.
    pub fn try_flush_lock(&self) -> Option<u64> {
        let s = self.state.load(Ordering::Relaxed);
        if s & (EXL_MASK | FLS_MASK) != 0 {
            return None;
        }
        self.state
            .compare_exchange(s, s | FLS_MASK, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| s & SEQ_MASK)
    }

    /// Releases the flush lock.
    ///
    /// The modified bit is cleared only when the flush succeeded and no
    /// writer unlocked since the flush lock was taken.
    pub fn unlock_flush(&self, stamp: u64, success: bool) {
        let mut s = self.state.load(Ordering::Relaxed);
        loop {
            debug_assert!(s & FLS_MASK != 0, "flush lock not held");
            let mut n = s & !FLS_MASK;
            if success && s & (SEQ_MASK | WLS_MASK) == stamp {
                n &= !MOD_MASK;
            }
            match self
                .state
                .compare_exchange_weak(s, n, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => s = actual,
            }
        }
    }

    /// Clears the modified bit while the caller holds the exclusive lock.
    pub fn explicitly_mark_clean(&self) {
        self.state.fetch_and(!MOD_MASK, Ordering::Release);
    }

    /// Returns true if the frame holds changes that have not been written back.
    pub fn is_modified(&self) -> bool {
        self.state.load(Ordering::Acquire) & MOD_MASK != 0
    }

    /// Returns true if the exclusive lock is held.
    pub fn is_exclusively_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & EXL_MASK != 0
    }

    /// Number of shared write locks currently held.
    pub fn write_lock_count(&self) -> u64 {
        (self.state.load(Ordering::Acquire) & WLS_MASK) >> CNT_SHIFT
    }
}

/// One-shot gate that page-fault followers wait on while the leader loads the page.
#[derive(Debug, Default)]
pub struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Creates a closed latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the latch and wakes every waiter.
    pub fn release(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.cond.notify_all();
    }

    /// Blocks until [`Latch::release`] has been called.
    pub fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cond.wait(&mut released);
        }
    }

    /// Returns true once released.
    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }
}

/// Spin, then yield, then sleep.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    /// Creates a fresh backoff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits a little longer than last time.
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(50));
        }
        self.step = self.step.saturating_add(1);
    }
}
