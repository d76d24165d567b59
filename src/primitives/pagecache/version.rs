#![forbid(unsafe_code)]
//! Snapshot tracking for readers that run alongside committing writers.
//!
//! A [`VersionContext`] captures the last closed transaction id when a read
//! starts. Every page a read cursor pins is compared against that baseline:
//! if the page was last modified by a newer transaction, or the file has
//! evicted a page touched by one, the context is marked dirty and the caller
//! is expected to restart its logical read.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::{TxId, BASE_TX_ID};

const UNTRACKED: u64 = u64::MAX;

/// Source of the last closed transaction id.
pub trait TransactionIdStore: Send + Sync {
    /// Highest transaction id whose effects are visible to new readers.
    fn last_closed_transaction_id(&self) -> TxId;
}

impl TransactionIdStore for AtomicU64 {
    fn last_closed_transaction_id(&self) -> TxId {
        TxId(self.load(Ordering::Acquire))
    }
}

impl<T: TransactionIdStore + ?Sized> TransactionIdStore for Arc<T> {
    fn last_closed_transaction_id(&self) -> TxId {
        (**self).last_closed_transaction_id()
    }
}

/// Hands out [`VersionContext`]s bound to one transaction id store.
#[derive(Clone)]
pub struct VersionContextSupplier {
    store: Arc<dyn TransactionIdStore>,
}

impl VersionContextSupplier {
    /// Creates a supplier reading ids from `store`.
    pub fn new(store: Arc<dyn TransactionIdStore>) -> Self {
        Self { store }
    }

    /// Creates a context whose read baseline is already captured.
    pub fn create_version_context(&self) -> Arc<VersionContext> {
        let ctx = VersionContext::new(Arc::clone(&self.store));
        ctx.init_read();
        Arc::new(ctx)
    }
}

/// Per-transaction snapshot state consulted by cursors.
pub struct VersionContext {
    store: Arc<dyn TransactionIdStore>,
    baseline: AtomicU64,
    committing: AtomicU64,
    dirty: AtomicBool,
    attempts: AtomicU32,
}

impl VersionContext {
    /// Creates an untracked context; call [`VersionContext::init_read`] to start tracking.
    pub fn new(store: Arc<dyn TransactionIdStore>) -> Self {
        Self {
            store,
            baseline: AtomicU64::new(UNTRACKED),
            committing: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    /// Captures a fresh baseline and clears the dirty flag.
    pub fn init_read(&self) {
        let last_closed = self.store.last_closed_transaction_id();
        self.baseline.store(last_closed.0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
    }

    /// Records the id that write cursors stamp onto the pages they release.
    pub fn init_write(&self, committing: TxId) {
        self.committing.store(committing.0, Ordering::Release);
    }

    /// Id set by [`VersionContext::init_write`], `TxId(0)` for read-only work.
    pub fn committing_transaction_id(&self) -> TxId {
        TxId(self.committing.load(Ordering::Acquire))
    }

    /// Read baseline, `None` before [`VersionContext::init_read`].
    pub fn last_closed_transaction_id(&self) -> Option<TxId> {
        match self.baseline.load(Ordering::Acquire) {
            UNTRACKED => None,
            id => Some(TxId(id)),
        }
    }

    /// Flags the current read as having seen data newer than its baseline.
    pub fn mark_as_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns true if the read must be restarted.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Counts a retry and captures a new baseline.
    pub fn restart_read(&self) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        self.init_read();
    }

    /// Number of [`VersionContext::restart_read`] calls so far.
    pub fn additional_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Compares a pinned page against the baseline and marks the context dirty if it is newer.
    ///
    /// Returns the resulting dirty flag.
    pub fn observe(&self, page_tx: TxId, highest_evicted_tx: TxId) -> bool {
        let Some(baseline) = self.last_closed_transaction_id() else {
            return self.is_dirty();
        };
        if baseline <= BASE_TX_ID {
            return self.is_dirty();
        }
        if page_tx > baseline || highest_evicted_tx > baseline {
            self.mark_as_dirty();
        }
        self.is_dirty()
    }
}

impl fmt::Debug for VersionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionContext")
            .field("baseline", &self.last_closed_transaction_id())
            .field("committing", &self.committing_transaction_id())
            .field("dirty", &self.is_dirty())
            .field("attempts", &self.additional_attempts())
            .finish()
    }
}

/// Per-operation state handed to [`crate::PagedFile::io`].
#[derive(Clone, Debug, Default)]
pub struct CursorContext {
    version: Option<Arc<VersionContext>>,
}

impl CursorContext {
    /// Context with no version tracking.
    pub fn none() -> Self {
        Self::default()
    }

    /// Context tracking reads and writes through `version`.
    pub fn with_version(version: Arc<VersionContext>) -> Self {
        Self {
            version: Some(version),
        }
    }

    /// Attached version context, if any.
    pub fn version_context(&self) -> Option<&Arc<VersionContext>> {
        self.version.as_ref()
    }

    pub(crate) fn committing_tx(&self) -> u64 {
        self.version
            .as_ref()
            .map_or(0, |v| v.committing_transaction_id().0)
    }
}
