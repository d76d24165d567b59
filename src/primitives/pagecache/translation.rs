#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::primitives::concurrency::Latch;
use crate::types::{FrameId, PageId};

/// State of one page in a file's translation table.
#[derive(Clone)]
pub(crate) enum Slot {
    Resident(FrameId),
    /// A fault is loading the page; followers wait on the latch.
    Faulting(Arc<Latch>),
}

/// Outcome of [`TranslationTable::begin_fault`].
pub(crate) enum FaultClaim {
    /// Caller owns the fault and must publish or abort it.
    Leader(Arc<Latch>),
    /// The page was published or claimed since the caller looked.
    Existing,
}

/// Page id to frame mapping for one file, striped to spread contention.
pub(crate) struct TranslationTable {
    stripes: Box<[RwLock<FxHashMap<u64, Slot>>]>,
    mask: u64,
}

impl TranslationTable {
    pub(crate) fn new(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        Self {
            stripes: (0..count).map(|_| RwLock::new(FxHashMap::default())).collect(),
            mask: count as u64 - 1,
        }
    }

    fn stripe(&self, page_id: PageId) -> &RwLock<FxHashMap<u64, Slot>> {
        &self.stripes[(page_id.0 & self.mask) as usize]
    }

    pub(crate) fn get(&self, page_id: PageId) -> Option<Slot> {
        self.stripe(page_id).read().get(&page_id.0).cloned()
    }

    pub(crate) fn begin_fault(&self, page_id: PageId) -> FaultClaim {
        let mut stripe = self.stripe(page_id).write();
        if stripe.contains_key(&page_id.0) {
            return FaultClaim::Existing;
        }
        let latch = Arc::new(Latch::new());
        stripe.insert(page_id.0, Slot::Faulting(Arc::clone(&latch)));
        FaultClaim::Leader(latch)
    }

    pub(crate) fn publish(&self, page_id: PageId, frame: FrameId) {
        self.stripe(page_id)
            .write()
            .insert(page_id.0, Slot::Resident(frame));
    }

    pub(crate) fn abort_fault(&self, page_id: PageId) {
        let mut stripe = self.stripe(page_id).write();
        if matches!(stripe.get(&page_id.0), Some(Slot::Faulting(_))) {
            stripe.remove(&page_id.0);
        }
    }

    /// Removes the entry if it still maps to `frame`.
    pub(crate) fn remove_resident(&self, page_id: PageId, frame: FrameId) -> bool {
        let mut stripe = self.stripe(page_id).write();
        match stripe.get(&page_id.0) {
            Some(Slot::Resident(f)) if *f == frame => {
                stripe.remove(&page_id.0);
                true
            }
            _ => false,
        }
    }

    /// Resident pages sorted by page id.
    pub(crate) fn resident(&self) -> Vec<(PageId, FrameId)> {
        let mut out = Vec::new();
        for stripe in self.stripes.iter() {
            let stripe = stripe.read();
            out.extend(stripe.iter().filter_map(|(page, slot)| match slot {
                Slot::Resident(frame) => Some((PageId(*page), *frame)),
                Slot::Faulting(_) => None,
            }));
        }
        out.sort_unstable_by_key(|(page, _)| *page);
        out
    }

    pub(crate) fn has_faults_in_flight(&self) -> bool {
        self.stripes.iter().any(|stripe| {
            stripe
                .read()
                .values()
                .any(|slot| matches!(slot, Slot::Faulting(_)))
        })
    }
}
