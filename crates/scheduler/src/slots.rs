//! Bounded concurrency slot accounting.
//!
//! A [`SlotGauge`] counts slots in use against a limit. Acquisition is a
//! compare-and-swap, so `0 <= used <= limit` holds at every instant rather
//! than being restored after an optimistic overshoot. Lowering the limit
//! below the current usage is allowed; no new slot is granted until usage
//! drops under the new limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct SlotGauge {
    used: AtomicUsize,
    limit: AtomicUsize,
}

impl SlotGauge {
    pub fn new(limit: usize) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        }
    }

    /// Take one slot if one is free. Never blocks.
    pub fn try_acquire(&self) -> bool {
        let limit = self.limit.load(Ordering::Acquire);
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < limit).then_some(used + 1)
            })
            .is_ok()
    }

    /// Like [`try_acquire`](Self::try_acquire), returning a guard that gives
    /// the slot back when dropped.
    pub fn try_acquire_owned(self: &Arc<Self>) -> Option<SlotPermit> {
        self.try_acquire().then(|| SlotPermit {
            gauge: Arc::clone(self),
        })
    }

    /// Return one slot.
    pub fn release(&self) {
        let prev = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| used.checked_sub(1));
        debug_assert!(prev.is_ok(), "slot released more times than acquired");
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.used())
    }
}

/// One acquired slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct SlotPermit {
    gauge: Arc<SlotGauge>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.gauge.release();
    }
}
