use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fairshare_core::Task;
use tracing::{debug, warn};

use crate::producer::Producer;
use crate::slots::SlotPermit;
use crate::stats::DispatchCounters;
use crate::sync::lock;

use super::Dispatcher;

impl Dispatcher {
    /// Schedule tasks until no slot is free or no producer has work.
    ///
    /// Concurrent callers coalesce: if another thread is already draining,
    /// this call only records a wakeup and returns, and the draining thread
    /// makes one more pass for it. Completion callbacks therefore never
    /// recurse, whatever the backend does. Returns the number of tasks this
    /// call submitted.
    pub fn run_loop(&self) -> usize {
        if self.wakeups.fetch_add(1, Ordering::AcqRel) != 0 {
            return 0;
        }
        let mut scheduled = 0;
        let mut claim = WakeupClaim {
            wakeups: &self.wakeups,
            claimed: 1,
        };
        loop {
            while self.schedule_one() {
                scheduled += 1;
            }
            let prev = self.wakeups.fetch_sub(claim.claimed, Ordering::AcqRel);
            if prev == claim.claimed {
                claim.claimed = 0;
                break;
            }
            claim.claimed = prev - claim.claimed;
        }
        if scheduled > 0 {
            debug!(scheduled, executing = self.executing(), "run loop drained");
        }
        scheduled
    }

    /// Try to start exactly one task. Never blocks.
    ///
    /// Returns `false` when the global cap is reached or when a full lap of
    /// the rotation found no producer with a ready task. Terminated tasks
    /// are dropped unrun (their producer still counts them completed) and
    /// the search continues without consuming a slot.
    pub fn schedule_one(&self) -> bool {
        loop {
            let Some(permit) = self.executing.try_acquire_owned() else {
                return false;
            };

            let Some(task) = self.find_task() else {
                return false;
            };

            if task.is_terminated() {
                debug!(task = %task.id(), owner = %task.owner(), "discarding terminated task");
                DispatchCounters::bump(&self.counters.discarded);
                drop(task);
                drop(permit);
                continue;
            }

            self.submit(task, permit);
            return true;
        }
    }

    /// One lap of the rotation: ask each attached producer at most once.
    fn find_task(&self) -> Option<Task> {
        let attempts = self.attached_count();
        for _ in 0..attempts {
            let producer = self.next_producer()?;
            if let Some(task) = producer.next() {
                return Some(task);
            }
        }
        None
    }

    /// The attached producer after the one chosen last, wrapping to the
    /// first.
    pub(crate) fn next_producer(&self) -> Option<Arc<Producer>> {
        let mut rotation = lock(&self.rotation);
        let (key, producer) = match rotation.last {
            Some(last) => rotation
                .producers
                .range((Excluded(last), Unbounded))
                .next()
                .or_else(|| rotation.producers.iter().next()),
            None => rotation.producers.iter().next(),
        }
        .map(|(key, producer)| (*key, Arc::clone(producer)))?;
        rotation.last = Some(key);
        Some(producer)
    }

    fn submit(&self, task: Task, permit: SlotPermit) {
        let task_id = task.id();
        let dispatcher = self.self_ref.clone();
        DispatchCounters::bump(&self.counters.submitted);
        debug!(task = %task_id, owner = %task.owner(), "submitting task");

        self.backend.execute(
            task,
            Box::new(move |result| {
                drop(permit);
                let Some(dispatcher) = dispatcher.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => DispatchCounters::bump(&dispatcher.counters.completed),
                    Err(e) => {
                        warn!(task = %task_id, error = %e, "task failed");
                        DispatchCounters::bump(&dispatcher.counters.failed);
                    }
                }
                dispatcher.run_loop();
            }),
        );
    }
}

/// Wakeups the draining thread has taken responsibility for. Handed back
/// if a pass unwinds, so the next caller becomes the drainer.
struct WakeupClaim<'a> {
    wakeups: &'a AtomicUsize,
    claimed: usize,
}

impl Drop for WakeupClaim<'_> {
    fn drop(&mut self) {
        if self.claimed > 0 {
            self.wakeups.fetch_sub(self.claimed, Ordering::AcqRel);
        }
    }
}
