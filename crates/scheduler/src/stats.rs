use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Tasks currently running on the backend.
    pub executing: usize,
    /// Global concurrency cap.
    pub max_threads: usize,
    /// Producers currently in the rotation.
    pub attached_producers: usize,
    /// Tasks handed to the backend.
    pub submitted: u64,
    /// Backend completions reported as success.
    pub completed: u64,
    /// Backend completions reported as failure or panic.
    pub failed: u64,
    /// Terminated tasks dropped before submission.
    pub discarded: u64,
    /// Producers that have left the rotation.
    pub detached_producers: u64,
}

/// Point-in-time view of a [`Producer`](crate::Producer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerStats {
    pub name: String,
    pub threads_used: usize,
    pub max_threads: usize,
    pub issued: u64,
    pub completed: u64,
    pub attached: bool,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub discarded: AtomicU64,
    pub detached: AtomicU64,
}

impl DispatchCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats() {
        let s = DispatcherStats::default();
        assert_eq!(s.executing, 0);
        assert_eq!(s.submitted, 0);
        assert_eq!(s.attached_producers, 0);
    }

    #[test]
    fn stats_serialize() {
        let s = DispatcherStats {
            executing: 2,
            max_threads: 4,
            submitted: 10,
            ..Default::default()
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["executing"], 2);
        assert_eq!(json["max_threads"], 4);
        assert_eq!(json["submitted"], 10);
    }

    #[test]
    fn counters_bump() {
        let c = DispatchCounters::default();
        DispatchCounters::bump(&c.submitted);
        DispatchCounters::bump(&c.submitted);
        assert_eq!(DispatchCounters::read(&c.submitted), 2);
        assert_eq!(DispatchCounters::read(&c.failed), 0);
    }
}
