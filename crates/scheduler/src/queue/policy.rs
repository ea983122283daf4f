//! Pluggable policies for [`KeyedQueue`](super::KeyedQueue).

use std::collections::VecDeque;
use std::hash::Hash;

use fairshare_core::{OwnerKey, Task};

/// Maps a task to the fairness partition it is queued under.
pub trait KeyProvider<K>: Send + Sync {
    fn key_of(&self, task: &Task) -> K;
}

impl<K, F> KeyProvider<K> for F
where
    F: Fn(&Task) -> K + Send + Sync,
    K: Eq + Hash + Clone,
{
    fn key_of(&self, task: &Task) -> K {
        self(task)
    }
}

/// Partitions by the task's owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerKeyProvider;

impl KeyProvider<OwnerKey> for OwnerKeyProvider {
    fn key_of(&self, task: &Task) -> OwnerKey {
        task.owner().clone()
    }
}

/// Chooses which of one key's queued tasks runs next.
pub trait Prioritiser: Send + Sync {
    /// Remove and return the chosen task. `None` only for an empty backlog;
    /// a queue that gets `None` for a non-empty backlog takes the oldest
    /// task instead.
    fn select_and_remove(&self, backlog: &mut VecDeque<Task>) -> Option<Task>;
}

/// FIFO within a key.
#[derive(Debug, Default, Clone, Copy)]
pub struct OldestFirst;

impl Prioritiser for OldestFirst {
    fn select_and_remove(&self, backlog: &mut VecDeque<Task>) -> Option<Task> {
        backlog.pop_front()
    }
}

/// Most urgent [`Priority`](fairshare_core::Priority) first, FIFO among
/// equals.
#[derive(Debug, Default, Clone, Copy)]
pub struct HighestPriorityFirst;

impl Prioritiser for HighestPriorityFirst {
    fn select_and_remove(&self, backlog: &mut VecDeque<Task>) -> Option<Task> {
        // min_by_key keeps the first of equal minima, i.e. the oldest.
        let idx = backlog
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.priority())
            .map(|(i, _)| i)?;
        backlog.remove(idx)
    }
}
