use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fairshare_core::{OwnerKey, Task};
use tracing::{debug, info, warn};

use crate::error::OfferError;
use crate::sync::lock;

use super::policy::{KeyProvider, OldestFirst, OwnerKeyProvider, Prioritiser};

/// Everything the queue mutates, behind one mutex.
///
/// Invariants:
/// - every key in `keys` has a non-empty backlog in `pending`, and every
///   backlog in `pending` has its key in `keys`;
/// - `size` is the total length of all backlogs;
/// - `size <= capacity`, unless `set_capacity` shrank the bound below what
///   was already queued.
struct QueueState<K> {
    keys: Vec<K>,
    pending: HashMap<K, VecDeque<Task>>,
    index: usize,
    size: usize,
    capacity: usize,
    closed: bool,
}

impl<K: Eq + Hash + Clone> QueueState<K> {
    fn push(&mut self, key: K, task: Task) {
        match self.pending.get_mut(&key) {
            Some(backlog) => backlog.push_back(task),
            None => {
                self.keys.push(key.clone());
                self.pending.insert(key, VecDeque::from([task]));
            }
        }
        self.size += 1;
    }

    /// Take one task from the key under the rotation index.
    ///
    /// An emptied key is removed and the index stays put, now naming the
    /// following key; otherwise the index moves on. Consecutive takes thus
    /// visit every active key once before any key twice.
    fn take(&mut self, prioritiser: &dyn Prioritiser) -> Option<Task> {
        if self.keys.is_empty() {
            return None;
        }
        if self.index >= self.keys.len() {
            self.index = 0;
        }
        let key = self.keys[self.index].clone();
        let backlog = self.pending.get_mut(&key)?;
        let task = match prioritiser.select_and_remove(backlog) {
            Some(task) => task,
            None => {
                warn!("prioritiser returned nothing from a non-empty backlog, taking the oldest");
                backlog.pop_front()?
            }
        };
        self.size -= 1;
        if backlog.is_empty() {
            self.pending.remove(&key);
            self.keys.remove(self.index);
        } else {
            self.index += 1;
        }
        Some(task)
    }
}

/// Bounded, blocking queue that groups tasks by key and serves keys in
/// round-robin order, so no single key can monopolise consumers.
pub struct KeyedQueue<K = OwnerKey> {
    state: Mutex<QueueState<K>>,
    not_empty: Condvar,
    not_full: Condvar,
    key_provider: Box<dyn KeyProvider<K>>,
    prioritiser: Box<dyn Prioritiser>,
}

impl KeyedQueue<OwnerKey> {
    /// Queue keyed by task owner, FIFO within each owner.
    pub fn new(capacity: usize) -> Self {
        Self::with_policies(capacity, OwnerKeyProvider, OldestFirst)
    }
}

impl<K> KeyedQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn with_policies<P, R>(capacity: usize, key_provider: P, prioritiser: R) -> Self
    where
        P: KeyProvider<K> + 'static,
        R: Prioritiser + 'static,
    {
        Self {
            state: Mutex::new(QueueState {
                keys: Vec::new(),
                pending: HashMap::new(),
                index: 0,
                size: 0,
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            key_provider: Box::new(key_provider),
            prioritiser: Box::new(prioritiser),
        }
    }

    /// Enqueue `task`, waiting up to `timeout` for space.
    ///
    /// A task that is already terminated is accepted without being queued.
    /// On timeout or close the task is handed back inside the error.
    pub fn offer(&self, task: Task, timeout: Duration) -> Result<(), OfferError> {
        if task.is_terminated() {
            debug!(task = %task.id(), "terminated task accepted without queueing");
            return Ok(());
        }
        let key = self.key_provider.key_of(&task);
        let deadline = Instant::now().checked_add(timeout);

        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(OfferError::Closed(task));
            }
            if state.size < state.capacity {
                break;
            }
            let Some(wait) = remaining(deadline, timeout) else {
                return Err(OfferError::Timeout(task));
            };
            state = wait_on(&self.not_full, state, wait);
        }
        state.push(key, task);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the next task in round-robin-by-key order, waiting up to
    /// `timeout` for one to arrive. `None` on timeout, or once the queue is
    /// closed and drained.
    pub fn poll(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now().checked_add(timeout);

        let mut state = lock(&self.state);
        loop {
            if let Some(task) = state.take(self.prioritiser.as_ref()) {
                drop(state);
                self.not_full.notify_one();
                return Some(task);
            }
            if state.closed {
                return None;
            }
            let wait = remaining(deadline, timeout)?;
            state = wait_on(&self.not_empty, state, wait);
        }
    }

    /// Non-blocking [`poll`](Self::poll).
    pub fn try_poll(&self) -> Option<Task> {
        let task = lock(&self.state).take(self.prioritiser.as_ref())?;
        self.not_full.notify_one();
        Some(task)
    }

    /// Change the bound. Queued tasks are never evicted.
    pub fn set_capacity(&self, capacity: usize) {
        lock(&self.state).capacity = capacity;
        self.not_full.notify_all();
    }

    /// Refuse further offers and wake every waiter. Tasks already queued
    /// can still be polled.
    pub fn close(&self) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
        }
        info!("keyed queue closed");
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    /// Keys with queued tasks, in rotation order.
    pub fn active_keys(&self) -> Vec<K> {
        lock(&self.state).keys.clone()
    }
}

/// Time left until `deadline`, or `None` once it has passed. A deadline
/// too far out to represent waits in `timeout` steps.
fn remaining(deadline: Option<Instant>, timeout: Duration) -> Option<Duration> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            (now < deadline).then(|| deadline - now)
        }
        None => Some(timeout),
    }
}

fn wait_on<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>, wait: Duration) -> MutexGuard<'a, T> {
    cv.wait_timeout(guard, wait)
        .unwrap_or_else(PoisonError::into_inner)
        .0
}
