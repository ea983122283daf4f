//! Pull-style task sources with per-producer concurrency caps.
//!
//! A [`Producer`] wraps a [`TaskSupplier`] and attaches itself to a
//! [`Dispatcher`] on construction. The dispatcher asks it for work through
//! [`Producer::next`] whenever a global slot is free. Each issued task carries
//! a completion ticket that gives the producer slot back and bumps the
//! completed counter exactly once, whether the payload succeeds, fails,
//! panics, or is dropped unrun because it was cancelled.
//!
//! A producer detaches itself the first time its supplier has nothing to
//! give while no issued work is outstanding and the supplier expects no more.

use std::cmp::Ordering as CmpOrdering;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fairshare_core::{Payload, SchedulerConfig, Task, TaskError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::slots::{SlotGauge, SlotPermit};
use crate::stats::ProducerStats;
use crate::sync::lock;

/// Source of tasks for a [`Producer`].
pub trait TaskSupplier: Send + Sync {
    /// The next ready task, or `None` if nothing is ready right now.
    fn get_next(&self) -> Option<Task>;

    /// Whether tasks may still become ready later even though
    /// [`get_next`](Self::get_next) just returned `None`.
    fn has_pending_work(&self) -> bool {
        false
    }
}

impl<F> TaskSupplier for F
where
    F: Fn() -> Option<Task> + Send + Sync,
{
    fn get_next(&self) -> Option<Task> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Name used in logs and stats.
    pub name: String,
    /// Cap on tasks from this producer executing at once.
    pub max_threads: usize,
}

impl ProducerConfig {
    pub fn new(name: impl Into<String>, max_threads: usize) -> Self {
        Self {
            name: name.into(),
            max_threads,
        }
    }

    pub fn from_scheduler_config(name: impl Into<String>, config: &SchedulerConfig) -> Self {
        Self::new(name, config.max_threads_per_producer)
    }
}

/// Position of a producer in the dispatcher's rotation: creation time,
/// tie-broken by a sequence number handed out by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProducerKey {
    pub created_at: DateTime<Utc>,
    pub seq: u64,
}

impl Ord for ProducerKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.created_at
            .cmp(&other.created_at)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for ProducerKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

pub struct Producer {
    id: Uuid,
    name: String,
    key: ProducerKey,
    slots: Arc<SlotGauge>,
    issued: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicBool,
    detached: Mutex<bool>,
    detached_cv: Condvar,
    supplier: Box<dyn TaskSupplier>,
    dispatcher: Weak<Dispatcher>,
}

impl Producer {
    /// Create a producer and attach it to `dispatcher`.
    ///
    /// Nothing is scheduled until the dispatcher's run loop is kicked, e.g.
    /// through [`Producer::wake`].
    pub fn new<S>(dispatcher: &Arc<Dispatcher>, config: ProducerConfig, supplier: S) -> Arc<Self>
    where
        S: TaskSupplier + 'static,
    {
        let producer = Arc::new(Self {
            id: Uuid::new_v4(),
            name: config.name,
            key: ProducerKey {
                created_at: Utc::now(),
                seq: dispatcher.next_seq(),
            },
            slots: Arc::new(SlotGauge::new(config.max_threads)),
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            detached: Mutex::new(false),
            detached_cv: Condvar::new(),
            supplier: Box::new(supplier),
            dispatcher: Arc::downgrade(dispatcher),
        });
        dispatcher.attach(Arc::clone(&producer));
        producer
    }

    /// Try to obtain one task.
    ///
    /// Declines without consulting the supplier when this producer already
    /// has `max_threads` tasks in flight or has been cancelled.
    pub fn next(self: &Arc<Self>) -> Option<Task> {
        if self.cancelled.load(Ordering::Acquire) {
            return None;
        }
        let permit = self.slots.try_acquire_owned()?;

        let Some(task) = self.poll_supplier() else {
            drop(permit);
            if self.is_complete() {
                self.detach();
            }
            return None;
        };

        self.issued.fetch_add(1, Ordering::AcqRel);
        let ticket = CompletionTicket {
            producer: Arc::clone(self),
            _permit: permit,
        };
        let task_id = task.id();
        Some(task.map_payload(move |body| -> Payload {
            Box::new(move || {
                let ticket = ticket;
                match panic::catch_unwind(AssertUnwindSafe(body)) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(producer = %ticket.producer.name, task = %task_id, error = %e, "task failed");
                    }
                    Err(payload) => {
                        let e = TaskError::from_panic(payload);
                        error!(producer = %ticket.producer.name, task = %task_id, error = %e, "task panicked");
                    }
                }
                Ok(())
            })
        }))
    }

    /// Ask the supplier for a task. A panicking supplier yields nothing.
    fn poll_supplier(&self) -> Option<Task> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.supplier.get_next())) {
            Ok(task) => task,
            Err(payload) => {
                let e = TaskError::from_panic(payload);
                error!(producer = %self.name, error = %e, "task supplier panicked");
                None
            }
        }
    }

    /// True once every issued task has finished and the supplier expects no
    /// more work.
    pub fn is_complete(&self) -> bool {
        if self.remaining() != 0 {
            return false;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| self.supplier.has_pending_work())) {
            Ok(pending) => !pending,
            Err(payload) => {
                let e = TaskError::from_panic(payload);
                error!(producer = %self.name, error = %e, "task supplier panicked");
                true
            }
        }
    }

    /// Issued tasks that have not completed yet.
    pub fn remaining(&self) -> u64 {
        // Read completed first: it never overtakes issued.
        let completed = self.completed.load(Ordering::Acquire);
        self.issued.load(Ordering::Acquire).saturating_sub(completed)
    }

    /// Leave the dispatcher's rotation. Returns `false` if already detached.
    pub fn detach(&self) -> bool {
        {
            let mut detached = lock(&self.detached);
            if *detached {
                return false;
            }
            *detached = true;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(&self.key);
        }
        info!(
            producer = %self.name,
            issued = self.issued(),
            completed = self.completed(),
            "producer detached"
        );
        self.detached_cv.notify_all();
        true
    }

    /// Stop issuing tasks and leave the rotation. Tasks already issued keep
    /// running; cancel their handles to stop them too.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if self.detach() {
            debug!(producer = %self.name, "producer cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Block until this producer has detached or `timeout` elapses.
    /// Returns whether it detached.
    pub fn await_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut detached = lock(&self.detached);
        while !*detached {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    deadline - now
                }
                None => timeout,
            };
            detached = self
                .detached_cv
                .wait_timeout(detached, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Ask the dispatcher to look for work, e.g. after the supplier gained
    /// new ready tasks.
    pub fn wake(&self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.run_loop();
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> ProducerKey {
        self.key
    }

    pub fn threads_used(&self) -> usize {
        self.slots.used()
    }

    pub fn max_threads(&self) -> usize {
        self.slots.limit()
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Whether this producer was created for `dispatcher`.
    pub(crate) fn belongs_to(&self, dispatcher: &Weak<Dispatcher>) -> bool {
        Weak::ptr_eq(&self.dispatcher, dispatcher)
    }

    pub fn is_attached(&self) -> bool {
        !*lock(&self.detached)
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            name: self.name.clone(),
            threads_used: self.threads_used(),
            max_threads: self.max_threads(),
            issued: self.issued(),
            completed: self.completed(),
            attached: self.is_attached(),
        }
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("threads_used", &self.threads_used())
            .field("issued", &self.issued())
            .field("completed", &self.completed())
            .finish_non_exhaustive()
    }
}

/// Travels inside an issued task's payload. Dropping it, after the payload
/// ran or with the payload unrun, marks the task completed and frees the
/// producer slot.
struct CompletionTicket {
    producer: Arc<Producer>,
    _permit: SlotPermit,
}

impl Drop for CompletionTicket {
    fn drop(&mut self) {
        self.producer.completed.fetch_add(1, Ordering::AcqRel);
    }
}
