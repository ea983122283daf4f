use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use fairshare_core::SchedulerConfig;
use tracing::{info, warn};

use crate::backend::{ExecutionBackend, RayonBackend};
use crate::error::SchedulerError;
use crate::producer::{Producer, ProducerKey};
use crate::slots::SlotGauge;
use crate::stats::{DispatchCounters, DispatcherStats};
use crate::sync::lock;

/// Attached producers plus the round-robin position. Guarded by one mutex.
#[derive(Default)]
pub(super) struct Rotation {
    pub(super) producers: BTreeMap<ProducerKey, Arc<Producer>>,
    /// Key of the producer chosen last; the next pick continues after it.
    pub(super) last: Option<ProducerKey>,
}

/// The scheduling core. Pulls tasks from attached producers in round-robin
/// order and hands them to the execution backend, never running more than
/// `max_threads` tasks at once.
///
/// Scheduling is event-driven: every completion re-enters
/// [`run_loop`](Dispatcher::run_loop), so no thread sits polling for work.
pub struct Dispatcher {
    pub(super) backend: Arc<dyn ExecutionBackend>,
    /// Tasks currently executing, bounded by the global cap.
    pub(super) executing: Arc<SlotGauge>,
    pub(super) rotation: Mutex<Rotation>,
    /// Sequence numbers for producer ordering.
    seq: AtomicU64,
    /// Pending run-loop requests; non-zero while some thread is draining.
    pub(super) wakeups: AtomicUsize,
    pub(super) counters: DispatchCounters,
    pub(super) self_ref: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(max_threads: usize, backend: Arc<dyn ExecutionBackend>) -> Arc<Self> {
        info!(max_threads, "Dispatcher created");
        Arc::new_cyclic(|self_ref| Self {
            backend,
            executing: Arc::new(SlotGauge::new(max_threads)),
            rotation: Mutex::new(Rotation::default()),
            seq: AtomicU64::new(0),
            wakeups: AtomicUsize::new(0),
            counters: DispatchCounters::default(),
            self_ref: self_ref.clone(),
        })
    }

    /// Build a dispatcher over a rayon pool sized from `config`.
    pub fn from_config(config: &SchedulerConfig) -> Result<Arc<Self>, SchedulerError> {
        config.validate()?;
        let backend = RayonBackend::from_config(config)?;
        Ok(Self::new(config.resolved_max_threads(), Arc::new(backend)))
    }

    /// Add a producer to the rotation. Producers attach themselves on
    /// construction; re-attaching a live producer is a no-op and a detached
    /// producer is refused.
    pub fn attach(&self, producer: Arc<Producer>) {
        if !producer.belongs_to(&self.self_ref) {
            warn!(producer = %producer.name(), "refusing a producer created for another dispatcher");
            return;
        }
        if !producer.is_attached() {
            warn!(producer = %producer.name(), "refusing to re-attach a detached producer");
            return;
        }
        let mut rotation = lock(&self.rotation);
        if rotation.producers.contains_key(&producer.key()) {
            return;
        }
        info!(producer = %producer.name(), max_threads = producer.max_threads(), "producer attached");
        rotation.producers.insert(producer.key(), producer);
    }

    /// Remove a producer from the rotation. Idempotent. Returns `false` if
    /// the producer was already detached or belongs to another dispatcher,
    /// which is left untouched.
    pub fn detach(&self, producer: &Producer) -> bool {
        if !producer.belongs_to(&self.self_ref) {
            warn!(producer = %producer.name(), "refusing to detach a producer of another dispatcher");
            return false;
        }
        producer.detach()
    }

    /// Drop the rotation entry. Called once per producer, from
    /// [`Producer::detach`].
    pub(crate) fn remove(&self, key: &ProducerKey) {
        let removed = lock(&self.rotation).producers.remove(key);
        if removed.is_some() {
            DispatchCounters::bump(&self.counters.detached);
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Change the global cap. Lowering it below the number of running tasks
    /// only stops new submissions until enough of them finish.
    pub fn set_max_threads(&self, max_threads: usize) {
        info!(max_threads, "Dispatcher cap changed");
        self.executing.set_limit(max_threads);
        self.run_loop();
    }

    pub fn max_threads(&self) -> usize {
        self.executing.limit()
    }

    pub fn executing(&self) -> usize {
        self.executing.used()
    }

    pub fn attached_count(&self) -> usize {
        lock(&self.rotation).producers.len()
    }

    /// Snapshot of the attached producers in rotation order.
    pub fn producers(&self) -> Vec<Arc<Producer>> {
        lock(&self.rotation).producers.values().cloned().collect()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            executing: self.executing(),
            max_threads: self.max_threads(),
            attached_producers: self.attached_count(),
            submitted: DispatchCounters::read(&self.counters.submitted),
            completed: DispatchCounters::read(&self.counters.completed),
            failed: DispatchCounters::read(&self.counters.failed),
            discarded: DispatchCounters::read(&self.counters.discarded),
            detached_producers: DispatchCounters::read(&self.counters.detached),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
