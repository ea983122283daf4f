//! Fair, bounded-concurrency task scheduling.
//!
//! Two ingestion front-ends share one accounting engine:
//! - pull-style: a [`Producer`] attached to the [`Dispatcher`] is asked for
//!   work whenever a global slot frees up, round robin across producers;
//! - push-style: tasks offered to a [`KeyedQueue`] are grouped by owner key
//!   and drained round robin across keys through a [`KeyedIntake`].

pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod intake;
pub mod producer;
pub mod queue;
pub mod slots;
pub mod stats;
mod sync;

pub use backend::{Completion, ExecutionBackend, InlineBackend, RayonBackend};
pub use dispatcher::Dispatcher;
pub use error::{OfferError, SchedulerError};
pub use intake::KeyedIntake;
pub use producer::{Producer, ProducerConfig, ProducerKey, TaskSupplier};
pub use queue::{
    HighestPriorityFirst, KeyProvider, KeyedQueue, OldestFirst, OwnerKeyProvider, Prioritiser,
};
pub use slots::{SlotGauge, SlotPermit};
pub use stats::{DispatcherStats, ProducerStats};

pub use fairshare_core::{CancelHandle, OwnerKey, Priority, SchedulerConfig, Task, TaskError, TaskId};
