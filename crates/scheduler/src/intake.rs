//! Push-style front-end: feeds a [`KeyedQueue`] into the [`Dispatcher`].
//!
//! The queue is attached as one more producer, so tasks pushed by owners
//! run under the same global cap and completion accounting as pulled
//! work, while the queue keeps owners fair among themselves.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use fairshare_core::{OwnerKey, SchedulerConfig, Task};
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::error::OfferError;
use crate::producer::{Producer, ProducerConfig, TaskSupplier};
use crate::queue::KeyedQueue;

struct QueueSupplier<K> {
    queue: Arc<KeyedQueue<K>>,
}

impl<K> TaskSupplier for QueueSupplier<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn get_next(&self) -> Option<Task> {
        self.queue.try_poll()
    }

    /// Open, or closed with tasks left. Once closed is observed no offer
    /// can land, so an empty read after it is final.
    fn has_pending_work(&self) -> bool {
        !self.queue.is_closed() || !self.queue.is_empty()
    }
}

pub struct KeyedIntake<K = OwnerKey> {
    queue: Arc<KeyedQueue<K>>,
    producer: Arc<Producer>,
    offer_timeout: Duration,
}

impl KeyedIntake<OwnerKey> {
    /// Owner-keyed intake sized from `config`.
    pub fn from_config(dispatcher: &Arc<Dispatcher>, config: &SchedulerConfig) -> Self {
        let queue = Arc::new(KeyedQueue::new(config.queue_capacity));
        let producer = ProducerConfig::new("keyed-intake", config.resolved_max_threads());
        Self::new(dispatcher, queue, producer).with_offer_timeout(config.offer_timeout())
    }
}

impl<K> KeyedIntake<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(dispatcher: &Arc<Dispatcher>, queue: Arc<KeyedQueue<K>>, config: ProducerConfig) -> Self {
        let supplier = QueueSupplier {
            queue: Arc::clone(&queue),
        };
        let producer = Producer::new(dispatcher, config, supplier);
        Self {
            queue,
            producer,
            offer_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout = timeout;
        self
    }

    /// Queue `task` using the default offer timeout and kick the dispatcher.
    pub fn submit(&self, task: Task) -> Result<(), OfferError> {
        self.submit_timeout(task, self.offer_timeout)
    }

    pub fn submit_timeout(&self, task: Task, timeout: Duration) -> Result<(), OfferError> {
        let id = task.id();
        self.queue.offer(task, timeout)?;
        debug!(task = %id, queued = self.queue.len(), "task queued");
        self.producer.wake();
        Ok(())
    }

    /// Stop accepting tasks. Queued tasks still run; the intake's producer
    /// detaches once they have all finished.
    pub fn close(&self) {
        self.queue.close();
        self.producer.wake();
    }

    /// Block until every queued task has finished after [`close`](Self::close).
    pub fn await_completion(&self, timeout: Duration) -> bool {
        self.producer.await_completion(timeout)
    }

    pub fn queue(&self) -> &Arc<KeyedQueue<K>> {
        &self.queue
    }

    pub fn producer(&self) -> &Arc<Producer> {
        &self.producer
    }
}
