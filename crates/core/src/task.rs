use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

pub type TaskId = Uuid;

/// Executable body of a [`Task`].
pub type Payload = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

/// Fairness partition a task belongs to (e.g. the submitting user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OwnerKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task priority. Lower numeric value = more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Priority {
    /// Interactive, someone is waiting on the result.
    P0 = 0,
    /// Near-interactive.
    P1 = 1,
    /// Regular batch work.
    P2 = 2,
    /// Background, tolerates delay.
    P3 = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P2
    }
}

/// Shared termination flag.
///
/// Cloning the handle shares the flag, so a single handle can cancel every
/// task of a job. Cancellation is advisory: schedulers re-check it right
/// before handing a task to a worker and drop terminated tasks unrun.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The smallest cancellable unit of work handled by the scheduler.
pub struct Task {
    id: TaskId,
    owner: OwnerKey,
    priority: Priority,
    created_at: DateTime<Utc>,
    cancel: CancelHandle,
    payload: Payload,
}

impl Task {
    pub fn new<F>(owner: impl Into<OwnerKey>, body: F) -> Self
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            priority: Priority::default(),
            created_at: Utc::now(),
            cancel: CancelHandle::new(),
            payload: Box::new(body),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Share an existing termination flag instead of the task's own.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn owner(&self) -> &OwnerKey {
        &self.owner
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Replace the payload with a wrapper around it. Identity, owner,
    /// priority and termination flag are preserved.
    pub fn map_payload<F>(self, wrap: F) -> Self
    where
        F: FnOnce(Payload) -> Payload,
    {
        Self {
            payload: wrap(self.payload),
            ..self
        }
    }

    /// Consume the task and execute its payload on the current thread.
    pub fn run(self) -> Result<(), TaskError> {
        (self.payload)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("priority", &self.priority)
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}
