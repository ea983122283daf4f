//! Scheduler error types.

use fairshare_core::{ConfigError, Task};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// A push-style submission that was not accepted. The task is handed back
/// so the caller can retry or drop it.
#[derive(Debug, Error)]
pub enum OfferError {
    #[error("queue full, timed out waiting for capacity")]
    Timeout(Task),

    #[error("queue closed")]
    Closed(Task),
}

impl OfferError {
    pub fn into_task(self) -> Task {
        match self {
            OfferError::Timeout(task) | OfferError::Closed(task) => task,
        }
    }
}
