//! Execution backends: the worker pools that actually run task payloads.

use std::panic::{self, AssertUnwindSafe};

use fairshare_core::{SchedulerConfig, Task, TaskError};
use tracing::debug;

use crate::error::SchedulerError;

/// Callback invoked exactly once when a submitted task has finished.
pub type Completion = Box<dyn FnOnce(Result<(), TaskError>) + Send + 'static>;

/// A pool that runs task payloads.
///
/// `execute` must not block the caller on the task itself. `on_complete`
/// receives `Ok` on success and `Err` on failure or panic, and is invoked
/// exactly once per submitted task.
pub trait ExecutionBackend: Send + Sync {
    fn execute(&self, task: Task, on_complete: Completion);
}

fn run_guarded(task: Task) -> Result<(), TaskError> {
    match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        Ok(result) => result,
        Err(payload) => Err(TaskError::from_panic(payload)),
    }
}

/// Backend on a dedicated, named `rayon` thread pool.
pub struct RayonBackend {
    pool: rayon::ThreadPool,
}

impl RayonBackend {
    pub fn new(name: &str, num_threads: usize) -> Result<Self, SchedulerError> {
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    /// Pool sized to the configured global cap, so a granted slot never
    /// waits for a thread.
    pub fn from_config(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::new(&config.pool_name, config.resolved_max_threads())
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl ExecutionBackend for RayonBackend {
    fn execute(&self, task: Task, on_complete: Completion) {
        self.pool.spawn(move || {
            let id = task.id();
            let result = run_guarded(task);
            debug!(task = %id, ok = result.is_ok(), "task finished");
            on_complete(result);
        });
    }
}

/// Runs each task to completion on the submitting thread.
///
/// Useful for deterministic tests and single-threaded embedding; the
/// dispatcher's run loop coalesces the re-entrant wakeups this produces.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineBackend;

impl ExecutionBackend for InlineBackend {
    fn execute(&self, task: Task, on_complete: Completion) {
        on_complete(run_guarded(task));
    }
}
