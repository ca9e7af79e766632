pub mod process_pool;
pub(crate) mod slots;
pub mod thread_pool;
pub mod worker;

pub use process_pool::{ProcessPoolExecutor, WorkerCommand};
pub use thread_pool::ThreadPoolExecutor;
pub use worker::{WorkerRequest, WorkerResponse, serve_stdio};

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::execution::slots::TaskSlots;
use crate::models::{TaskCall, TaskError, TaskErrorKind, TaskId, TaskOutcome, TaskTransition};
use crate::persistence::TaskStore;

pub type ExecutionResult<T> = Result<T, TaskError>;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives lifecycle notifications from executors that do not record
/// state themselves.
pub trait CompletionHandler: Send + Sync {
    fn on_start(&self, task_id: &TaskId);

    /// Called exactly once per task that reached a terminal outcome.
    fn on_complete(&self, task_id: &TaskId, outcome: TaskOutcome);
}

pub trait TaskExecutor: Send + Sync {
    /// Schedules `call` under `task_id` and returns without waiting for it.
    fn submit(
        &self,
        task_id: TaskId,
        call: TaskCall,
        handler: Arc<dyn CompletionHandler>,
    ) -> ExecutionResult<()>;

    /// Optional capability. `Ok(true)` means the task will never report an
    /// outcome to its handler.
    fn cancel(&self, _task_id: &TaskId) -> ExecutionResult<bool> {
        Ok(false)
    }

    fn shutdown(&self, wait: bool) -> ExecutionResult<()>;
}

/// Forwards executor notifications to a store as state transitions.
pub struct StoreCompletionHandler {
    store: Arc<dyn TaskStore>,
}

impl StoreCompletionHandler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    fn apply(&self, task_id: &TaskId, transition: TaskTransition) {
        let desired = transition.target();
        match self.store.transition(task_id, transition) {
            Ok(record) => {
                tracing::debug!(task_id = %task_id, status = %record.status, "task transitioned");
            }
            Err(error)
                if matches!(
                    error.kind,
                    TaskErrorKind::NotFound | TaskErrorKind::InvalidTransition
                ) =>
            {
                // Deleted, expired or cancelled while the work was in flight.
                tracing::debug!(
                    task_id = %task_id,
                    desired = %desired,
                    kind = ?error.kind,
                    message = %error.message,
                    "dropping late task update"
                );
            }
            Err(error) => {
                tracing::error!(
                    task_id = %task_id,
                    desired = %desired,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to persist task transition"
                );
            }
        }
    }
}

impl CompletionHandler for StoreCompletionHandler {
    fn on_start(&self, task_id: &TaskId) {
        self.apply(task_id, TaskTransition::Start);
    }

    fn on_complete(&self, task_id: &TaskId, outcome: TaskOutcome) {
        self.apply(task_id, outcome.into());
    }
}

/// Stops accepting work and tears the runtime down once `slots` drains or
/// `timeout` elapses; without `wait` the draining happens on a detached
/// thread.
pub(crate) fn retire_runtime(
    runtime: Runtime,
    slots: Arc<TaskSlots>,
    wait: bool,
    timeout: Duration,
    executor: &'static str,
) {
    slots.close();
    let drain = move || {
        if !slots.wait_idle(timeout) {
            tracing::warn!(
                executor,
                in_flight = slots.in_flight(),
                timeout_ms = timeout.as_millis() as u64,
                "shutdown timed out with tasks still in flight"
            );
        }
        runtime.shutdown_background();
        tracing::info!(executor, "executor shut down");
    };

    if wait {
        drain();
        return;
    }

    if let Err(error) = std::thread::Builder::new()
        .name("tasktrack-shutdown".to_string())
        .spawn(drain)
    {
        tracing::error!(executor, error = %error, "failed to spawn background shutdown thread");
    }
}

pub(crate) fn executor_unavailable(message: impl Into<String>) -> TaskError {
    TaskError::new(TaskErrorKind::ExecutorUnavailable, message)
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}
