use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::execution::slots::{CancelDecision, TaskSlots};
use crate::execution::{
    CompletionHandler, DEFAULT_SHUTDOWN_TIMEOUT, ExecutionResult, TaskExecutor,
    executor_unavailable, panic_message, retire_runtime,
};
use crate::models::{TaskCall, TaskError, TaskErrorKind, TaskId, TaskOutcome};
use crate::task_context::with_task_id;

/// In-process executor for I/O-bound work.
///
/// Tasks run on the blocking pool of a private tokio runtime, capped at
/// `max_workers` threads; excess submissions queue in FIFO order. Only
/// queued tasks can be cancelled.
pub struct ThreadPoolExecutor {
    runtime: Mutex<Option<Runtime>>,
    slots: Arc<TaskSlots>,
    max_workers: usize,
    shutdown_timeout: Duration,
}

impl ThreadPoolExecutor {
    pub fn new(max_workers: usize) -> ExecutionResult<Self> {
        if max_workers == 0 {
            return Err(TaskError::new(
                TaskErrorKind::InvalidInput,
                "thread pool requires at least one worker",
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_workers)
            .thread_name("tasktrack-worker")
            .enable_time()
            .build()
            .map_err(|error| {
                executor_unavailable(format!("failed to start thread pool runtime: {error}"))
            })?;

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            slots: Arc::new(TaskSlots::default()),
            max_workers,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn in_flight(&self) -> usize {
        self.slots.in_flight()
    }
}

impl TaskExecutor for ThreadPoolExecutor {
    fn submit(
        &self,
        task_id: TaskId,
        call: TaskCall,
        handler: Arc<dyn CompletionHandler>,
    ) -> ExecutionResult<()> {
        let runtime = self.runtime.lock().map_err(|_| {
            TaskError::new(TaskErrorKind::Internal, "thread pool runtime mutex poisoned")
        })?;
        let runtime = runtime
            .as_ref()
            .ok_or_else(|| executor_unavailable("thread pool executor is shut down"))?;

        self.slots.register(&task_id)?;
        tracing::debug!(
            task_id = %task_id,
            func_name = %call.func_name,
            "queued task on thread pool"
        );

        let slots = self.slots.clone();
        runtime.spawn_blocking(move || run_call(&slots, &task_id, &call, handler.as_ref()));
        Ok(())
    }

    fn cancel(&self, task_id: &TaskId) -> ExecutionResult<bool> {
        Ok(self.slots.cancel(task_id, false) == CancelDecision::Dequeued)
    }

    fn shutdown(&self, wait: bool) -> ExecutionResult<()> {
        let runtime = self
            .runtime
            .lock()
            .map_err(|_| {
                TaskError::new(TaskErrorKind::Internal, "thread pool runtime mutex poisoned")
            })?
            .take();
        let Some(runtime) = runtime else {
            return Ok(());
        };

        retire_runtime(
            runtime,
            self.slots.clone(),
            wait,
            self.shutdown_timeout,
            "thread_pool",
        );
        Ok(())
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.runtime.lock()
            && let Some(runtime) = guard.take()
        {
            runtime.shutdown_background();
        }
    }
}

fn run_call(slots: &TaskSlots, task_id: &TaskId, call: &TaskCall, handler: &dyn CompletionHandler) {
    if !slots.try_start(task_id) {
        tracing::debug!(task_id = %task_id, "skipping cancelled task");
        return;
    }

    handler.on_start(task_id);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| with_task_id(task_id, || call.invoke())))
        .unwrap_or_else(|payload| TaskOutcome::Failed(panic_message(payload)));

    if slots.begin_completion(task_id) {
        handler.on_complete(task_id, outcome);
    }
    slots.release(task_id);
}
