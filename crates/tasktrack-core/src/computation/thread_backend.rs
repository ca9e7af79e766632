use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::computation::{
    ComputationBackend, ComputationEntry, ComputationError, ComputationResult, ComputationStatus,
    ComputationStore,
};
use crate::execution::slots::TaskSlots;
use crate::execution::{DEFAULT_SHUTDOWN_TIMEOUT, panic_message, retire_runtime};
use crate::models::{TaskCall, TaskId, TaskOutcome};
use crate::task_context::with_task_id;

/// Computation backend running calls on a private blocking pool and
/// recording queued, running and terminal entries in its store.
pub struct ThreadComputationBackend {
    runtime: Mutex<Option<Runtime>>,
    store: Arc<dyn ComputationStore>,
    slots: Arc<TaskSlots>,
    shutdown_timeout: Duration,
}

impl ThreadComputationBackend {
    pub fn new(store: Arc<dyn ComputationStore>, max_workers: usize) -> ComputationResult<Self> {
        if max_workers == 0 {
            return Err(ComputationError::Unavailable(
                "computation backend requires at least one worker".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_workers)
            .thread_name("tasktrack-computation")
            .build()
            .map_err(|error| {
                ComputationError::Unavailable(format!(
                    "failed to start computation runtime: {error}"
                ))
            })?;

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            store,
            slots: Arc::new(TaskSlots::default()),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn store(&self) -> Arc<dyn ComputationStore> {
        self.store.clone()
    }
}

impl ComputationBackend for ThreadComputationBackend {
    fn launch(&self, call: TaskCall, key: &str) -> ComputationResult<()> {
        let runtime = self.runtime.lock().map_err(|_| {
            ComputationError::Unavailable("computation runtime mutex poisoned".to_string())
        })?;
        let runtime = runtime.as_ref().ok_or_else(|| {
            ComputationError::Unavailable("computation backend is shut down".to_string())
        })?;

        let task_id = TaskId::from(key);
        self.slots
            .register(&task_id)
            .map_err(|error| ComputationError::Unavailable(error.message))?;

        let queued = ComputationEntry::new(call.func_name.clone(), ComputationStatus::Queued);
        if let Err(error) = self.store.write(key, &queued) {
            self.slots.release(&task_id);
            return Err(error);
        }
        tracing::debug!(key, func_name = %call.func_name, "launched computation");

        let store = self.store.clone();
        let slots = self.slots.clone();
        runtime.spawn_blocking(move || {
            if slots.try_start(&task_id) {
                compute(store.as_ref(), &task_id, &call, queued);
            }
            slots.release(&task_id);
        });
        Ok(())
    }

    fn shutdown(&self, wait: bool) -> ComputationResult<()> {
        let runtime = self
            .runtime
            .lock()
            .map_err(|_| {
                ComputationError::Unavailable("computation runtime mutex poisoned".to_string())
            })?
            .take();
        if let Some(runtime) = runtime {
            retire_runtime(
                runtime,
                self.slots.clone(),
                wait,
                self.shutdown_timeout,
                "computation",
            );
        }
        Ok(())
    }
}

impl Drop for ThreadComputationBackend {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.runtime.lock()
            && let Some(runtime) = guard.take()
        {
            runtime.shutdown_background();
        }
    }
}

fn compute(
    store: &dyn ComputationStore,
    task_id: &TaskId,
    call: &TaskCall,
    queued: ComputationEntry,
) {
    let key = task_id.as_str();
    let running = queued.with_status(ComputationStatus::Running);
    record(store, key, &running);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| with_task_id(task_id, || call.invoke())))
        .unwrap_or_else(|payload| TaskOutcome::Failed(panic_message(payload)));

    let finished = match outcome {
        TaskOutcome::Completed(value) => running.completed(value),
        TaskOutcome::Failed(message) => running.failed(message),
    };
    record(store, key, &finished);
}

/// Writes `entry` unless the key was removed while the call was in flight.
fn record(store: &dyn ComputationStore, key: &str, entry: &ComputationEntry) {
    match store.write_if_present(key, entry) {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(key, status = %entry.status, "dropping update for removed computation");
        }
        Err(error) => {
            tracing::error!(
                key,
                status = %entry.status,
                error = %error,
                "failed to record computation status"
            );
        }
    }
}
