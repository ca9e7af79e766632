use std::sync::Arc;

use crate::computation::{ComputationBackend, ComputationError};
use crate::execution::{CompletionHandler, ExecutionResult, TaskExecutor};
use crate::models::{TaskCall, TaskError, TaskErrorKind, TaskId};

/// Hands calls to a computation backend, which tracks them itself; the
/// completion handler is never invoked.
pub struct ComputationTaskExecutor {
    backend: Arc<dyn ComputationBackend>,
}

impl ComputationTaskExecutor {
    pub fn new(backend: Arc<dyn ComputationBackend>) -> Self {
        Self { backend }
    }
}

impl TaskExecutor for ComputationTaskExecutor {
    fn submit(
        &self,
        task_id: TaskId,
        call: TaskCall,
        _handler: Arc<dyn CompletionHandler>,
    ) -> ExecutionResult<()> {
        self.backend
            .launch(call, task_id.as_str())
            .map_err(|error| {
                let kind = match error {
                    ComputationError::InvalidKey(_) => TaskErrorKind::InvalidInput,
                    _ => TaskErrorKind::ExecutorUnavailable,
                };
                TaskError::for_task(
                    kind,
                    &task_id,
                    format!("computation backend rejected task '{task_id}': {error}"),
                )
            })
    }

    fn shutdown(&self, wait: bool) -> ExecutionResult<()> {
        self.backend.shutdown(wait).map_err(|error| {
            TaskError::new(
                TaskErrorKind::ExecutorUnavailable,
                format!("computation backend shutdown failed: {error}"),
            )
        })
    }
}
