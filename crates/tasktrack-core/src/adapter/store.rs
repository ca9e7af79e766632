use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::adapter::status_map::StatusTranslation;
use crate::computation::{ComputationError, ComputationStore};
use crate::models::{TaskError, TaskErrorKind, TaskId, TaskRecord, TaskStatus, TaskTransition};
use crate::persistence::{PersistenceResult, TaskStore};

/// Read-through view of a computation store.
///
/// The backend owns every entry: writes are no-ops, records are rebuilt on
/// each read, and results are probed without waiting. A completed entry
/// whose result is not fetchable yet is reported as `Completed` with no
/// result.
pub struct ComputationTaskStore {
    store: Arc<dyn ComputationStore>,
    translation: StatusTranslation,
}

impl ComputationTaskStore {
    pub fn new(store: Arc<dyn ComputationStore>) -> Self {
        Self {
            store,
            translation: StatusTranslation::default(),
        }
    }

    pub fn with_translation(mut self, translation: StatusTranslation) -> Self {
        self.translation = translation;
        self
    }

    pub fn translation(&self) -> &StatusTranslation {
        &self.translation
    }

    fn snapshot(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>> {
        let key = task_id.as_str();
        if !self.store.contains(key).map_err(|error| unavailable(task_id, error))? {
            return Ok(None);
        }
        // Expiry may remove the entry between the two reads.
        let Some(entry) = self.store.read(key).map_err(|error| unavailable(task_id, error))? else {
            return Ok(None);
        };

        let status = self.translation.translate_computation(&entry.status);
        let mut record =
            TaskRecord::pending(task_id.clone(), entry.func_name.clone(), entry.created_at());
        record.status = status;
        if status == TaskStatus::Running {
            record.started_at = Some(entry.updated_at());
        }
        if status.is_terminal() {
            record.completed_at = Some(entry.updated_at());
        }

        match status {
            TaskStatus::Completed => match self.store.fetch_result(key, Duration::ZERO) {
                Ok(value) => record.result = Some(value),
                Err(ComputationError::NotReady) => {
                    tracing::debug!(
                        task_id = %task_id,
                        "result not yet fetchable for completed task"
                    );
                }
                Err(ComputationError::NotFound(_)) => return Ok(None),
                Err(error) => return Err(unavailable(task_id, error)),
            },
            TaskStatus::Failed => match self.store.fetch_result(key, Duration::ZERO) {
                Err(ComputationError::Failed(message)) => record.error = Some(message),
                Err(ComputationError::NotFound(_)) => return Ok(None),
                Err(
                    error @ (ComputationError::Unavailable(_) | ComputationError::InvalidKey(_)),
                ) => return Err(unavailable(task_id, error)),
                Ok(_) | Err(ComputationError::NotReady) => {
                    tracing::debug!(task_id = %task_id, "failure message not yet fetchable");
                }
            },
            _ => {}
        }
        Ok(Some(record))
    }
}

impl TaskStore for ComputationTaskStore {
    /// The backend registers the key itself on launch; nothing is written.
    fn create(&self, task_id: &TaskId, func_name: &str) -> PersistenceResult<TaskRecord> {
        Ok(TaskRecord::pending(task_id.clone(), func_name, SystemTime::now()))
    }

    fn get(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>> {
        self.snapshot(task_id)
    }

    fn update(&self, _record: &TaskRecord) -> PersistenceResult<()> {
        Ok(())
    }

    fn delete(&self, task_id: &TaskId) -> PersistenceResult<bool> {
        self.store
            .remove(task_id.as_str())
            .map_err(|error| unavailable(task_id, error))
    }

    /// Records in the backend's key order.
    fn list(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        let keys = self.store.keys().map_err(|error| {
            TaskError::new(
                TaskErrorKind::StoreUnavailable,
                format!("failed to list computation keys: {error}"),
            )
        })?;

        let mut records = Vec::new();
        for key in keys {
            if records.len() >= limit {
                break;
            }
            if let Some(record) = self.snapshot(&TaskId::from(key))? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn transition(
        &self,
        task_id: &TaskId,
        _transition: TaskTransition,
    ) -> PersistenceResult<TaskRecord> {
        self.snapshot(task_id)?.ok_or_else(|| {
            TaskError::for_task(
                TaskErrorKind::NotFound,
                task_id,
                format!("task '{task_id}' not found"),
            )
        })
    }

    fn prune_expired(&self, _max_age: Duration) -> PersistenceResult<usize> {
        Ok(0)
    }
}

fn unavailable(task_id: &TaskId, error: ComputationError) -> TaskError {
    TaskError::for_task(
        TaskErrorKind::StoreUnavailable,
        task_id,
        format!("computation store failed for task '{task_id}': {error}"),
    )
}
