use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{TaskError, TaskErrorKind, TaskId, TaskResult};
use crate::orchestration::settings::IdStrategy;

/// Source of ids for submissions that do not bring their own.
#[derive(Debug, Default)]
pub enum TaskIdGenerator {
    #[default]
    Uuid,
    /// `prefix` followed by a per-process counter starting at 1. Ids repeat
    /// across restarts, so durable stores will reject them as duplicates.
    Sequential { prefix: String, next: AtomicU64 },
}

impl TaskIdGenerator {
    pub fn from_strategy(strategy: &IdStrategy) -> Self {
        match strategy {
            IdStrategy::Uuid => TaskIdGenerator::Uuid,
            IdStrategy::Sequential { prefix } => TaskIdGenerator::Sequential {
                prefix: prefix.clone(),
                next: AtomicU64::new(1),
            },
        }
    }

    pub fn next_id(&self) -> TaskId {
        match self {
            TaskIdGenerator::Uuid => TaskId::new(uuid::Uuid::new_v4().to_string()),
            TaskIdGenerator::Sequential { prefix, next } => {
                let value = next.fetch_add(1, Ordering::Relaxed);
                TaskId::new(format!("{prefix}{value}"))
            }
        }
    }
}

pub(crate) fn validate_task_id(task_id: TaskId) -> TaskResult<TaskId> {
    if task_id.as_str().trim().is_empty() {
        return Err(TaskError::new(
            TaskErrorKind::InvalidInput,
            "task id must not be empty",
        ));
    }
    Ok(task_id)
}

#[cfg(test)]
mod tests {
    use super::{TaskIdGenerator, validate_task_id};
    use crate::models::{TaskErrorKind, TaskId};
    use crate::orchestration::settings::IdStrategy;

    #[test]
    fn uuid_ids_are_unique() {
        let ids = TaskIdGenerator::default();
        let first = ids.next_id();
        assert_eq!(first.as_str().len(), 36);
        assert_ne!(first, ids.next_id());
    }

    #[test]
    fn sequential_ids_count_up_from_one() {
        let ids = TaskIdGenerator::from_strategy(&IdStrategy::Sequential {
            prefix: "job-".to_string(),
        });
        assert_eq!(ids.next_id(), TaskId::from("job-1"));
        assert_eq!(ids.next_id(), TaskId::from("job-2"));
    }

    #[test]
    fn blank_caller_ids_are_rejected() {
        let error = validate_task_id(TaskId::from("  ")).unwrap_err();
        assert_eq!(error.kind, TaskErrorKind::InvalidInput);
        assert!(validate_task_id(TaskId::from("mine")).is_ok());
    }
}
