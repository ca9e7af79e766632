use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::models::TaskId;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TaskErrorKind {
    DuplicateTask,
    NotFound,
    ResultNotReady,
    Timeout,
    TaskFailed,
    Cancelled,
    InvalidTransition,
    InvalidInput,
    StoreUnavailable,
    ExecutorUnavailable,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskError {
    pub task_id: Option<TaskId>,
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_task(kind: TaskErrorKind, task_id: &TaskId, message: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.clone()),
            kind,
            message: message.into(),
        }
    }

    /// Attributes the error to `task_id` unless it already names a task.
    pub fn attributed_to(self, task_id: &TaskId) -> Self {
        Self {
            task_id: self.task_id.or_else(|| Some(task_id.clone())),
            ..self
        }
    }
}

impl Display for TaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for TaskError {}
