use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::models::{TaskError, TaskErrorKind};

/// Result payload of a completed task. Always a scalar, a sequence or a
/// string-keyed mapping, so transports can serialize it without help.
pub type TaskValue = Value;

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state-machine step requested against a stored record.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskTransition {
    Start,
    Complete(TaskValue),
    Fail(String),
    Cancel,
}

impl TaskTransition {
    pub fn target(&self) -> TaskStatus {
        match self {
            TaskTransition::Start => TaskStatus::Running,
            TaskTransition::Complete(_) => TaskStatus::Completed,
            TaskTransition::Fail(_) => TaskStatus::Failed,
            TaskTransition::Cancel => TaskStatus::Cancelled,
        }
    }
}

/// Terminal result of running a task function.
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskValue),
    Failed(String),
}

impl From<TaskOutcome> for TaskTransition {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed(value) => TaskTransition::Complete(value),
            TaskOutcome::Failed(message) => TaskTransition::Fail(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub func_name: String,
    pub status: TaskStatus,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub result: Option<TaskValue>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn pending(task_id: TaskId, func_name: impl Into<String>, created_at: SystemTime) -> Self {
        Self {
            task_id,
            func_name: func_name.into(),
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies `transition` in place. Illegal moves leave the record untouched.
    pub fn apply(&mut self, transition: TaskTransition, now: SystemTime) -> Result<(), TaskError> {
        let desired = transition.target();
        let allowed = match transition {
            TaskTransition::Start => self.status == TaskStatus::Pending,
            _ => !self.status.is_terminal(),
        };
        if !allowed {
            return Err(TaskError::for_task(
                TaskErrorKind::InvalidTransition,
                &self.task_id,
                format!(
                    "task '{}' cannot transition from '{}' to '{desired}'",
                    self.task_id, self.status
                ),
            ));
        }

        match transition {
            TaskTransition::Start => {
                self.started_at = Some(now);
            }
            TaskTransition::Complete(value) => {
                self.result = Some(value);
                self.error = None;
                self.completed_at = Some(now);
            }
            TaskTransition::Fail(message) => {
                self.result = None;
                self.error = Some(message);
                self.completed_at = Some(now);
            }
            TaskTransition::Cancel => {
                self.result = None;
                self.error = None;
                self.completed_at = Some(now);
            }
        }
        self.status = desired;
        Ok(())
    }

    /// Transport-neutral rendering; timestamps are fractional unix seconds.
    pub fn to_json(&self) -> Value {
        json!({
            "task_id": self.task_id.as_str(),
            "func_name": self.func_name,
            "status": self.status.as_str(),
            "created_at": unix_seconds(self.created_at),
            "started_at": self.started_at.map(unix_seconds),
            "completed_at": self.completed_at.map(unix_seconds),
            "result": self.result,
            "error": self.error,
        })
    }
}

fn unix_seconds(value: SystemTime) -> f64 {
    value
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use serde_json::json;

    use super::{TaskId, TaskRecord, TaskStatus, TaskTransition};
    use crate::models::TaskErrorKind;

    fn record() -> TaskRecord {
        TaskRecord::pending(
            TaskId::from("t-1"),
            "add",
            UNIX_EPOCH + Duration::from_secs(10),
        )
    }

    #[test]
    fn happy_path_sets_timestamps_once() {
        let mut task = record();
        let started = UNIX_EPOCH + Duration::from_secs(11);
        let finished = UNIX_EPOCH + Duration::from_secs(12);

        task.apply(TaskTransition::Start, started).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.started_at, Some(started));

        task.apply(TaskTransition::Complete(json!(8)), finished)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!(8)));
        assert_eq!(task.error, None);
        assert_eq!(task.completed_at, Some(finished));
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let mut task = record();
        task.apply(TaskTransition::Fail("boom".to_string()), UNIX_EPOCH)
            .unwrap();

        for transition in [
            TaskTransition::Start,
            TaskTransition::Complete(json!(1)),
            TaskTransition::Fail("again".to_string()),
            TaskTransition::Cancel,
        ] {
            let error = task.apply(transition, UNIX_EPOCH).unwrap_err();
            assert_eq!(error.kind, TaskErrorKind::InvalidTransition);
        }
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert_eq!(task.result, None);
    }

    #[test]
    fn start_is_only_legal_from_pending() {
        let mut task = record();
        task.apply(TaskTransition::Start, UNIX_EPOCH).unwrap();
        let error = task.apply(TaskTransition::Start, UNIX_EPOCH).unwrap_err();
        assert_eq!(error.kind, TaskErrorKind::InvalidTransition);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("finished"), None);
    }

    #[test]
    fn json_rendering_uses_lowercase_status_and_null_fields() {
        let rendered = record().to_json();
        assert_eq!(rendered["status"], json!("pending"));
        assert_eq!(rendered["task_id"], json!("t-1"));
        assert_eq!(rendered["created_at"], json!(10.0));
        assert!(rendered["result"].is_null());
        assert!(rendered["completed_at"].is_null());
    }
}
