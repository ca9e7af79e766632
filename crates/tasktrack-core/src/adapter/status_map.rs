use std::collections::BTreeMap;

use crate::computation::ComputationStatus;
use crate::models::{TaskError, TaskErrorKind, TaskResult, TaskStatus};

/// Native computation status names and the task status each one means.
pub const COMPUTATION_STATUS_TABLE: &[(&str, TaskStatus)] = &[
    ("pending", TaskStatus::Pending),
    ("queued", TaskStatus::Pending),
    ("running", TaskStatus::Running),
    ("completed", TaskStatus::Completed),
    ("failed", TaskStatus::Failed),
];

/// Maps an external status vocabulary onto [`TaskStatus`].
///
/// Names missing from the table translate to `Pending`, so an unrecognised
/// value can never make a task look finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusTranslation {
    table: BTreeMap<String, TaskStatus>,
}

impl StatusTranslation {
    pub fn from_table<I, K>(entries: I) -> TaskResult<Self>
    where
        I: IntoIterator<Item = (K, TaskStatus)>,
        K: Into<String>,
    {
        let mut table = BTreeMap::new();
        for (native, status) in entries {
            let native = native.into();
            if native.is_empty() {
                return Err(TaskError::new(
                    TaskErrorKind::InvalidInput,
                    "status translation keys must not be empty",
                ));
            }
            if let Some(previous) = table.insert(native.clone(), status)
                && previous != status
            {
                return Err(TaskError::new(
                    TaskErrorKind::InvalidInput,
                    format!(
                        "native status '{native}' maps to both '{previous}' and '{status}'"
                    ),
                ));
            }
        }
        Ok(Self { table })
    }

    pub fn computation_default() -> Self {
        Self {
            table: COMPUTATION_STATUS_TABLE
                .iter()
                .map(|(native, status)| ((*native).to_string(), *status))
                .collect(),
        }
    }

    pub fn translate(&self, native: &str) -> TaskStatus {
        match self.table.get(native) {
            Some(status) => *status,
            None => {
                tracing::debug!(native, "unmapped backend status; reporting pending");
                TaskStatus::Pending
            }
        }
    }

    pub fn translate_computation(&self, status: &ComputationStatus) -> TaskStatus {
        self.translate(status.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, TaskStatus)> {
        self.table
            .iter()
            .map(|(native, status)| (native.as_str(), *status))
    }
}

impl Default for StatusTranslation {
    fn default() -> Self {
        Self::computation_default()
    }
}
