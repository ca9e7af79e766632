//! Contract of an external distributed-computation library: a backend that
//! runs calls under caller-chosen keys and a store that keeps their status
//! and results. The `adapter` module maps this vocabulary onto tasks.

pub mod fs_store;
pub mod thread_backend;

pub use fs_store::FileSystemComputationStore;
pub use thread_backend::ThreadComputationBackend;

use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

use crate::models::{TaskCall, TaskValue};

const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ComputationStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    /// A value this crate does not know about yet.
    Other(String),
}

impl ComputationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ComputationStatus::Pending => "pending",
            ComputationStatus::Queued => "queued",
            ComputationStatus::Running => "running",
            ComputationStatus::Completed => "completed",
            ComputationStatus::Failed => "failed",
            ComputationStatus::Other(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => ComputationStatus::Pending,
            "queued" => ComputationStatus::Queued,
            "running" => ComputationStatus::Running,
            "completed" => ComputationStatus::Completed,
            "failed" => ComputationStatus::Failed,
            other => ComputationStatus::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComputationStatus::Completed | ComputationStatus::Failed
        )
    }
}

impl Display for ComputationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ComputationStatus {
    fn from(raw: String) -> Self {
        ComputationStatus::parse(&raw)
    }
}

impl From<ComputationStatus> for String {
    fn from(status: ComputationStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ComputationError {
    #[error("result is not ready yet")]
    NotReady,
    #[error("no computation stored under key '{0}'")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
    #[error("computation backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid computation key: {0}")]
    InvalidKey(String),
}

pub type ComputationResult<T> = Result<T, ComputationError>;

/// What a store keeps per key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputationEntry {
    pub func_name: String,
    pub status: ComputationStatus,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<TaskValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl ComputationEntry {
    pub fn new(func_name: impl Into<String>, status: ComputationStatus) -> Self {
        let now = now_millis();
        Self {
            func_name: func_name.into(),
            status,
            result: None,
            error: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn created_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.created_at_ms)
    }

    pub fn updated_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.updated_at_ms)
    }

    pub fn with_status(mut self, status: ComputationStatus) -> Self {
        self.status = status;
        self.updated_at_ms = now_millis();
        self
    }

    pub fn completed(self, value: TaskValue) -> Self {
        let mut entry = self.with_status(ComputationStatus::Completed);
        entry.result = Some(value);
        entry.error = None;
        entry
    }

    pub fn failed(self, message: impl Into<String>) -> Self {
        let mut entry = self.with_status(ComputationStatus::Failed);
        entry.result = None;
        entry.error = Some(message.into());
        entry
    }
}

/// Key/value medium shared by a backend and its readers.
pub trait ComputationStore: Send + Sync {
    fn contains(&self, key: &str) -> ComputationResult<bool> {
        Ok(self.read(key)?.is_some())
    }

    fn read(&self, key: &str) -> ComputationResult<Option<ComputationEntry>>;

    fn write(&self, key: &str, entry: &ComputationEntry) -> ComputationResult<()>;

    /// Replaces the entry only if `key` still exists, atomically with respect
    /// to `remove`. Returns whether the entry was written.
    fn write_if_present(&self, key: &str, entry: &ComputationEntry) -> ComputationResult<bool>;

    fn remove(&self, key: &str) -> ComputationResult<bool>;

    fn keys(&self) -> ComputationResult<Vec<String>>;

    fn status(&self, key: &str) -> ComputationResult<ComputationStatus> {
        self.read(key)?
            .map(|entry| entry.status)
            .ok_or_else(|| ComputationError::NotFound(key.to_string()))
    }

    /// Waits up to `timeout` for a terminal entry; a zero timeout probes once.
    ///
    /// A completed entry whose result has not landed yet counts as
    /// `NotReady`.
    fn fetch_result(&self, key: &str, timeout: Duration) -> ComputationResult<TaskValue> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let entry = self
                .read(key)?
                .ok_or_else(|| ComputationError::NotFound(key.to_string()))?;
            match entry.status {
                ComputationStatus::Completed => {
                    if let Some(value) = entry.result {
                        return Ok(value);
                    }
                }
                ComputationStatus::Failed => {
                    return Err(ComputationError::Failed(
                        entry
                            .error
                            .unwrap_or_else(|| "computation failed".to_string()),
                    ));
                }
                _ => {}
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ComputationError::NotReady);
                    }
                    FETCH_POLL_INTERVAL.min(deadline - now)
                }
                None => FETCH_POLL_INTERVAL,
            };
            std::thread::sleep(pause);
        }
    }
}

/// Runs calls and records their progress in a [`ComputationStore`].
pub trait ComputationBackend: Send + Sync {
    /// Starts `call` under `key`; the entry is visible in the store once
    /// this returns.
    fn launch(&self, call: TaskCall, key: &str) -> ComputationResult<()>;

    fn shutdown(&self, wait: bool) -> ComputationResult<()>;
}

/// A stored `"result": null` is a null value, not a missing result.
fn present_value<'de, D>(deserializer: D) -> Result<Option<TaskValue>, D::Error>
where
    D: Deserializer<'de>,
{
    TaskValue::deserialize(deserializer).map(Some)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use super::{
        ComputationEntry, ComputationError, ComputationResult, ComputationStatus, ComputationStore,
    };

    #[derive(Default)]
    struct MapStore {
        entries: Mutex<HashMap<String, ComputationEntry>>,
    }

    impl ComputationStore for MapStore {
        fn read(&self, key: &str) -> ComputationResult<Option<ComputationEntry>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        fn write(&self, key: &str, entry: &ComputationEntry) -> ComputationResult<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), entry.clone());
            Ok(())
        }

        fn write_if_present(&self, key: &str, entry: &ComputationEntry) -> ComputationResult<bool> {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(key) {
                Some(slot) => {
                    *slot = entry.clone();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        fn remove(&self, key: &str) -> ComputationResult<bool> {
            Ok(self.entries.lock().unwrap().remove(key).is_some())
        }

        fn keys(&self) -> ComputationResult<Vec<String>> {
            Ok(self.entries.lock().unwrap().keys().cloned().collect())
        }
    }

    #[test]
    fn unknown_status_strings_survive_round_trip() {
        let status: ComputationStatus = serde_json::from_value(json!("retrying")).unwrap();
        assert_eq!(status, ComputationStatus::Other("retrying".to_string()));
        assert!(!status.is_terminal());
        assert_eq!(serde_json::to_value(&status).unwrap(), json!("retrying"));
        assert_eq!(
            serde_json::to_value(ComputationStatus::Queued).unwrap(),
            json!("queued")
        );
    }

    #[test]
    fn zero_wait_fetch_reports_each_state() {
        let store = MapStore::default();
        let entry = ComputationEntry::new("add", ComputationStatus::Running);
        store.write("a", &entry).unwrap();

        assert_eq!(
            store.fetch_result("a", Duration::ZERO),
            Err(ComputationError::NotReady)
        );
        assert_eq!(
            store.fetch_result("missing", Duration::ZERO),
            Err(ComputationError::NotFound("missing".to_string()))
        );

        let completed_without_result = entry.clone().with_status(ComputationStatus::Completed);
        store.write("a", &completed_without_result).unwrap();
        assert_eq!(
            store.fetch_result("a", Duration::ZERO),
            Err(ComputationError::NotReady)
        );

        store.write("a", &entry.clone().completed(json!(8))).unwrap();
        assert_eq!(store.fetch_result("a", Duration::ZERO), Ok(json!(8)));

        store.write("b", &entry.failed("boom")).unwrap();
        assert_eq!(
            store.fetch_result("b", Duration::ZERO),
            Err(ComputationError::Failed("boom".to_string()))
        );
        assert_eq!(store.status("b"), Ok(ComputationStatus::Failed));
    }

    #[test]
    fn null_results_survive_serialization() {
        let entry =
            ComputationEntry::new("noop", ComputationStatus::Running).completed(json!(null));
        let encoded = serde_json::to_value(&entry).unwrap();
        assert_eq!(encoded["result"], json!(null));
        assert!(encoded.as_object().unwrap().contains_key("result"));

        let decoded: ComputationEntry = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.result, Some(json!(null)));

        let pending = ComputationEntry::new("noop", ComputationStatus::Queued);
        let encoded = serde_json::to_value(&pending).unwrap();
        assert!(!encoded.as_object().unwrap().contains_key("result"));
        let decoded: ComputationEntry = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.result, None);
    }

    #[test]
    fn unbounded_fetch_returns_finished_results() {
        let store = MapStore::default();
        let entry = ComputationEntry::new("noop", ComputationStatus::Running);
        store.write("a", &entry.clone().completed(json!(null))).unwrap();
        assert_eq!(store.fetch_result("a", Duration::MAX), Ok(json!(null)));

        store.write("b", &entry.failed("boom")).unwrap();
        assert_eq!(
            store.fetch_result("b", Duration::MAX),
            Err(ComputationError::Failed("boom".to_string()))
        );
    }

    #[test]
    fn conditional_writes_skip_removed_keys() {
        let store = MapStore::default();
        let entry = ComputationEntry::new("add", ComputationStatus::Queued);
        assert!(!store.write_if_present("a", &entry).unwrap());
        assert!(!store.contains("a").unwrap());

        store.write("a", &entry).unwrap();
        let running = entry.with_status(ComputationStatus::Running);
        assert!(store.write_if_present("a", &running).unwrap());
        assert_eq!(store.status("a"), Ok(ComputationStatus::Running));
    }
}
