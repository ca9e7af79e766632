use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{TaskError, TaskErrorKind, TaskResult};

/// Environment variable holding a JSON-encoded [`TaskSettings`].
pub const SETTINGS_ENV: &str = "TASKTRACK_SETTINGS";

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

static GLOBAL_SETTINGS: OnceLock<TaskSettings> = OnceLock::new();

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreSettings {
    #[default]
    InMemory,
    Sqlite {
        path: PathBuf,
    },
    /// Backend-managed entries under `root`; pairs with
    /// [`ExecutorSettings::Computation`].
    Computation {
        root: PathBuf,
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorSettings {
    ThreadPool {
        #[serde(default = "default_max_workers")]
        max_workers: usize,
    },
    ProcessPool {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default = "default_max_workers")]
        max_workers: usize,
    },
    Computation {
        #[serde(default = "default_max_workers")]
        max_workers: usize,
    },
}

impl ExecutorSettings {
    pub fn max_workers(&self) -> usize {
        match self {
            ExecutorSettings::ThreadPool { max_workers }
            | ExecutorSettings::ProcessPool { max_workers, .. }
            | ExecutorSettings::Computation { max_workers } => *max_workers,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        ExecutorSettings::ThreadPool {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Whether [`crate::orchestration::TaskConfig::run`] waits for the result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    #[default]
    Async,
    Sync,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdStrategy {
    #[default]
    Uuid,
    Sequential {
        #[serde(default)]
        prefix: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub store: StoreSettings,
    pub executor: ExecutorSettings,
    pub default_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub wait_mode: WaitMode,
    pub id_strategy: IdStrategy,
    /// Age after which finished tasks are pruned; unset keeps them forever.
    pub retention_secs: Option<u64>,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            executor: ExecutorSettings::default(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            wait_mode: WaitMode::default(),
            id_strategy: IdStrategy::default(),
            retention_secs: None,
        }
    }
}

impl TaskSettings {
    pub fn from_json_str(raw: &str) -> TaskResult<Self> {
        let settings: TaskSettings = serde_json::from_str(raw).map_err(|error| {
            TaskError::new(
                TaskErrorKind::InvalidInput,
                format!("invalid task settings: {error}"),
            )
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads [`SETTINGS_ENV`]; `None` when the variable is unset.
    pub fn from_env() -> TaskResult<Option<Self>> {
        match std::env::var(SETTINGS_ENV) {
            Ok(raw) => Self::from_json_str(&raw).map(Some),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(error) => Err(TaskError::new(
                TaskErrorKind::InvalidInput,
                format!("{SETTINGS_ENV} is not valid unicode: {error}"),
            )),
        }
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.executor.max_workers() == 0 {
            return Err(invalid("executor max_workers must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("poll_interval_ms must be greater than zero"));
        }
        if let ExecutorSettings::ProcessPool { program, .. } = &self.executor
            && program.as_os_str().is_empty()
        {
            return Err(invalid("process pool program must not be empty"));
        }
        let computation_store = matches!(self.store, StoreSettings::Computation { .. });
        let computation_executor = matches!(self.executor, ExecutorSettings::Computation { .. });
        if computation_store != computation_executor {
            return Err(invalid(
                "computation store and computation executor must be configured together",
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}

/// Installs the process-wide defaults used when no settings are passed
/// explicitly. Only the first installation takes effect.
pub fn install_global_settings(settings: TaskSettings) -> TaskResult<()> {
    settings.validate()?;
    GLOBAL_SETTINGS.set(settings).map_err(|_| {
        TaskError::new(
            TaskErrorKind::InvalidInput,
            "global task settings are already installed",
        )
    })
}

pub fn global_settings() -> Option<&'static TaskSettings> {
    GLOBAL_SETTINGS.get()
}

/// Explicit settings win, then the installed global, then the defaults.
pub fn resolve_settings(explicit: Option<TaskSettings>) -> TaskSettings {
    explicit
        .or_else(|| global_settings().cloned())
        .unwrap_or_default()
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn invalid(message: &str) -> TaskError {
    TaskError::new(TaskErrorKind::InvalidInput, message)
}
