pub mod config;
pub mod ids;
pub mod settings;

pub use config::{RunOutcome, TaskConfig, TaskPolicy};
pub use ids::TaskIdGenerator;
pub use settings::{
    ExecutorSettings, IdStrategy, SETTINGS_ENV, StoreSettings, TaskSettings, WaitMode,
    global_settings, install_global_settings, resolve_settings,
};

use crate::models::TaskError;

pub type OrchestrationResult<T> = Result<T, TaskError>;
