use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "TASKTRACK_LOG";

const DEFAULT_FILTER: &str = "info";

/// Installs a fmt subscriber filtered by `TASKTRACK_LOG` (default `info`).
///
/// Returns `false` when a global subscriber was already set.
pub fn init_logging() -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
