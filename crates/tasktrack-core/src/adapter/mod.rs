//! Bridges a computation backend that tracks its own work onto the task
//! store and executor interfaces.

pub mod executor;
pub mod status_map;
pub mod store;

pub use executor::ComputationTaskExecutor;
pub use status_map::{COMPUTATION_STATUS_TABLE, StatusTranslation};
pub use store::ComputationTaskStore;

use std::sync::Arc;

use crate::computation::{ComputationBackend, ComputationStore};
use crate::execution::TaskExecutor;
use crate::persistence::TaskStore;

/// Store and executor views over one backend and the store it writes to.
pub fn computation_pair(
    store: Arc<dyn ComputationStore>,
    backend: Arc<dyn ComputationBackend>,
    translation: StatusTranslation,
) -> (Arc<dyn TaskStore>, Arc<dyn TaskExecutor>) {
    (
        Arc::new(ComputationTaskStore::new(store).with_translation(translation)),
        Arc::new(ComputationTaskExecutor::new(backend)),
    )
}
