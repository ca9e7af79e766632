pub mod in_memory;

pub use in_memory::InMemoryTaskStore;

use std::time::Duration;

use crate::models::{TaskError, TaskId, TaskRecord, TaskTransition};

pub type PersistenceResult<T> = Result<T, TaskError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

/// Authoritative home of task records.
///
/// `get` signals an unknown id with `None`; only medium failures are
/// reported as `StoreUnavailable`. Stores backed by a self-managing external
/// system may treat `update` and `transition` as no-ops.
pub trait TaskStore: Send + Sync {
    /// Inserts a `Pending` record, failing with `DuplicateTask` when the
    /// store enforces uniqueness and the id is taken.
    fn create(&self, task_id: &TaskId, func_name: &str) -> PersistenceResult<TaskRecord>;

    fn get(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>>;

    /// Full-record replace of an existing record.
    fn update(&self, record: &TaskRecord) -> PersistenceResult<()>;

    fn delete(&self, task_id: &TaskId) -> PersistenceResult<bool>;

    /// Up to `limit` records in store-defined order.
    fn list(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>>;

    /// Applies one state-machine step atomically with respect to every other
    /// writer of the same task, returning the resulting snapshot.
    fn transition(
        &self,
        task_id: &TaskId,
        transition: TaskTransition,
    ) -> PersistenceResult<TaskRecord>;

    /// Drops terminal records that finished more than `max_age` ago.
    fn prune_expired(&self, max_age: Duration) -> PersistenceResult<usize>;
}
