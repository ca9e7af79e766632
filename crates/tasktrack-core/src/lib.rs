pub mod adapter;
pub mod computation;
pub mod execution;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod sqlite;
pub mod task_context;
pub mod telemetry;

pub use task_context::current_task_id;
