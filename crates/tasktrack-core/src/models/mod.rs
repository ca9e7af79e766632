pub mod call;
pub mod error;
pub mod task;

pub use call::{FunctionRegistry, TaskArguments, TaskCall, TaskFunction, TaskFunctionError};
pub use error::{TaskError, TaskErrorKind, TaskResult};
pub use task::{TaskId, TaskOutcome, TaskRecord, TaskStatus, TaskTransition, TaskValue};
