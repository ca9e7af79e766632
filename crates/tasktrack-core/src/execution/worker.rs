use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::panic_message;
use crate::models::{FunctionRegistry, TaskArguments, TaskId, TaskOutcome, TaskValue};
use crate::task_context::with_task_id;

/// Environment variable carrying the task id into worker processes.
pub const TASK_ID_ENV: &str = "TASKTRACK_TASK_ID";

/// Request written to a worker process' stdin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub func_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl WorkerRequest {
    pub fn new(func_name: impl Into<String>, arguments: &TaskArguments) -> Self {
        Self {
            func_name: func_name.into(),
            args: arguments.args.clone(),
            kwargs: arguments.kwargs.clone(),
        }
    }

    pub fn arguments(&self) -> TaskArguments {
        TaskArguments {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

/// Single-line response a worker prints as the last line of its stdout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkerResponse {
    #[serde(rename = "result")]
    Result(TaskValue),
    #[serde(rename = "error")]
    Error(String),
}

impl From<TaskOutcome> for WorkerResponse {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Completed(value) => WorkerResponse::Result(value),
            TaskOutcome::Failed(message) => WorkerResponse::Error(message),
        }
    }
}

impl From<WorkerResponse> for TaskOutcome {
    fn from(response: WorkerResponse) -> Self {
        match response {
            WorkerResponse::Result(value) => TaskOutcome::Completed(value),
            WorkerResponse::Error(message) => TaskOutcome::Failed(message),
        }
    }
}

/// Decodes one request and runs it against `registry`.
pub fn handle_request(registry: &FunctionRegistry, input: &[u8]) -> WorkerResponse {
    let request: WorkerRequest = match serde_json::from_slice(input) {
        Ok(request) => request,
        Err(error) => return WorkerResponse::Error(format!("malformed worker request: {error}")),
    };

    let call = match registry.call(&request.func_name, request.arguments()) {
        Ok(call) => call,
        Err(error) => return WorkerResponse::Error(error.message),
    };

    panic::catch_unwind(AssertUnwindSafe(|| call.invoke()))
        .unwrap_or_else(|payload| TaskOutcome::Failed(panic_message(payload)))
        .into()
}

/// Worker-process entry point: reads one request from stdin and prints the
/// response line to stdout.
pub fn serve_stdio(registry: &FunctionRegistry) -> io::Result<()> {
    let mut input = Vec::new();
    io::stdin().lock().read_to_end(&mut input)?;

    let response = match std::env::var(TASK_ID_ENV) {
        Ok(task_id) => with_task_id(&TaskId::from(task_id), || handle_request(registry, &input)),
        Err(_) => handle_request(registry, &input),
    };
    let line = serde_json::to_string(&response).map_err(io::Error::other)?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()
}
