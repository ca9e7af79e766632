use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

use crate::execution::slots::{CancelDecision, TaskSlots};
use crate::execution::worker::{TASK_ID_ENV, WorkerRequest, WorkerResponse};
use crate::execution::{
    CompletionHandler, DEFAULT_SHUTDOWN_TIMEOUT, ExecutionResult, TaskExecutor,
    executor_unavailable, retire_runtime,
};
use crate::models::{TaskCall, TaskError, TaskErrorKind, TaskId, TaskOutcome};

const STDERR_TAIL_BYTES: usize = 4096;

/// Program launched once per task; it must speak the worker stdio protocol
/// (see [`crate::execution::serve_stdio`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(TaskError::new(
                TaskErrorKind::InvalidInput,
                "worker command program must not be empty",
            ));
        }
        if let Some(key) = self.env.keys().find(|key| key.is_empty() || key.contains('=')) {
            return Err(TaskError::new(
                TaskErrorKind::InvalidInput,
                format!("invalid worker environment variable name '{key}'"),
            ));
        }
        Ok(())
    }
}

/// Executor for CPU-bound work: every task runs in its own worker process,
/// with at most `max_workers` processes alive at once.
///
/// Only the function name and arguments cross the process boundary, so the
/// worker program must register the same functions under the same names.
/// Running tasks can be cancelled on unix by killing the worker's process
/// group.
pub struct ProcessPoolExecutor {
    runtime: Mutex<Option<Runtime>>,
    command: Arc<WorkerCommand>,
    permits: Arc<Semaphore>,
    slots: Arc<TaskSlots>,
    max_workers: usize,
    shutdown_timeout: Duration,
}

impl ProcessPoolExecutor {
    pub fn new(command: WorkerCommand, max_workers: usize) -> ExecutionResult<Self> {
        if max_workers == 0 {
            return Err(TaskError::new(
                TaskErrorKind::InvalidInput,
                "process pool requires at least one worker",
            ));
        }
        command.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_workers)
            .thread_name("tasktrack-process-pool")
            .enable_all()
            .build()
            .map_err(|error| {
                executor_unavailable(format!("failed to start process pool runtime: {error}"))
            })?;

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            command: Arc::new(command),
            permits: Arc::new(Semaphore::new(max_workers)),
            slots: Arc::new(TaskSlots::default()),
            max_workers,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn in_flight(&self) -> usize {
        self.slots.in_flight()
    }
}

impl TaskExecutor for ProcessPoolExecutor {
    fn submit(
        &self,
        task_id: TaskId,
        call: TaskCall,
        handler: Arc<dyn CompletionHandler>,
    ) -> ExecutionResult<()> {
        let runtime = self.runtime.lock().map_err(|_| {
            TaskError::new(TaskErrorKind::Internal, "process pool runtime mutex poisoned")
        })?;
        let runtime = runtime
            .as_ref()
            .ok_or_else(|| executor_unavailable("process pool executor is shut down"))?;

        self.slots.register(&task_id)?;
        tracing::debug!(
            task_id = %task_id,
            func_name = %call.func_name,
            "queued task on process pool"
        );

        let request = WorkerRequest::new(call.func_name, &call.arguments);
        runtime.spawn(run_in_worker(
            self.command.clone(),
            self.permits.clone(),
            self.slots.clone(),
            task_id,
            request,
            handler,
        ));
        Ok(())
    }

    fn cancel(&self, task_id: &TaskId) -> ExecutionResult<bool> {
        match self.slots.cancel(task_id, cfg!(unix)) {
            CancelDecision::Dequeued => Ok(true),
            CancelDecision::Stopped { pid } => {
                if let Some(pid) = pid {
                    terminate_worker(task_id, pid);
                }
                Ok(true)
            }
            CancelDecision::Untracked | CancelDecision::Refused => Ok(false),
        }
    }

    fn shutdown(&self, wait: bool) -> ExecutionResult<()> {
        let runtime = self
            .runtime
            .lock()
            .map_err(|_| {
                TaskError::new(TaskErrorKind::Internal, "process pool runtime mutex poisoned")
            })?
            .take();
        let Some(runtime) = runtime else {
            return Ok(());
        };

        retire_runtime(
            runtime,
            self.slots.clone(),
            wait,
            self.shutdown_timeout,
            "process_pool",
        );
        Ok(())
    }
}

impl Drop for ProcessPoolExecutor {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.runtime.lock()
            && let Some(runtime) = guard.take()
        {
            runtime.shutdown_background();
        }
    }
}

async fn run_in_worker(
    command: Arc<WorkerCommand>,
    permits: Arc<Semaphore>,
    slots: Arc<TaskSlots>,
    task_id: TaskId,
    request: WorkerRequest,
    handler: Arc<dyn CompletionHandler>,
) {
    let Ok(_permit) = permits.acquire_owned().await else {
        slots.release(&task_id);
        return;
    };
    if !slots.try_start(&task_id) {
        tracing::debug!(task_id = %task_id, "skipping cancelled task");
        return;
    }

    // Handlers may block on store I/O.
    let started = {
        let handler = handler.clone();
        let task_id = task_id.clone();
        tokio::task::spawn_blocking(move || handler.on_start(&task_id))
    };
    if let Err(error) = started.await {
        tracing::error!(task_id = %task_id, error = %error, "task start notification failed");
    }

    let outcome = run_worker(&command, &slots, &task_id, &request).await;

    let finished = tokio::task::spawn_blocking(move || {
        if slots.begin_completion(&task_id) {
            handler.on_complete(&task_id, outcome);
        } else {
            tracing::debug!(task_id = %task_id, "discarding outcome of cancelled task");
        }
        slots.release(&task_id);
    });
    if let Err(error) = finished.await {
        tracing::error!(error = %error, "task completion notification failed");
    }
}

async fn run_worker(
    command: &WorkerCommand,
    slots: &TaskSlots,
    task_id: &TaskId,
    request: &WorkerRequest,
) -> TaskOutcome {
    let payload = match serde_json::to_vec(request) {
        Ok(payload) => payload,
        Err(error) => {
            return TaskOutcome::Failed(format!("failed to encode worker request: {error}"));
        }
    };

    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }
    cmd.env(TASK_ID_ENV, task_id.as_str());
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => {
            return TaskOutcome::Failed(format!(
                "failed to spawn worker process '{}': {error}",
                command.program.display()
            ));
        }
    };

    let pid = child.id();
    if !slots.set_pid(task_id, pid) {
        // Cancelled between dequeue and spawn.
        if let Err(error) = child.start_kill() {
            tracing::warn!(task_id = %task_id, error = %error, "failed to kill worker process");
        }
        if let Err(error) = child.wait().await {
            tracing::warn!(task_id = %task_id, error = %error, "failed to reap worker process");
        }
        return TaskOutcome::Failed("task cancelled before its worker started".to_string());
    }
    tracing::debug!(task_id = %task_id, pid = ?pid, "spawned worker process");

    if let Some(mut stdin) = child.stdin.take()
        && let Err(error) = stdin.write_all(&payload).await
    {
        // A worker that exits early closes the pipe; its exit status tells the story.
        tracing::debug!(task_id = %task_id, error = %error, "failed to write worker request");
    }

    match child.wait_with_output().await {
        Ok(output) => decode_output(&output),
        Err(error) => TaskOutcome::Failed(format!("failed to wait for worker process: {error}")),
    }
}

fn decode_output(output: &Output) -> TaskOutcome {
    if !output.status.success() {
        let stderr = stderr_tail(&output.stderr);
        return TaskOutcome::Failed(if stderr.is_empty() {
            format!("worker process exited with {}", output.status)
        } else {
            format!("worker process exited with {}: {stderr}", output.status)
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(line) = stdout.lines().rev().map(str::trim).find(|line| !line.is_empty()) else {
        return TaskOutcome::Failed("worker process produced no response".to_string());
    };

    match serde_json::from_str::<WorkerResponse>(line) {
        Ok(response) => response.into(),
        Err(error) => TaskOutcome::Failed(format!("unparsable worker response: {error}")),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let mut start = text.len().saturating_sub(STDERR_TAIL_BYTES);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(unix)]
fn terminate_worker(task_id: &TaskId, pid: u32) {
    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, libc::SIGKILL) };
    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            tracing::error!(
                task_id = %task_id,
                pid,
                error = %os_error,
                "failed to kill worker process group"
            );
            return;
        }
    }
    tracing::info!(task_id = %task_id, pid, "killed worker process group");
}

#[cfg(not(unix))]
fn terminate_worker(task_id: &TaskId, pid: u32) {
    tracing::warn!(task_id = %task_id, pid, "running workers cannot be stopped on this platform");
}
