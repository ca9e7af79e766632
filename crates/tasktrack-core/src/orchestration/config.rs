use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::adapter::{StatusTranslation, computation_pair};
use crate::computation::{
    ComputationError, ComputationStore, FileSystemComputationStore, ThreadComputationBackend,
};
use crate::execution::{
    CompletionHandler, ProcessPoolExecutor, StoreCompletionHandler, TaskExecutor,
    ThreadPoolExecutor, WorkerCommand,
};
use crate::models::{
    FunctionRegistry, TaskArguments, TaskCall, TaskError, TaskErrorKind, TaskId, TaskRecord,
    TaskStatus, TaskTransition, TaskValue,
};
use crate::orchestration::OrchestrationResult;
use crate::orchestration::ids::{TaskIdGenerator, validate_task_id};
use crate::orchestration::settings::{
    ExecutorSettings, IdStrategy, StoreSettings, TaskSettings, WaitMode, resolve_settings,
};
use crate::persistence::{InMemoryTaskStore, TaskStore};
use crate::sqlite::SqliteTaskStore;

/// Timing and waiting behaviour of a [`TaskConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskPolicy {
    pub default_timeout: Duration,
    pub poll_interval: Duration,
    pub wait_mode: WaitMode,
    pub retention: Option<Duration>,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        let settings = TaskSettings::default();
        Self::from(&settings)
    }
}

impl From<&TaskSettings> for TaskPolicy {
    fn from(settings: &TaskSettings) -> Self {
        Self {
            default_timeout: settings.default_timeout(),
            poll_interval: settings.poll_interval(),
            wait_mode: settings.wait_mode,
            retention: settings.retention(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Submitted(TaskId),
    Finished(TaskId, TaskValue),
}

impl RunOutcome {
    pub fn task_id(&self) -> &TaskId {
        match self {
            RunOutcome::Submitted(task_id) | RunOutcome::Finished(task_id, _) => task_id,
        }
    }
}

/// Pairs a store with an executor and exposes the caller-facing task API.
pub struct TaskConfig {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn TaskExecutor>,
    handler: Arc<dyn CompletionHandler>,
    policy: TaskPolicy,
    ids: TaskIdGenerator,
}

impl TaskConfig {
    pub fn new(store: Arc<dyn TaskStore>, executor: Arc<dyn TaskExecutor>) -> Self {
        let handler: Arc<dyn CompletionHandler> =
            Arc::new(StoreCompletionHandler::new(store.clone()));
        Self {
            store,
            executor,
            handler,
            policy: TaskPolicy::default(),
            ids: TaskIdGenerator::default(),
        }
    }

    /// Builds the store and executor named by `settings`.
    pub fn from_settings(settings: &TaskSettings) -> OrchestrationResult<Self> {
        settings.validate()?;

        let (store, executor) = match (&settings.store, &settings.executor) {
            (
                StoreSettings::Computation { root, ttl_secs },
                ExecutorSettings::Computation { max_workers },
            ) => {
                let mut medium = FileSystemComputationStore::new(root)
                    .map_err(|error| computation_error(TaskErrorKind::StoreUnavailable, error))?;
                if let Some(ttl_secs) = ttl_secs {
                    medium = medium.with_ttl(Duration::from_secs(*ttl_secs));
                }
                let medium: Arc<dyn ComputationStore> = Arc::new(medium);
                let backend = ThreadComputationBackend::new(medium.clone(), *max_workers)
                    .map_err(|error| computation_error(TaskErrorKind::ExecutorUnavailable, error))?;
                computation_pair(medium, Arc::new(backend), StatusTranslation::default())
            }
            (store, executor) => (build_store(store)?, build_executor(executor)?),
        };

        tracing::info!(
            store = ?settings.store,
            executor = ?settings.executor,
            "task config assembled"
        );
        Ok(Self::new(store, executor)
            .with_policy(TaskPolicy::from(settings))
            .with_id_strategy(&settings.id_strategy))
    }

    /// Explicit settings, else the installed global settings, else defaults.
    pub fn resolve(explicit: Option<TaskSettings>) -> OrchestrationResult<Self> {
        Self::from_settings(&resolve_settings(explicit))
    }

    pub fn with_policy(mut self, policy: TaskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_id_strategy(mut self, strategy: &IdStrategy) -> Self {
        self.ids = TaskIdGenerator::from_strategy(strategy);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    pub fn policy(&self) -> &TaskPolicy {
        &self.policy
    }

    /// Records the task as pending and hands it to the executor. When the
    /// executor refuses, the record is marked failed and the error returned.
    pub fn submit_and_track(
        &self,
        call: TaskCall,
        task_id: Option<TaskId>,
    ) -> OrchestrationResult<TaskId> {
        let task_id = match task_id {
            Some(task_id) => validate_task_id(task_id)?,
            None => self.ids.next_id(),
        };

        self.store.create(&task_id, &call.func_name)?;
        tracing::debug!(task_id = %task_id, func_name = %call.func_name, "submitting task");

        if let Err(error) = self
            .executor
            .submit(task_id.clone(), call, self.handler.clone())
        {
            let error = error.attributed_to(&task_id);
            if let Err(store_error) = self
                .store
                .transition(&task_id, TaskTransition::Fail(error.message.clone()))
            {
                tracing::error!(
                    task_id = %task_id,
                    kind = ?store_error.kind,
                    message = %store_error.message,
                    "failed to record rejected submission"
                );
            }
            return Err(error);
        }
        Ok(task_id)
    }

    /// Submits the function registered as `func_name`.
    pub fn submit_named(
        &self,
        registry: &FunctionRegistry,
        func_name: &str,
        arguments: TaskArguments,
        task_id: Option<TaskId>,
    ) -> OrchestrationResult<TaskId> {
        let call = registry.call(func_name, arguments)?;
        self.submit_and_track(call, task_id)
    }

    pub fn get_task(&self, task_id: &TaskId) -> OrchestrationResult<TaskRecord> {
        self.store.get(task_id)?.ok_or_else(|| not_found(task_id))
    }

    pub fn get_status(&self, task_id: &TaskId) -> OrchestrationResult<TaskStatus> {
        Ok(self.get_task(task_id)?.status)
    }

    /// Returns the result of a completed task.
    ///
    /// Without `wait`, an unfinished task is `ResultNotReady`. With `wait`,
    /// the store is re-polled every `poll_interval` until the task finishes
    /// or `timeout` (default: the policy's) runs out, which yields `Timeout`
    /// and leaves the task alone.
    pub fn get_result(
        &self,
        task_id: &TaskId,
        wait: bool,
        timeout: Option<Duration>,
    ) -> OrchestrationResult<TaskValue> {
        if !wait {
            return settle(self.get_task(task_id)?)?.ok_or_else(|| {
                TaskError::for_task(
                    TaskErrorKind::ResultNotReady,
                    task_id,
                    format!("task '{task_id}' has not finished"),
                )
            });
        }

        let timeout = timeout.unwrap_or(self.policy.default_timeout);
        // Past the representable range the wait is unbounded.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(value) = settle(self.get_task(task_id)?)? {
                return Ok(value);
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TaskError::for_task(
                            TaskErrorKind::Timeout,
                            task_id,
                            format!(
                                "timed out after {}ms waiting for task '{task_id}'",
                                timeout.as_millis()
                            ),
                        ));
                    }
                    self.policy.poll_interval.min(deadline - now)
                }
                None => self.policy.poll_interval,
            };
            std::thread::sleep(pause);
        }
    }

    pub fn list_tasks(&self, limit: usize) -> OrchestrationResult<Vec<TaskRecord>> {
        self.store.list(limit)
    }

    pub fn delete_task(&self, task_id: &TaskId) -> OrchestrationResult<bool> {
        let deleted = self.store.delete(task_id)?;
        tracing::debug!(task_id = %task_id, deleted, "delete requested");
        Ok(deleted)
    }

    /// Cancels a task the executor can still stop. `false` when the task is
    /// already finished or the executor declined.
    pub fn cancel_task(&self, task_id: &TaskId) -> OrchestrationResult<bool> {
        if self.get_task(task_id)?.is_terminal() {
            return Ok(false);
        }
        if !self.executor.cancel(task_id)? {
            return Ok(false);
        }

        match self.store.transition(task_id, TaskTransition::Cancel) {
            Ok(_) => {
                tracing::info!(task_id = %task_id, "task cancelled");
                Ok(true)
            }
            Err(error) if error.kind == TaskErrorKind::InvalidTransition => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Submits `call`, then either returns at once or waits for the result
    /// with the default timeout. `mode` overrides the policy's wait mode.
    pub fn run(&self, call: TaskCall, mode: Option<WaitMode>) -> OrchestrationResult<RunOutcome> {
        let task_id = self.submit_and_track(call, None)?;
        match mode.unwrap_or(self.policy.wait_mode) {
            WaitMode::Async => Ok(RunOutcome::Submitted(task_id)),
            WaitMode::Sync => {
                let value = self.get_result(&task_id, true, None)?;
                Ok(RunOutcome::Finished(task_id, value))
            }
        }
    }

    /// Applies the retention policy; a no-op without one.
    pub fn prune_expired(&self) -> OrchestrationResult<usize> {
        let Some(retention) = self.policy.retention else {
            return Ok(0);
        };
        let pruned = self.store.prune_expired(retention)?;
        if pruned > 0 {
            tracing::info!(pruned, "pruned expired tasks");
        }
        Ok(pruned)
    }

    pub fn shutdown(&self, wait: bool) -> OrchestrationResult<()> {
        self.executor.shutdown(wait)
    }
}

/// `Some(value)` once the task completed with a result, an error for failed
/// or cancelled tasks, `None` otherwise.
fn settle(record: TaskRecord) -> OrchestrationResult<Option<TaskValue>> {
    match record.status {
        TaskStatus::Completed => Ok(record.result),
        TaskStatus::Failed => Err(TaskError::for_task(
            TaskErrorKind::TaskFailed,
            &record.task_id,
            record.error.unwrap_or_else(|| "task failed".to_string()),
        )),
        TaskStatus::Cancelled => Err(TaskError::for_task(
            TaskErrorKind::Cancelled,
            &record.task_id,
            format!("task '{}' was cancelled", record.task_id),
        )),
        TaskStatus::Pending | TaskStatus::Running => Ok(None),
    }
}

fn not_found(task_id: &TaskId) -> TaskError {
    TaskError::for_task(
        TaskErrorKind::NotFound,
        task_id,
        format!("task '{task_id}' not found"),
    )
}

fn build_store(settings: &StoreSettings) -> OrchestrationResult<Arc<dyn TaskStore>> {
    match settings {
        StoreSettings::InMemory => Ok(Arc::new(InMemoryTaskStore::new())),
        StoreSettings::Sqlite { path } => Ok(Arc::new(SqliteTaskStore::open(path)?)),
        StoreSettings::Computation { .. } => Err(TaskError::new(
            TaskErrorKind::InvalidInput,
            "computation store requires the computation executor",
        )),
    }
}

fn build_executor(settings: &ExecutorSettings) -> OrchestrationResult<Arc<dyn TaskExecutor>> {
    match settings {
        ExecutorSettings::ThreadPool { max_workers } => {
            Ok(Arc::new(ThreadPoolExecutor::new(*max_workers)?))
        }
        ExecutorSettings::ProcessPool {
            program,
            args,
            env,
            max_workers,
        } => {
            let command = env.iter().fold(
                WorkerCommand::new(program).args(args.iter().cloned()),
                |command, (key, value)| command.env(key, value),
            );
            Ok(Arc::new(ProcessPoolExecutor::new(command, *max_workers)?))
        }
        ExecutorSettings::Computation { .. } => Err(TaskError::new(
            TaskErrorKind::InvalidInput,
            "computation executor requires the computation store",
        )),
    }
}

fn computation_error(kind: TaskErrorKind, error: ComputationError) -> TaskError {
    TaskError::new(kind, error.to_string())
}
