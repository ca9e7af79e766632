use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::execution::{ExecutionResult, executor_unavailable};
use crate::models::{TaskError, TaskErrorKind, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CancelDecision {
    Untracked,
    Dequeued,
    Stopped { pid: Option<u32> },
    Refused,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotState {
    Queued,
    Running { pid: Option<u32> },
    Completing,
}

#[derive(Default)]
struct SlotTable {
    closed: bool,
    slots: HashMap<TaskId, SlotState>,
}

/// In-flight bookkeeping shared between an executor and its workers.
///
/// A slot lives from `register` until `release`; a cancelled slot vanishes
/// early, which is how a worker learns that it must not report an outcome.
#[derive(Default)]
pub(crate) struct TaskSlots {
    table: Mutex<SlotTable>,
    idle: Condvar,
}

impl TaskSlots {
    pub(crate) fn register(&self, task_id: &TaskId) -> ExecutionResult<()> {
        let mut table = self.lock();
        if table.closed {
            return Err(executor_unavailable(format!(
                "executor is shut down; task '{task_id}' was not accepted"
            )));
        }
        if table.slots.contains_key(task_id) {
            return Err(TaskError::for_task(
                TaskErrorKind::InvalidInput,
                task_id,
                format!("task '{task_id}' is already in flight"),
            ));
        }
        table.slots.insert(task_id.clone(), SlotState::Queued);
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
    }

    pub(crate) fn try_start(&self, task_id: &TaskId) -> bool {
        let mut table = self.lock();
        match table.slots.get_mut(task_id) {
            Some(state) if *state == SlotState::Queued => {
                *state = SlotState::Running { pid: None };
                true
            }
            _ => false,
        }
    }

    /// Records the worker pid; false when the task was cancelled meanwhile.
    pub(crate) fn set_pid(&self, task_id: &TaskId, pid: Option<u32>) -> bool {
        let mut table = self.lock();
        match table.slots.get_mut(task_id) {
            Some(state) if matches!(state, SlotState::Running { .. }) => {
                *state = SlotState::Running { pid };
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel(&self, task_id: &TaskId, stop_running: bool) -> CancelDecision {
        let mut table = self.lock();
        let decision = match table.slots.get(task_id) {
            None => return CancelDecision::Untracked,
            Some(SlotState::Queued) => CancelDecision::Dequeued,
            Some(SlotState::Running { pid }) if stop_running => {
                CancelDecision::Stopped { pid: *pid }
            }
            Some(_) => return CancelDecision::Refused,
        };
        table.slots.remove(task_id);
        self.notify_if_idle(&table);
        decision
    }

    /// Claims the right to report an outcome; false once cancelled.
    pub(crate) fn begin_completion(&self, task_id: &TaskId) -> bool {
        let mut table = self.lock();
        match table.slots.get_mut(task_id) {
            Some(state) => {
                *state = SlotState::Completing;
                true
            }
            None => false,
        }
    }

    pub(crate) fn release(&self, task_id: &TaskId) {
        let mut table = self.lock();
        table.slots.remove(task_id);
        self.notify_if_idle(&table);
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock().slots.len()
    }

    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut table = self.lock();
        while !table.slots.is_empty() {
            table = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.idle
                        .wait_timeout(table, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.idle.wait(table).unwrap_or_else(PoisonError::into_inner),
            };
        }
        true
    }

    fn notify_if_idle(&self, table: &SlotTable) {
        if table.slots.is_empty() {
            self.idle.notify_all();
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
