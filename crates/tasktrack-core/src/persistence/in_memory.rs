use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::models::{TaskError, TaskErrorKind, TaskId, TaskRecord, TaskTransition};
use crate::persistence::{PersistenceResult, TaskStore};

/// Process-local store. `list` returns the most recently created first.
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    next_sequence: u64,
    tasks: HashMap<TaskId, StoredTask>,
    order: BTreeMap<u64, TaskId>,
}

struct StoredTask {
    sequence: u64,
    record: TaskRecord,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> PersistenceResult<usize> {
        Ok(self.lock_state()?.tasks.len())
    }

    pub fn is_empty(&self) -> PersistenceResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state.lock().map_err(|_| {
            TaskError::new(TaskErrorKind::Internal, "in-memory task store mutex poisoned")
        })
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, task_id: &TaskId, func_name: &str) -> PersistenceResult<TaskRecord> {
        let mut state = self.lock_state()?;
        if state.tasks.contains_key(task_id) {
            return Err(TaskError::for_task(
                TaskErrorKind::DuplicateTask,
                task_id,
                format!("task id '{task_id}' already exists"),
            ));
        }

        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.saturating_add(1);

        let record = TaskRecord::pending(task_id.clone(), func_name, SystemTime::now());
        state.order.insert(sequence, task_id.clone());
        state.tasks.insert(
            task_id.clone(),
            StoredTask {
                sequence,
                record: record.clone(),
            },
        );
        Ok(record)
    }

    fn get(&self, task_id: &TaskId) -> PersistenceResult<Option<TaskRecord>> {
        let state = self.lock_state()?;
        Ok(state.tasks.get(task_id).map(|stored| stored.record.clone()))
    }

    fn update(&self, record: &TaskRecord) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        let stored = state.tasks.get_mut(&record.task_id).ok_or_else(|| {
            TaskError::for_task(
                TaskErrorKind::NotFound,
                &record.task_id,
                format!("unknown task id '{}'", record.task_id),
            )
        })?;
        stored.record = record.clone();
        Ok(())
    }

    fn delete(&self, task_id: &TaskId) -> PersistenceResult<bool> {
        let mut state = self.lock_state()?;
        match state.tasks.remove(task_id) {
            Some(stored) => {
                state.order.remove(&stored.sequence);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list(&self, limit: usize) -> PersistenceResult<Vec<TaskRecord>> {
        let state = self.lock_state()?;
        Ok(state
            .order
            .values()
            .rev()
            .filter_map(|task_id| state.tasks.get(task_id))
            .take(limit)
            .map(|stored| stored.record.clone())
            .collect())
    }

    fn transition(
        &self,
        task_id: &TaskId,
        transition: TaskTransition,
    ) -> PersistenceResult<TaskRecord> {
        let mut state = self.lock_state()?;
        let stored = state.tasks.get_mut(task_id).ok_or_else(|| {
            TaskError::for_task(
                TaskErrorKind::NotFound,
                task_id,
                format!("unknown task id '{task_id}'"),
            )
        })?;
        stored.record.apply(transition, SystemTime::now())?;
        Ok(stored.record.clone())
    }

    fn prune_expired(&self, max_age: Duration) -> PersistenceResult<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut state = self.lock_state()?;
        let expired: Vec<(TaskId, u64)> = state
            .tasks
            .iter()
            .filter(|(_, stored)| {
                stored.record.is_terminal()
                    && stored
                        .record
                        .completed_at
                        .is_some_and(|completed_at| completed_at < cutoff)
            })
            .map(|(task_id, stored)| (task_id.clone(), stored.sequence))
            .collect();

        for (task_id, sequence) in &expired {
            state.tasks.remove(task_id);
            state.order.remove(sequence);
        }
        Ok(expired.len())
    }
}
