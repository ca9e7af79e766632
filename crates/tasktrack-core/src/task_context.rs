use std::cell::RefCell;

use crate::models::TaskId;

thread_local! {
    static CURRENT_TASK_ID: RefCell<Option<TaskId>> = const { RefCell::new(None) };
}

/// Id of the task whose function is running on this thread, if any.
pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK_ID.with(|slot| slot.borrow().clone())
}

pub(crate) fn with_task_id<R>(task_id: &TaskId, operation: impl FnOnce() -> R) -> R {
    struct Restore(Option<TaskId>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT_TASK_ID.with(|slot| *slot.borrow_mut() = previous);
        }
    }

    let previous = CURRENT_TASK_ID.with(|slot| slot.replace(Some(task_id.clone())));
    let _restore = Restore(previous);
    operation()
}
