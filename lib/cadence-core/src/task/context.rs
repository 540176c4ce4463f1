//! Thread-local marker for the task currently being stepped.
use std::{cell::RefCell, rc::Rc};

use super::Task;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Rc<Task>>> = const { RefCell::new(None) };
}

/// Restores the previously current task when dropped.
///
/// Schedulers can be nested (a task may drive a scheduler of its own), so entering a task saves whatever was current
/// before rather than clearing it on exit.
pub(crate) struct CurrentTaskGuard {
    prev: Option<Rc<Task>>,
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|current| *current.borrow_mut() = prev);
    }
}

/// Marks `task` as the current task until the returned guard is dropped.
pub(crate) fn enter(task: Rc<Task>) -> CurrentTaskGuard {
    let prev = CURRENT_TASK.with(|current| current.borrow_mut().replace(task));
    CurrentTaskGuard { prev }
}

/// Returns the task currently being stepped on this thread, if any.
pub(crate) fn current_task() -> Option<Rc<Task>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}
