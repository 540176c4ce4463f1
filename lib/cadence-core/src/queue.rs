//! Ready queue.
use std::collections::VecDeque;

use crate::task::TaskId;

/// FIFO queue of tasks that are eligible to run immediately.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    tasks: VecDeque<TaskId>,
}

impl ReadyQueue {
    /// Creates an empty ready queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task at the back of the queue.
    pub fn push_back(&mut self, task: TaskId) {
        self.tasks.push_back(task);
    }

    /// Dequeues the task at the front of the queue.
    pub fn pop_front(&mut self) -> Option<TaskId> {
        self.tasks.pop_front()
    }

    /// Removes every occurrence of the given task, returning `true` if any were found.
    pub fn remove(&mut self, task: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|queued| *queued != task);
        self.tasks.len() != before
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Removes all queued tasks.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}
