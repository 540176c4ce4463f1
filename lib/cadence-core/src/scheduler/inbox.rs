//! Cross-thread handoff into a scheduler.
//!
//! A scheduler and everything it owns is confined to one thread. The inbox is the single place where other threads can
//! reach it: completions of external work (through a [`Completer`]) and wake-ups of tasks parked on foreign futures
//! (through their [`Waker`]) are pushed onto a lock-free queue, and drained by the scheduler at the top of every loop
//! iteration.
use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    sync::{Arc, Condvar, Mutex, PoisonError},
    task::{Wake, Waker},
    time::Duration,
};

use crossbeam_queue::SegQueue;

use crate::{error::TaskError, task::TaskId};

/// Identifier of an outstanding external completion.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct CompletionId(pub(crate) u64);

pub(crate) enum InboxMessage {
    Wake(TaskId),
    Complete(CompletionId, Box<dyn Any + Send>),
}

struct InboxInner {
    messages: SegQueue<InboxMessage>,
    notified: Mutex<bool>,
    condvar: Condvar,
}

#[derive(Clone)]
pub(crate) struct Inbox {
    inner: Arc<InboxInner>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(InboxInner {
                messages: SegQueue::new(),
                notified: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    pub(crate) fn push(&self, message: InboxMessage) {
        self.inner.messages.push(message);

        let mut notified = self.inner.notified.lock().unwrap_or_else(PoisonError::into_inner);
        *notified = true;
        self.inner.condvar.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<InboxMessage> {
        self.inner.messages.pop()
    }

    /// Blocks until a message is pushed or `timeout` elapses, returning `true` if messages are waiting.
    pub(crate) fn park(&self, timeout: Duration) -> bool {
        let notified = self.inner.notified.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut notified, _) = self
            .inner
            .condvar
            .wait_timeout_while(notified, timeout, |notified| {
                !*notified && self.inner.messages.is_empty()
            })
            .unwrap_or_else(PoisonError::into_inner);
        *notified = false;
        !self.inner.messages.is_empty()
    }

    pub(crate) fn waker_for(&self, task: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            inbox: self.clone(),
            task,
        }))
    }
}

struct TaskWaker {
    inbox: Inbox,
    task: TaskId,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.inbox.push(InboxMessage::Wake(self.task));
    }
}

/// Thread-safe handle for settling a promise from outside its scheduler.
///
/// Created by [`Handle::completion`][crate::scheduler::Handle::completion]. Settling consumes the completer, so a
/// promise can only be completed once through it. Dropping a completer without settling rejects the promise with
/// [`TaskError::Cancelled`].
pub struct Completer<T>
where
    T: Send + 'static,
{
    id: CompletionId,
    inbox: Option<Inbox>,
    _value: PhantomData<fn(T)>,
}

impl<T> Completer<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(id: CompletionId, inbox: Inbox) -> Self {
        Self {
            id,
            inbox: Some(inbox),
            _value: PhantomData,
        }
    }

    /// Fulfills the promise with `value`.
    pub fn resolve(mut self, value: T) {
        self.complete(Ok(value));
    }

    /// Rejects the promise with `error`.
    pub fn reject(mut self, error: TaskError) {
        self.complete(Err(error));
    }

    fn complete(&mut self, result: Result<T, TaskError>) {
        if let Some(inbox) = self.inbox.take() {
            inbox.push(InboxMessage::Complete(self.id, Box::new(result)));
        }
    }
}

impl<T> Drop for Completer<T>
where
    T: Send + 'static,
{
    fn drop(&mut self) {
        self.complete(Err(TaskError::Cancelled));
    }
}

impl<T> fmt::Debug for Completer<T>
where
    T: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("id", &self.id.0)
            .field("completed", &self.inbox.is_none())
            .finish()
    }
}
