//! Single-assignment result cells.
//!
//! A [`Promise`] starts out pending and is settled exactly once, either fulfilled with a value or rejected with a
//! [`TaskError`]. Every task spawned on a scheduler settles a promise when it completes, and tasks suspend on promises
//! to wait for one another.
//!
//! Promises are also awaitable from outside of any scheduler: in that case they register the caller's [`Waker`] and
//! wake it on settlement, like any other future.
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use tracing::trace;

use crate::{
    error::{RuntimeError, TaskError},
    task::{context, suspend, Awaitable, Suspend, Suspension, Waiter},
};

/// Settlement status of a promise.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PromiseStatus {
    /// Not yet settled.
    Pending,

    /// Settled with a value.
    Fulfilled,

    /// Settled with an error.
    Rejected,
}

enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(TaskError),
}

enum Subscriber {
    Task(Waiter),
    External(Waker),
}

struct Inner<T> {
    state: RefCell<State<T>>,
    subscribers: RefCell<Vec<Subscriber>>,
}

/// A single-assignment result cell.
///
/// Cloning a promise yields another handle to the same cell.
pub struct Promise<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Promise<T> {
    /// Creates a new, pending promise.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(State::Pending),
                subscribers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Creates a promise that is already fulfilled with `value`.
    pub fn fulfilled(value: T) -> Self {
        let promise = Self::new();
        *promise.inner.state.borrow_mut() = State::Fulfilled(value);
        promise
    }

    /// Creates a promise that is already rejected with `error`.
    pub fn rejected(error: TaskError) -> Self {
        let promise = Self::new();
        *promise.inner.state.borrow_mut() = State::Rejected(error);
        promise
    }

    /// Returns the settlement status of the promise.
    pub fn state(&self) -> PromiseStatus {
        match &*self.inner.state.borrow() {
            State::Pending => PromiseStatus::Pending,
            State::Fulfilled(_) => PromiseStatus::Fulfilled,
            State::Rejected(_) => PromiseStatus::Rejected,
        }
    }

    /// Returns `true` if the promise has been settled.
    pub fn is_settled(&self) -> bool {
        self.state() != PromiseStatus::Pending
    }

    /// Fulfills the promise with `value`, waking every waiter in the order they subscribed.
    ///
    /// # Errors
    ///
    /// If the promise was already settled, [`RuntimeError::AlreadySettled`] is returned and the stored result is left
    /// unchanged.
    pub fn resolve(&self, value: T) -> Result<(), RuntimeError> {
        self.settle(State::Fulfilled(value))
    }

    /// Rejects the promise with `error`, waking every waiter in the order they subscribed.
    ///
    /// # Errors
    ///
    /// If the promise was already settled, [`RuntimeError::AlreadySettled`] is returned and the stored result is left
    /// unchanged.
    pub fn reject(&self, error: TaskError) -> Result<(), RuntimeError> {
        self.settle(State::Rejected(error))
    }

    fn settle(&self, settled: State<T>) -> Result<(), RuntimeError> {
        {
            let mut state = self.inner.state.borrow_mut();
            if !matches!(*state, State::Pending) {
                return Err(RuntimeError::AlreadySettled);
            }
            *state = settled;
        }

        let subscribers = std::mem::take(&mut *self.inner.subscribers.borrow_mut());
        trace!(waiters = subscribers.len(), "Promise settled.");
        for subscriber in subscribers {
            match subscriber {
                Subscriber::Task(waiter) => waiter.wake(),
                Subscriber::External(waker) => waker.wake(),
            }
        }

        Ok(())
    }

    /// Returns this promise as a suspension out value, for use with [`suspend`][crate::task::suspend].
    pub fn as_suspension(&self) -> Suspension
    where
        T: 'static,
    {
        Suspension::Await(Rc::new(self.clone()))
    }

    fn subscribe_external(&self, waker: &Waker) {
        let mut subscribers = self.inner.subscribers.borrow_mut();
        let already_subscribed = subscribers.iter().any(|subscriber| match subscriber {
            Subscriber::External(existing) => existing.will_wake(waker),
            Subscriber::Task(_) => false,
        });
        if !already_subscribed {
            subscribers.push(Subscriber::External(waker.clone()));
        }
    }
}

impl<T: Clone> Promise<T> {
    /// Returns the settled result, or `None` if the promise is still pending.
    pub fn try_result(&self) -> Option<Result<T, TaskError>> {
        match &*self.inner.state.borrow() {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(error) => Some(Err(error.clone())),
        }
    }

    /// Waits for the promise to settle, returning a copy of its result.
    ///
    /// Inside a task, this suspends the task until the promise settles. Outside of one, the caller's waker is woken on
    /// settlement instead. Awaiting an already-settled promise completes immediately.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            promise: self.clone(),
            suspension: None,
        }
    }

    /// Waits for the promise to settle, without folding an error raised in the waiting task into the promise's result.
    pub(crate) fn wait_settled(&self) -> Settled<T> {
        Settled(self.wait())
    }
}

impl<T> Awaitable for Promise<T> {
    fn is_settled(&self) -> bool {
        Promise::is_settled(self)
    }

    fn register(&self, waiter: Waiter) {
        if self.is_settled() {
            waiter.wake();
        } else {
            self.inner.subscribers.borrow_mut().push(Subscriber::Task(waiter));
        }
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Promise");
        match &*self.inner.state.borrow() {
            State::Pending => debug.field("state", &PromiseStatus::Pending),
            State::Fulfilled(value) => debug.field("fulfilled", value),
            State::Rejected(error) => debug.field("rejected", error),
        };
        debug.finish()
    }
}

/// Future returned by [`Promise::wait`].
#[must_use = "futures do nothing unless awaited"]
pub struct Wait<T> {
    promise: Promise<T>,
    suspension: Option<Suspend>,
}

impl<T> Wait<T>
where
    T: Clone + 'static,
{
    /// Polls until the promise settles.
    ///
    /// The outer error is one raised in the waiting task itself (cancellation, or an error it was resumed with), and
    /// the inner result is the promise's own.
    fn poll_settled(&mut self, cx: &mut Context<'_>) -> Poll<Result<Result<T, TaskError>, TaskError>> {
        loop {
            // A suspension left over from an earlier step goes first, so an error injected into the task wins over a
            // promise that settled in the meantime.
            if let Some(suspension) = self.suspension.as_mut() {
                match Pin::new(suspension).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        self.suspension = None;
                        return Poll::Ready(Err(e));
                    }
                    // Resumed, but the in value may have been meant for another suspension point in this task: check
                    // the promise again and suspend anew if it is still pending.
                    Poll::Ready(Ok(())) => self.suspension = None,
                }
            }

            if let Some(result) = self.promise.try_result() {
                return Poll::Ready(Ok(result));
            }

            if context::current_task().is_none() {
                self.promise.subscribe_external(cx.waker());
                return Poll::Pending;
            }

            self.suspension = Some(suspend(self.promise.as_suspension()));
        }
    }
}

impl<T> Future for Wait<T>
where
    T: Clone + 'static,
{
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut()
            .poll_settled(cx)
            .map(|settled| settled.and_then(|result| result))
    }
}

/// Future returned by [`Promise::wait_settled`].
#[must_use = "futures do nothing unless awaited"]
pub(crate) struct Settled<T>(Wait<T>);

impl<T> Future for Settled<T>
where
    T: Clone + 'static,
{
    type Output = Result<Result<T, TaskError>, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().0.poll_settled(cx)
    }
}

#[cfg(test)]
mod tests {
    use cadence_error::generic_error;
    use tokio_test::{assert_pending, assert_ready, task::spawn};

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn second_settlement_is_rejected() {
        let promise = Promise::new();
        assert_eq!(promise.state(), PromiseStatus::Pending);

        promise.resolve(1).unwrap();
        assert_eq!(promise.resolve(2), Err(RuntimeError::AlreadySettled));
        assert_eq!(promise.reject(TaskError::Cancelled), Err(RuntimeError::AlreadySettled));

        assert_eq!(promise.state(), PromiseStatus::Fulfilled);
        assert_eq!(promise.try_result().unwrap().unwrap(), 1);
    }

    #[test]
    fn rejected_stays_rejected() {
        let promise = Promise::<u32>::new();
        promise
            .reject(TaskError::application(ErrorKind::new("IoError"), generic_error!("disk gone")))
            .unwrap();
        assert_eq!(promise.resolve(7), Err(RuntimeError::AlreadySettled));

        let err = promise.try_result().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::new("IoError"));
    }

    #[test]
    fn external_waiters_are_woken_on_settlement() {
        let promise = Promise::new();
        let mut first = spawn(promise.wait());
        let mut second = spawn(promise.wait());

        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert!(!first.is_woken());

        promise.resolve("done".to_string()).unwrap();

        assert!(first.is_woken());
        assert!(second.is_woken());
        assert_eq!(assert_ready!(first.poll()).unwrap(), "done");
        assert_eq!(assert_ready!(second.poll()).unwrap(), "done");
    }

    #[test]
    fn settled_promise_is_ready_immediately() {
        let mut fulfilled = spawn(Promise::fulfilled(5).wait());
        assert_eq!(assert_ready!(fulfilled.poll()).unwrap(), 5);

        let mut rejected = spawn(Promise::<u8>::rejected(TaskError::TimedOut).wait());
        assert!(matches!(assert_ready!(rejected.poll()), Err(TaskError::TimedOut)));
    }

    #[test]
    fn repeated_external_polls_do_not_pile_up_wakers() {
        let promise = Promise::<()>::new();
        let mut wait = spawn(promise.wait());
        assert_pending!(wait.poll());
        assert_pending!(wait.poll());
        assert_pending!(wait.poll());
        assert_eq!(promise.inner.subscribers.borrow().len(), 1);
    }
}
