use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use super::{context, InValue, Task};
use crate::{
    error::{RuntimeError, TaskError},
    scheduler::Handle,
};

/// Something a suspended task can wait on.
///
/// Implemented by [`Promise`][crate::promise::Promise]. The scheduler registers a [`Waiter`] once the step that
/// suspended on the awaitable ends, and the awaitable wakes every registered waiter, in registration order, when it
/// settles.
pub trait Awaitable {
    /// Returns `true` once the awaitable has settled.
    fn is_settled(&self) -> bool;

    /// Registers a waiter to be woken when the awaitable settles.
    fn register(&self, waiter: Waiter);
}

/// A suspended task waiting on an [`Awaitable`].
pub struct Waiter {
    task: Weak<Task>,
    epoch: u64,
}

impl Waiter {
    pub(crate) fn new(task: &Rc<Task>) -> Self {
        Self {
            task: Rc::downgrade(task),
            epoch: task.epoch(),
        }
    }

    /// Wakes the waiting task.
    ///
    /// Does nothing if the task has since been resumed for another reason, or no longer exists.
    pub fn wake(self) {
        if let Some(task) = self.task.upgrade() {
            if let Some(shared) = task.shared() {
                shared.wake_waiter(&task, self.epoch);
            }
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task = self.task.upgrade().map(|task| task.id());
        f.debug_struct("Waiter")
            .field("task", &task)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// The out value a task yields to its scheduler when it suspends.
#[derive(Clone)]
pub enum Suspension {
    /// Re-enqueue the task at the back of the ready queue.
    Yield,

    /// Resume the task once the deadline has passed.
    Timer(Instant),

    /// Resume the task once the awaitable settles.
    Await(Rc<dyn Awaitable>),
}

impl Suspension {
    fn is_satisfied(&self, task: &Task) -> bool {
        match self {
            Self::Yield => true,
            Self::Timer(deadline) => task.now().map_or(true, |now| now >= *deadline),
            Self::Await(awaitable) => awaitable.is_settled(),
        }
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yield => f.write_str("Yield"),
            Self::Timer(deadline) => f.debug_tuple("Timer").field(deadline).finish(),
            Self::Await(awaitable) => f
                .debug_struct("Await")
                .field("settled", &awaitable.is_settled())
                .finish(),
        }
    }
}

struct Registration {
    task: Weak<Task>,
    epoch: u64,
    token: u64,
}

/// Future returned by [`suspend`].
#[must_use = "futures do nothing unless awaited"]
pub struct Suspend {
    out: Option<Suspension>,
    registration: Option<Registration>,
}

impl Suspend {
    fn register(&mut self, task: &Rc<Task>, out: Suspension) {
        let token = task.push_suspension(out);
        self.registration = Some(Registration {
            task: Rc::downgrade(task),
            epoch: task.epoch(),
            token,
        });
    }

    fn complete(&mut self, value: InValue) -> Poll<InValue> {
        self.out = None;
        self.registration = None;
        Poll::Ready(value)
    }

    fn poll_in(&mut self) -> Poll<InValue> {
        let Some(task) = context::current_task() else {
            return Poll::Ready(Err(RuntimeError::NotInTaskContext.into()));
        };

        let Some(out) = self.out.clone() else {
            return Poll::Ready(Ok(None));
        };

        let (owner, epoch) = match &self.registration {
            None => {
                // An injected error is raised at the first suspension point the task reaches, even one that was not
                // the one suspended on when the error came in.
                if let Some(error) = task.take_resume_error() {
                    return self.complete(Err(error));
                }
                self.register(&task, out);
                return Poll::Pending;
            }
            Some(registration) => (registration.task.upgrade(), registration.epoch),
        };

        if !owner.is_some_and(|owner| Rc::ptr_eq(&owner, &task)) {
            return self.complete(Err(RuntimeError::NotInTaskContext.into()));
        }

        // Polled again within the step that registered it.
        if epoch == task.epoch() {
            return Poll::Pending;
        }

        if let Some(value) = task.take_resume_value() {
            return self.complete(value);
        }

        // Another suspension point in the same task consumed the in value, so only continue if whatever this one was
        // waiting on has actually happened.
        if out.is_satisfied(&task) {
            return self.complete(Ok(None));
        }

        self.register(&task, out);
        Poll::Pending
    }
}

impl Future for Suspend {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_in().map(|value| value.map(|_| ()))
    }
}

impl Drop for Suspend {
    fn drop(&mut self) {
        // A suspension point dropped during the step that registered it must not leave its out value behind.
        if let Some(registration) = self.registration.take() {
            if let Some(task) = registration.task.upgrade() {
                if task.epoch() == registration.epoch {
                    task.retract_suspension(registration.token);
                }
            }
        }
    }
}

/// Suspends the current task, yielding `out` to the scheduler.
///
/// The returned future completes with `Ok(())` when the task is resumed normally, or with the injected error when it
/// is resumed with one (including cancellation). Polling it from anywhere other than the task that first polled it
/// fails with [`RuntimeError::NotInTaskContext`].
pub fn suspend(out: Suspension) -> Suspend {
    Suspend {
        out: Some(out),
        registration: None,
    }
}

/// Future returned by [`suspend_value`].
#[must_use = "futures do nothing unless awaited"]
pub struct SuspendValue<T> {
    inner: Suspend,
    _value: PhantomData<fn() -> T>,
}

impl<T> Future for SuspendValue<T>
where
    T: 'static,
{
    type Output = Result<Option<T>, TaskError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let value = match self.get_mut().inner.poll_in() {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(value) => value?,
        };

        let value = match value {
            None => None,
            Some(value) => match value.downcast::<T>() {
                Ok(value) => Some(*value),
                Err(_) => {
                    return Poll::Ready(Err(RuntimeError::UnexpectedResumeValue {
                        expected: std::any::type_name::<T>(),
                    }
                    .into()))
                }
            },
        };
        Poll::Ready(Ok(value))
    }
}

/// Suspends the current task, yielding `out` to the scheduler, and returns the value it is resumed with.
///
/// A task resumed through [`Handle::resume_with`] gets that value back as `Some`. Any other normal continuation, such
/// as a timer firing or a promise settling, yields `None`.
///
/// # Errors
///
/// Fails with the injected error when the task is resumed with one, and with
/// [`RuntimeError::UnexpectedResumeValue`] if the value it is resumed with is not a `T`.
pub fn suspend_value<T>(out: Suspension) -> SuspendValue<T>
where
    T: 'static,
{
    SuspendValue {
        inner: suspend(out),
        _value: PhantomData,
    }
}

/// Yields control back to the scheduler, letting every other ready task run before this one continues.
pub fn yield_now() -> Suspend {
    suspend(Suspension::Yield)
}

/// Suspends the current task until `deadline`, as measured by its scheduler's clock.
pub async fn sleep_until(deadline: Instant) -> Result<(), TaskError> {
    let handle = Handle::current()?;
    while handle.now() < deadline {
        suspend(Suspension::Timer(deadline)).await?;
    }
    Ok(())
}

/// Suspends the current task for `duration`, as measured by its scheduler's clock.
pub async fn sleep(duration: Duration) -> Result<(), TaskError> {
    let handle = Handle::current()?;
    sleep_until(handle.now() + duration).await
}
