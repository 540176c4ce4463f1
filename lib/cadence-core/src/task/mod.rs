//! Tasks.
//!
//! A task is a suspendable unit of work: a boxed future whose captured state is everything the computation needs to
//! pick up where it left off. The scheduler drives a task one step at a time, where a step polls the future until it
//! either completes or reaches a [suspension point][suspend].
use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
    time::Instant,
};

use smallvec::SmallVec;

use crate::{
    error::{RuntimeError, TaskError},
    promise::{Promise, Settled, Wait},
    scheduler::Shared,
    timer::TimerKey,
};

pub(crate) mod context;

mod suspend;
pub use self::suspend::{
    sleep, sleep_until, suspend, suspend_value, yield_now, Awaitable, Suspend, SuspendValue, Suspension, Waiter,
};

mod timeout;
pub use self::timeout::timeout;

/// Task identifier.
///
/// Identifiers are allocated monotonically by a scheduler and never reused within it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a task identifier from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of this identifier.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scope identifier, shared by all tasks spawned through the same [`TaskScope`][crate::group::TaskScope].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ScopeId(pub(crate) u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TaskState {
    /// Spawned but never run.
    Created,

    /// Currently being stepped by its scheduler.
    Running,

    /// Paused at a suspension point.
    Suspended,

    /// Completed successfully.
    Succeeded,

    /// Completed with an error.
    Failed,
}

impl TaskState {
    /// Returns `true` if the task has completed, successfully or not.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// In value delivered to a suspended task when it is resumed.
///
/// Normal continuations carry no value, unless one was passed to
/// [`Handle::resume_with`][crate::scheduler::Handle::resume_with].
pub(crate) type InValue = Result<Option<Box<dyn Any>>, TaskError>;

/// Result of running a single step of a task.
#[derive(Debug)]
pub enum Step {
    /// The task reached one or more suspension points.
    ///
    /// Empty when the task is parked on a future that wakes it through its waker.
    Suspended(SmallVec<[Suspension; 2]>),

    /// The task ran to completion.
    Completed(Result<(), TaskError>),
}

/// Type-erased task computation, owning the promise it settles.
pub(crate) trait TaskBody {
    /// Polls the computation, settling the promise when it completes.
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TaskError>>;

    /// Fails the computation without running it any further.
    fn fail(self: Box<Self>, error: TaskError);
}

pub(crate) type BoxedComputation<T> = Pin<Box<dyn Future<Output = Result<T, TaskError>>>>;

pub(crate) struct TypedBody<T> {
    computation: BoxedComputation<T>,
    promise: Promise<T>,
}

impl<T> TypedBody<T> {
    pub(crate) fn new(computation: BoxedComputation<T>, promise: Promise<T>) -> Self {
        Self { computation, promise }
    }
}

impl<T> TaskBody for TypedBody<T> {
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), TaskError>> {
        // Only the body settles its promise, so settling cannot fail here.
        let outcome = match self.computation.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(value)) => {
                let _ = self.promise.resolve(value);
                Ok(())
            }
            Poll::Ready(Err(error)) => {
                let _ = self.promise.reject(error.clone());
                Err(error)
            }
        };
        Poll::Ready(outcome)
    }

    fn fail(self: Box<Self>, error: TaskError) {
        let promise = self.promise.clone();
        drop(self);
        let _ = promise.reject(error);
    }
}

/// Scheduler-side record of a task.
pub(crate) struct Task {
    id: TaskId,
    name: Option<String>,
    scope: Option<ScopeId>,
    shared: Weak<Shared>,
    state: Cell<TaskState>,

    // Incremented on every resume. Timer entries and promise waiters carry the epoch they were registered in, so a
    // wake-up from an earlier suspension can be told apart and discarded.
    epoch: Cell<u64>,

    // In value delivered by the most recent resume, consumed by the first suspension point polled in the next step.
    resume_value: RefCell<Option<InValue>>,
    outbox: RefCell<SmallVec<[(u64, Suspension); 2]>>,
    next_token: Cell<u64>,
    timers: RefCell<SmallVec<[TimerKey; 1]>>,
    cancel_requested: Cell<bool>,
    foreign_parked: Cell<bool>,
    body: RefCell<Option<Box<dyn TaskBody>>>,
    waker: Waker,
}

impl Task {
    pub(crate) fn new(
        id: TaskId, name: Option<String>, scope: Option<ScopeId>, shared: Weak<Shared>, body: Box<dyn TaskBody>,
        waker: Waker,
    ) -> Self {
        Self {
            id,
            name,
            scope,
            shared,
            state: Cell::new(TaskState::Created),
            epoch: Cell::new(0),
            resume_value: RefCell::new(None),
            outbox: RefCell::new(SmallVec::new()),
            next_token: Cell::new(0),
            timers: RefCell::new(SmallVec::new()),
            cancel_requested: Cell::new(false),
            foreign_parked: Cell::new(false),
            body: RefCell::new(Some(body)),
            waker,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn scope(&self) -> Option<ScopeId> {
        self.scope
    }

    pub(crate) fn shared(&self) -> Option<Rc<Shared>> {
        self.shared.upgrade()
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.set(state);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    pub(crate) fn advance_epoch(&self) {
        self.epoch.set(self.epoch.get() + 1);
    }

    pub(crate) fn has_resume_value(&self) -> bool {
        self.resume_value.borrow().is_some()
    }

    pub(crate) fn set_resume_value(&self, value: InValue) -> Option<InValue> {
        self.resume_value.borrow_mut().replace(value)
    }

    pub(crate) fn take_resume_value(&self) -> Option<InValue> {
        self.resume_value.borrow_mut().take()
    }

    /// Takes the pending in value only if it is an error, leaving normal continuations in place.
    pub(crate) fn take_resume_error(&self) -> Option<TaskError> {
        let mut slot = self.resume_value.borrow_mut();
        match slot.take() {
            Some(Err(error)) => Some(error),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub(crate) fn push_suspension(&self, out: Suspension) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        self.outbox.borrow_mut().push((token, out));
        token
    }

    pub(crate) fn retract_suspension(&self, token: u64) {
        self.outbox.borrow_mut().retain(|(t, _)| *t != token);
    }

    pub(crate) fn take_suspensions(&self) -> SmallVec<[Suspension; 2]> {
        std::mem::take(&mut *self.outbox.borrow_mut())
            .into_iter()
            .map(|(_, out)| out)
            .collect()
    }

    pub(crate) fn add_timer(&self, key: TimerKey) {
        self.timers.borrow_mut().push(key);
    }

    pub(crate) fn forget_timer(&self, key: &TimerKey) {
        self.timers.borrow_mut().retain(|k| k != key);
    }

    pub(crate) fn take_timers(&self) -> SmallVec<[TimerKey; 1]> {
        std::mem::take(&mut *self.timers.borrow_mut())
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.set(true);
    }

    pub(crate) fn take_cancel_request(&self) -> bool {
        self.cancel_requested.replace(false)
    }

    pub(crate) fn set_foreign_parked(&self, parked: bool) -> bool {
        self.foreign_parked.replace(parked)
    }

    pub(crate) fn is_foreign_parked(&self) -> bool {
        self.foreign_parked.get()
    }

    pub(crate) fn take_body(&self) -> Option<Box<dyn TaskBody>> {
        self.body.borrow_mut().take()
    }

    pub(crate) fn restore_body(&self, body: Box<dyn TaskBody>) {
        *self.body.borrow_mut() = Some(body);
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    /// Returns the current time according to the owning scheduler's clock.
    pub(crate) fn now(&self) -> Option<Instant> {
        self.shared().map(|shared| shared.now())
    }
}

/// Handle to a spawned task.
///
/// The handle can be used to observe the task, await its result, or cancel it. Dropping the handle does not affect the
/// task.
pub struct TaskHandle<T> {
    task: Rc<Task>,
    promise: Promise<T>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(task: Rc<Task>, promise: Promise<T>) -> Self {
        Self { task, promise }
    }

    /// Returns the identifier of the task.
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Returns the name of the task, if it was given one.
    pub fn name(&self) -> Option<&str> {
        self.task.name()
    }

    /// Returns the current state of the task.
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Returns `true` if the task has completed.
    pub fn is_finished(&self) -> bool {
        self.promise.is_settled()
    }

    /// Returns the promise that the task settles when it completes.
    pub fn future(&self) -> Promise<T> {
        self.promise.clone()
    }

    /// Cancels the task.
    ///
    /// See [`Handle::cancel`][crate::scheduler::Handle::cancel] for the exact semantics. Cancelling a completed task
    /// is a no-op.
    pub fn cancel(&self) {
        if let Some(shared) = self.task.shared() {
            shared.cancel_task(&self.task);
        }
    }

    pub(crate) fn task(&self) -> &Rc<Task> {
        &self.task
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Waits for the task to complete, returning its result.
    pub fn join(&self) -> Wait<T> {
        self.promise.wait()
    }

    /// Waits for the task to complete, keeping an error raised in the waiting task apart from the task's own result.
    pub(crate) fn join_settled(&self) -> Settled<T> {
        self.promise.wait_settled()
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            task: Rc::clone(&self.task),
            promise: self.promise.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.task.id())
            .field("name", &self.task.name())
            .field("state", &self.task.state())
            .finish()
    }
}

/// Converts a contract violation found while driving a task into the error it fails with.
pub(crate) fn invalid_state(task: &Task) -> RuntimeError {
    RuntimeError::InvalidState {
        task: task.id(),
        state: task.state(),
    }
}
