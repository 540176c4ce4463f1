//! The scheduler run loop.
//!
//! A [`Scheduler`] owns a table of tasks, a FIFO [ready queue][ReadyQueue] of tasks that can run right now, and a
//! [timer queue][TimerQueue] of tasks waiting for a deadline. Each iteration of the run loop:
//!
//! - drains the [inbox] of completions and wake-ups coming from other threads
//! - moves every task whose timer is due onto the ready queue, in deadline order
//! - if nothing is ready, advances the clock to the next deadline (or blocks on the inbox, if external work is still
//!   outstanding), and stops once there is nothing left to wait for
//! - otherwise, runs a single step of the task at the front of the ready queue
//!
//! Tasks are never preempted: a step runs until the task completes or reaches a suspension point.
use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    future::Future,
    rc::Rc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use foldhash::quality::RandomState;
use smallvec::SmallVec;
use tracing::{debug, debug_span, trace};

use crate::{
    config::{RuntimeConfiguration, ScopePolicy},
    error::{RuntimeError, TaskError},
    group::TaskScope,
    promise::Promise,
    queue::ReadyQueue,
    task::{
        context, invalid_state, InValue, ScopeId, Step, Suspension, Task, TaskHandle, TaskId, TaskState, TypedBody,
        Waiter,
    },
    time::{Clock, MonotonicClock},
    timer::TimerQueue,
};

pub mod inbox;
use self::inbox::{CompletionId, Completer, Inbox, InboxMessage};

type FastHashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;

type SettleFn = Box<dyn FnOnce(Box<dyn Any + Send>)>;

/// Summary of a call to [`Scheduler::run`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunReport {
    /// Number of task steps executed.
    pub steps: u64,

    /// Number of tasks that completed successfully.
    pub completed: u64,

    /// Number of tasks that completed with an error.
    pub failed: u64,

    /// Number of tasks left suspended when the loop stopped, waiting on something that will never happen.
    pub stranded: u64,
}

/// State shared between a scheduler and its handles.
pub(crate) struct Shared {
    name: String,
    config: RuntimeConfiguration,
    clock: RefCell<Rc<dyn Clock>>,
    next_task_id: Cell<u64>,
    next_scope_id: Cell<u64>,
    next_completion_id: Cell<u64>,
    tasks: RefCell<FastHashMap<TaskId, Rc<Task>>>,
    ready: RefCell<ReadyQueue>,
    timers: RefCell<TimerQueue>,
    inbox: Inbox,
    completions: RefCell<FastHashMap<CompletionId, SettleFn>>,
    foreign_parked: Cell<usize>,
    completed: Cell<u64>,
    failed: Cell<u64>,
    history: RefCell<CompletedHistory>,
}

/// Terminal states of the most recently completed tasks.
///
/// Completed tasks are dropped from the task table, and this is what still lets us report which state they ended up
/// in when they are looked up by identifier.
struct CompletedHistory {
    capacity: usize,
    order: VecDeque<TaskId>,
    states: FastHashMap<TaskId, TaskState>,
}

impl CompletedHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            states: FastHashMap::default(),
        }
    }

    fn record(&mut self, task: TaskId, state: TaskState) {
        if self.capacity == 0 {
            return;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
        self.order.push_back(task);
        self.states.insert(task, state);
    }

    fn get(&self, task: TaskId) -> Option<TaskState> {
        self.states.get(&task).copied()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.states.clear();
    }
}

impl Shared {
    fn new(config: RuntimeConfiguration) -> Self {
        Self {
            name: config.scheduler.name.clone(),
            clock: RefCell::new(Rc::new(MonotonicClock)),
            next_task_id: Cell::new(0),
            next_scope_id: Cell::new(0),
            next_completion_id: Cell::new(0),
            tasks: RefCell::new(FastHashMap::default()),
            ready: RefCell::new(ReadyQueue::new()),
            timers: RefCell::new(TimerQueue::new()),
            inbox: Inbox::new(),
            completions: RefCell::new(FastHashMap::default()),
            foreign_parked: Cell::new(0),
            completed: Cell::new(0),
            failed: Cell::new(0),
            history: RefCell::new(CompletedHistory::new(config.scheduler.completed_history)),
            config,
        }
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.borrow().now()
    }

    fn clock(&self) -> Rc<dyn Clock> {
        Rc::clone(&self.clock.borrow())
    }

    fn get_task(&self, id: TaskId) -> Result<Rc<Task>, RuntimeError> {
        if let Some(task) = self.tasks.borrow().get(&id) {
            return Ok(Rc::clone(task));
        }

        match self.history.borrow().get(id) {
            Some(state) => Err(RuntimeError::InvalidState { task: id, state }),
            None => Err(RuntimeError::UnknownTask { task: id }),
        }
    }

    /// Returns `true` if the identifier was issued by this scheduler, whether or not the task is still tracked.
    fn was_issued(&self, id: TaskId) -> bool {
        // Identifiers are never reused, so anything below the next identifier was issued by us.
        id.as_u64() < self.next_task_id.get()
    }

    fn spawn_task<T, F>(self: &Rc<Self>, name: Option<String>, scope: Option<ScopeId>, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
        T: 'static,
    {
        let id = TaskId::from_raw(self.next_task_id.get());
        self.next_task_id.set(id.as_u64() + 1);

        let promise = Promise::new();
        let body = TypedBody::new(Box::pin(computation), promise.clone());
        let task = Rc::new(Task::new(
            id,
            name,
            scope,
            Rc::downgrade(self),
            Box::new(body),
            self.inbox.waker_for(id),
        ));

        self.tasks.borrow_mut().insert(id, Rc::clone(&task));
        self.ready.borrow_mut().push_back(id);
        debug!(scheduler = %self.name, task_id = %id, task_name = task.name().unwrap_or(""), "Spawned task.");

        TaskHandle::new(task, promise)
    }

    /// Resumes a suspended task with `value` as its in value, and queues it to run.
    fn wake(&self, task: &Rc<Task>, value: InValue) {
        task.advance_epoch();
        task.set_resume_value(value);

        // Whatever else the task was waiting on lost the race.
        let stale_timers = task.take_timers();
        if !stale_timers.is_empty() {
            let mut timers = self.timers.borrow_mut();
            for key in stale_timers {
                timers.cancel(key);
            }
        }

        if task.set_foreign_parked(false) {
            self.foreign_parked.set(self.foreign_parked.get() - 1);
        }

        self.ready.borrow_mut().push_back(task.id());
    }

    pub(crate) fn wake_waiter(&self, task: &Rc<Task>, epoch: u64) {
        if task.state() == TaskState::Suspended && task.epoch() == epoch && !task.has_resume_value() {
            trace!(task_id = %task.id(), "Waking task waiting on settled promise.");
            self.wake(task, Ok(None));
        }
    }

    fn resume_task(&self, task: &Rc<Task>, value: InValue) -> Result<(), RuntimeError> {
        if task.state() != TaskState::Suspended || task.has_resume_value() {
            return Err(invalid_state(task));
        }

        self.wake(task, value);
        Ok(())
    }

    pub(crate) fn cancel_task(&self, task: &Rc<Task>) {
        match task.state() {
            TaskState::Created => {
                debug!(task_id = %task.id(), "Cancelling task before it ever ran.");
                self.ready.borrow_mut().remove(task.id());
                let body = task.take_body();
                self.finish(task, &Err(TaskError::Cancelled));
                if let Some(body) = body {
                    body.fail(TaskError::Cancelled);
                }
            }
            TaskState::Suspended => {
                debug!(task_id = %task.id(), "Cancelling suspended task.");
                if task.has_resume_value() {
                    // Already queued to run: the pending in value is replaced rather than queueing it twice.
                    task.set_resume_value(Err(TaskError::Cancelled));
                } else {
                    self.wake(task, Err(TaskError::Cancelled));
                }
            }
            TaskState::Running => {
                debug!(task_id = %task.id(), "Task cancelled itself. Cancelling at next suspension point.");
                task.request_cancel();
            }
            TaskState::Succeeded | TaskState::Failed => {}
        }
    }

    fn finish(&self, task: &Rc<Task>, outcome: &Result<(), TaskError>) {
        match outcome {
            Ok(()) => {
                task.set_state(TaskState::Succeeded);
                self.completed.set(self.completed.get() + 1);
                debug!(task_id = %task.id(), "Task completed.");
            }
            Err(e) => {
                task.set_state(TaskState::Failed);
                self.failed.set(self.failed.get() + 1);
                debug!(task_id = %task.id(), error = %e, "Task failed.");
            }
        }

        task.take_suspensions();
        let stale_timers = task.take_timers();
        {
            let mut timers = self.timers.borrow_mut();
            for key in stale_timers {
                timers.cancel(key);
            }
        }
        if task.set_foreign_parked(false) {
            self.foreign_parked.set(self.foreign_parked.get() - 1);
        }

        self.history.borrow_mut().record(task.id(), task.state());
        self.tasks.borrow_mut().remove(&task.id());
    }

    fn run_one_step(&self, task: &Rc<Task>) -> Result<Step, RuntimeError> {
        match task.state() {
            TaskState::Created => {}
            TaskState::Suspended if task.has_resume_value() => {}
            _ => return Err(invalid_state(task)),
        }

        let mut body = task.take_body().ok_or_else(|| invalid_state(task))?;
        task.set_state(TaskState::Running);

        let span = debug_span!("task", task_id = %task.id(), task_name = task.name().unwrap_or(""));
        let _entered = span.enter();
        trace!("Running task step.");

        let poll = {
            let _current = context::enter(Rc::clone(task));
            let mut cx = Context::from_waker(task.waker());
            body.poll_step(&mut cx)
        };

        let unconsumed = task.take_resume_value();

        let outcome = match poll {
            Poll::Ready(outcome) => outcome,
            Poll::Pending => match unconsumed {
                // The task reached no suspension point to raise the injected error at, so it is parked on a foreign
                // future that has no way to observe it, and fails with the error right here.
                Some(Err(error)) => {
                    self.finish(task, &Err(error.clone()));
                    body.fail(error.clone());
                    return Ok(Step::Completed(Err(error)));
                }
                _ => {
                    task.restore_body(body);
                    return Ok(self.suspend_task(task));
                }
            },
        };

        drop(body);
        self.finish(task, &outcome);
        Ok(Step::Completed(outcome))
    }

    fn suspend_task(&self, task: &Rc<Task>) -> Step {
        task.set_state(TaskState::Suspended);
        let suspensions = task.take_suspensions();

        if task.take_cancel_request() {
            self.wake(task, Err(TaskError::Cancelled));
            return Step::Suspended(suspensions);
        }

        if suspensions.is_empty() {
            trace!("Task parked on foreign future.");
            if !task.set_foreign_parked(true) {
                self.foreign_parked.set(self.foreign_parked.get() + 1);
            }
            return Step::Suspended(suspensions);
        }

        if suspensions.iter().any(|out| matches!(out, Suspension::Yield)) {
            trace!("Task yielded.");
            self.wake(task, Ok(None));
            return Step::Suspended(suspensions);
        }

        for out in &suspensions {
            // Registering on an awaitable that had already settled resumes the task on the spot, and anything
            // registered after that would belong to a suspension that is already over.
            if task.has_resume_value() {
                break;
            }

            match out {
                Suspension::Timer(deadline) => {
                    let key = self.timers.borrow_mut().schedule_at(*deadline, task.id(), task.epoch());
                    task.add_timer(key);
                    trace!(deadline = ?deadline, "Task suspended on timer.");
                }
                Suspension::Await(awaitable) => {
                    trace!("Task suspended on promise.");
                    awaitable.register(Waiter::new(task));
                }
                Suspension::Yield => {}
            }
        }

        Step::Suspended(suspensions)
    }

    fn drain_inbox(&self) {
        while let Some(message) = self.inbox.pop() {
            match message {
                InboxMessage::Wake(id) => {
                    let task = self.tasks.borrow().get(&id).cloned();
                    if let Some(task) = task {
                        if task.is_foreign_parked() && task.state() == TaskState::Suspended && !task.has_resume_value()
                        {
                            trace!(task_id = %id, "Waking task parked on foreign future.");
                            self.wake(&task, Ok(None));
                        }
                    }
                }
                InboxMessage::Complete(id, payload) => {
                    let settle = self.completions.borrow_mut().remove(&id);
                    match settle {
                        Some(settle) => {
                            trace!(completion_id = id.0, "Received external completion.");
                            settle(payload);
                        }
                        None => debug!(completion_id = id.0, "Dropping completion for unknown promise."),
                    }
                }
            }
        }
    }

    fn fire_due_timers(&self) {
        let now = self.now();
        let due = self.timers.borrow_mut().poll_due(now);
        for entry in due {
            let task = self.tasks.borrow().get(&entry.task).cloned();
            let Some(task) = task else {
                continue;
            };

            task.forget_timer(&entry.key());
            if task.state() == TaskState::Suspended && task.epoch() == entry.epoch && !task.has_resume_value() {
                trace!(task_id = %entry.task, "Timer fired.");
                self.wake(&task, Ok(None));
            } else {
                trace!(task_id = %entry.task, "Discarding stale timer.");
            }
        }
    }

    fn pop_ready(&self) -> Option<Rc<Task>> {
        loop {
            let id = self.ready.borrow_mut().pop_front()?;
            let task = self.tasks.borrow().get(&id).cloned();
            if let Some(task) = task {
                return Some(task);
            }
        }
    }

    fn has_outstanding_external(&self) -> bool {
        !self.completions.borrow().is_empty() || self.foreign_parked.get() > 0
    }

    /// Waits for more work to become available, returning `false` if none ever will.
    fn wait_for_work(&self) -> bool {
        let next_deadline = self.timers.borrow().next_deadline();
        let clock = self.clock();

        if !self.has_outstanding_external() {
            return match next_deadline {
                Some(deadline) => {
                    trace!("Idle. Sleeping until next timer deadline.");
                    clock.sleep_until(deadline);
                    true
                }
                None => false,
            };
        }

        let park_timeout = Duration::from_millis(self.config.scheduler.park_timeout_ms);
        let now = clock.now();
        let wait = next_deadline
            .map(|deadline| deadline.saturating_duration_since(now).min(park_timeout))
            .unwrap_or(park_timeout);

        trace!(timeout = ?wait, "Idle with external work outstanding. Parking on inbox.");
        if !self.inbox.park(wait) {
            // Move the clock along by however long we were parked, which only matters for clocks that do not advance
            // on their own.
            if let Some(deadline) = next_deadline {
                clock.sleep_until(deadline.min(now + wait));
            }
        }
        true
    }

    fn stranded(&self) -> u64 {
        self.tasks
            .borrow()
            .values()
            .filter(|task| task.state() == TaskState::Suspended)
            .count() as u64
    }
}

/// A cloneable handle to a [`Scheduler`].
///
/// Handles are how tasks interact with the scheduler running them: spawning more tasks, creating scopes and external
/// completions, or cancelling and resuming other tasks. Like the scheduler itself, handles are confined to the thread
/// that created them.
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl Handle {
    /// Returns a handle to the scheduler running the current task.
    ///
    /// # Errors
    ///
    /// If called outside of a task, or if the scheduler has since been dropped, [`RuntimeError::NotInTaskContext`] is
    /// returned.
    pub fn current() -> Result<Self, RuntimeError> {
        context::current_task()
            .and_then(|task| task.shared())
            .map(|shared| Self { shared })
            .ok_or(RuntimeError::NotInTaskContext)
    }

    /// Spawns a task.
    ///
    /// The task is queued to run immediately, but does not run until the scheduler gets to it.
    pub fn spawn<T, F>(&self, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
        T: 'static,
    {
        self.shared.spawn_task(None, None, computation)
    }

    /// Spawns a named task.
    ///
    /// The name is attached to every log emitted while the task runs.
    pub fn spawn_named<T, F, N>(&self, name: N, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
        T: 'static,
        N: Into<String>,
    {
        self.shared.spawn_task(Some(name.into()), None, computation)
    }

    pub(crate) fn spawn_scoped<T, F>(&self, name: Option<String>, scope: ScopeId, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
        T: 'static,
    {
        self.shared.spawn_task(name, Some(scope), computation)
    }

    /// Resumes a suspended task, continuing it normally.
    ///
    /// # Errors
    ///
    /// If the task is not suspended, or was already resumed since it last suspended, [`RuntimeError::InvalidState`] is
    /// returned. If the task was never spawned on this scheduler, or completed too long ago to still be tracked (see
    /// `scheduler.completed_history`), [`RuntimeError::UnknownTask`] is returned.
    pub fn resume(&self, id: TaskId) -> Result<(), RuntimeError> {
        let task = self.shared.get_task(id)?;
        self.shared.resume_task(&task, Ok(None))
    }

    /// Resumes a suspended task, handing it `value` as its in value.
    ///
    /// The value is returned by the [`suspend_value`][crate::task::suspend_value] the task is suspended at. Any other
    /// kind of suspension point continues normally and discards it.
    ///
    /// # Errors
    ///
    /// Same as [`resume`][Self::resume].
    pub fn resume_with<V>(&self, id: TaskId, value: V) -> Result<(), RuntimeError>
    where
        V: 'static,
    {
        let task = self.shared.get_task(id)?;
        self.shared.resume_task(&task, Ok(Some(Box::new(value))))
    }

    /// Resumes a suspended task by raising `error` at its suspension point.
    ///
    /// # Errors
    ///
    /// Same as [`resume`][Self::resume].
    pub fn resume_with_error(&self, id: TaskId, error: TaskError) -> Result<(), RuntimeError> {
        let task = self.shared.get_task(id)?;
        self.shared.resume_task(&task, Err(error))
    }

    /// Cancels a task.
    ///
    /// - a task that never ran completes immediately with [`TaskError::Cancelled`]
    /// - a suspended task is resumed with `Cancelled` raised at its suspension point, replacing any in value it was
    ///   already resumed with
    /// - a running task (cancelling itself) gets `Cancelled` at its next suspension point
    /// - cancelling a completed task is a no-op
    ///
    /// # Errors
    ///
    /// If the task was never spawned on this scheduler, [`RuntimeError::UnknownTask`] is returned.
    pub fn cancel(&self, id: TaskId) -> Result<(), RuntimeError> {
        match self.shared.get_task(id) {
            Ok(task) => {
                self.shared.cancel_task(&task);
                Ok(())
            }
            // Completed tasks are no longer in the task table, and cancelling them is a no-op.
            Err(RuntimeError::InvalidState { .. }) => Ok(()),
            Err(RuntimeError::UnknownTask { task }) if self.shared.was_issued(task) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns the state of a task, or `None` if it is not tracked.
    ///
    /// Tasks stop being tracked once they complete: use [`TaskHandle::state`] to observe a task over its full
    /// lifecycle.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.shared.tasks.borrow().get(&id).map(|task| task.state())
    }

    /// Creates a promise that can be settled from any thread through the returned [`Completer`].
    ///
    /// While the completer is outstanding, the scheduler will not stop for lack of work: it blocks on its inbox
    /// instead.
    pub fn completion<T>(&self) -> (Promise<T>, Completer<T>)
    where
        T: Send + 'static,
    {
        let id = CompletionId(self.shared.next_completion_id.get());
        self.shared.next_completion_id.set(id.0 + 1);

        let promise = Promise::new();
        let settle_promise = promise.clone();
        let settle: SettleFn = Box::new(move |payload: Box<dyn Any + Send>| {
            match payload.downcast::<Result<T, TaskError>>() {
                Ok(result) => {
                    let _ = match *result {
                        Ok(value) => settle_promise.resolve(value),
                        Err(error) => settle_promise.reject(error),
                    };
                }
                Err(_) => debug!("Discarding external completion with unexpected payload type."),
            }
        });
        self.shared.completions.borrow_mut().insert(id, settle);

        (promise, Completer::new(id, self.shared.inbox.clone()))
    }

    /// Creates a scope for spawning a group of sibling tasks, using the configured scope policy.
    pub fn scope<T>(&self) -> TaskScope<T>
    where
        T: Clone + 'static,
    {
        self.scope_with_policy(self.shared.config.scope.policy)
    }

    /// Creates a scope for spawning a group of sibling tasks, with the given policy.
    pub fn scope_with_policy<T>(&self, policy: ScopePolicy) -> TaskScope<T>
    where
        T: Clone + 'static,
    {
        let id = ScopeId(self.shared.next_scope_id.get());
        self.shared.next_scope_id.set(id.0 + 1);
        TaskScope::new(self.clone(), id, policy)
    }

    /// Returns the current time according to the scheduler's clock.
    pub fn now(&self) -> Instant {
        self.shared.now()
    }

    /// Returns the configuration the scheduler was created with.
    pub fn configuration(&self) -> &RuntimeConfiguration {
        &self.shared.config
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("scheduler", &self.shared.name).finish()
    }
}

/// A cooperative, single-threaded task scheduler.
///
/// Schedulers are `!Send`: a scheduler and all of its tasks live on the thread that created it. Any number of
/// independent schedulers can exist at the same time.
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// Creates a new scheduler from the given configuration, using the system's monotonic clock.
    pub fn new(config: RuntimeConfiguration) -> Self {
        Self {
            handle: Handle {
                shared: Rc::new(Shared::new(config)),
            },
        }
    }

    /// Replaces the scheduler's clock.
    pub fn with_clock<C>(self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        *self.shared().clock.borrow_mut() = Rc::new(clock);
        self
    }

    fn shared(&self) -> &Rc<Shared> {
        &self.handle.shared
    }

    /// Returns a handle to this scheduler.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Spawns a task. See [`Handle::spawn`].
    pub fn spawn<T, F>(&self, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
        T: 'static,
    {
        self.handle.spawn(computation)
    }

    /// Spawns a named task. See [`Handle::spawn_named`].
    pub fn spawn_named<T, F, N>(&self, name: N, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
        T: 'static,
        N: Into<String>,
    {
        self.handle.spawn_named(name, computation)
    }

    /// Resumes a suspended task. See [`Handle::resume`].
    pub fn resume(&self, id: TaskId) -> Result<(), RuntimeError> {
        self.handle.resume(id)
    }

    /// Resumes a suspended task with a value. See [`Handle::resume_with`].
    pub fn resume_with<V>(&self, id: TaskId, value: V) -> Result<(), RuntimeError>
    where
        V: 'static,
    {
        self.handle.resume_with(id, value)
    }

    /// Resumes a suspended task with an error. See [`Handle::resume_with_error`].
    pub fn resume_with_error(&self, id: TaskId, error: TaskError) -> Result<(), RuntimeError> {
        self.handle.resume_with_error(id, error)
    }

    /// Cancels a task. See [`Handle::cancel`].
    pub fn cancel(&self, id: TaskId) -> Result<(), RuntimeError> {
        self.handle.cancel(id)
    }

    /// Creates an externally-settled promise. See [`Handle::completion`].
    pub fn completion<T>(&self) -> (Promise<T>, Completer<T>)
    where
        T: Send + 'static,
    {
        self.handle.completion()
    }

    /// Returns the current time according to the scheduler's clock.
    pub fn now(&self) -> Instant {
        self.handle.now()
    }

    /// Returns the state of a task, or `None` if it is not tracked. See [`Handle::task_state`].
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.handle.task_state(id)
    }

    /// Runs a single step of the given task, outside of the normal run loop.
    ///
    /// # Errors
    ///
    /// If the task is running, completed, or suspended without having been resumed, [`RuntimeError::InvalidState`] is
    /// returned.
    pub fn run_one_step(&self, id: TaskId) -> Result<Step, RuntimeError> {
        let task = self.shared().get_task(id)?;
        let step = self.shared().run_one_step(&task)?;
        // The task may still be queued from before, and it has now had its turn.
        self.shared().ready.borrow_mut().remove(id);
        if task.has_resume_value() && task.state() == TaskState::Suspended {
            self.shared().ready.borrow_mut().push_back(id);
        }
        Ok(step)
    }

    /// Runs until there is no more work: no ready tasks, no pending timers, and no outstanding external completions.
    ///
    /// Stops early if the configured step budget (`scheduler.max_steps`) is exhausted.
    pub fn run(&self) -> RunReport {
        self.run_inner(|| false, true)
    }

    /// Runs until the given task completes, returning its result.
    ///
    /// # Errors
    ///
    /// If the scheduler runs out of work before the task completes (it is waiting on something that will never
    /// happen), [`RuntimeError::InvalidState`] is returned.
    pub fn run_until<T>(&self, task: &TaskHandle<T>) -> Result<T, TaskError>
    where
        T: Clone,
    {
        self.run_inner(|| task.is_finished(), true);
        match task.future().try_result() {
            Some(result) => result,
            None => Err(invalid_state(task.task()).into()),
        }
    }

    /// Runs every task that can make progress without advancing the clock or blocking.
    pub fn run_until_stalled(&self) -> RunReport {
        self.run_inner(|| false, false)
    }

    /// Runs a single iteration of the run loop, returning `true` if a task step was executed.
    pub fn tick(&self) -> bool {
        let shared = self.shared();
        shared.drain_inbox();
        shared.fire_due_timers();
        match shared.pop_ready() {
            Some(task) => shared.run_one_step(&task).is_ok(),
            None => false,
        }
    }

    fn run_inner<F>(&self, mut should_stop: F, wait_when_idle: bool) -> RunReport
    where
        F: FnMut() -> bool,
    {
        let shared = self.shared();
        let completed_before = shared.completed.get();
        let failed_before = shared.failed.get();
        let max_steps = shared.config.scheduler.max_steps;
        let mut steps = 0;

        debug!(scheduler = %shared.name, "Scheduler starting.");

        loop {
            if should_stop() {
                break;
            }
            if max_steps.is_some_and(|max_steps| steps >= max_steps) {
                debug!(scheduler = %shared.name, steps, "Step budget exhausted. Stopping.");
                break;
            }

            shared.drain_inbox();
            shared.fire_due_timers();

            if let Some(task) = shared.pop_ready() {
                match shared.run_one_step(&task) {
                    Ok(_) => steps += 1,
                    Err(e) => trace!(task_id = %task.id(), error = %e, "Skipping task that is not runnable."),
                }
                continue;
            }

            if !wait_when_idle || !shared.wait_for_work() {
                break;
            }
        }

        let report = RunReport {
            steps,
            completed: shared.completed.get() - completed_before,
            failed: shared.failed.get() - failed_before,
            stranded: shared.stranded(),
        };
        debug!(
            scheduler = %shared.name,
            steps = report.steps,
            completed = report.completed,
            failed = report.failed,
            stranded = report.stranded,
            "Scheduler stopped."
        );
        report
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(RuntimeConfiguration::default())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Task bodies routinely hold handles back to the scheduler, so the bodies are dropped explicitly to break those
        // cycles. Nothing is borrowed while they drop.
        let tasks: SmallVec<[Rc<Task>; 8]> = self.shared().tasks.borrow_mut().drain().map(|(_, task)| task).collect();
        for task in tasks {
            drop(task.take_body());
        }

        let completions: Vec<SettleFn> = self.shared().completions.borrow_mut().drain().map(|(_, f)| f).collect();
        drop(completions);

        self.shared().ready.borrow_mut().clear();
        self.shared().timers.borrow_mut().clear();
        self.shared().history.borrow_mut().clear();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared();
        f.debug_struct("Scheduler")
            .field("name", &shared.name)
            .field("tasks", &shared.tasks.borrow().len())
            .field("ready", &shared.ready.borrow().len())
            .field("timers", &shared.timers.borrow().len())
            .finish()
    }
}
