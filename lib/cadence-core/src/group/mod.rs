//! Groups of sibling tasks and aggregated failures.
//!
//! A [`TaskScope`] spawns tasks that belong together and joins them as one: if more than one of them fails, the
//! failures come back as a single [`ExceptionGroup`], which a [`GroupHandler`] can then pick apart by kind.
use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

use smallvec::SmallVec;
use tracing::debug;

use crate::{
    config::ScopePolicy,
    error::TaskError,
    scheduler::Handle,
    task::{context, ScopeId, TaskHandle, TaskId},
};

mod exception;
pub use self::exception::{ExceptionGroup, GroupHandler};

#[derive(Default)]
struct ScopeState {
    members: RefCell<Vec<TaskId>>,
    // Members cancelled because a sibling failed. Their `Cancelled` errors are a consequence, not a failure.
    cancelled: RefCell<SmallVec<[TaskId; 4]>>,
    tripped: Cell<bool>,
}

impl ScopeState {
    fn was_cancelled_by_scope(&self, id: TaskId) -> bool {
        self.cancelled.borrow().contains(&id)
    }

    fn cancel_siblings(&self, handle: &Handle, failed: TaskId) {
        if self.tripped.replace(true) {
            return;
        }

        let members = self.members.borrow().clone();
        for id in members.into_iter().filter(|id| *id != failed) {
            if handle.task_state(id).is_some() {
                self.cancelled.borrow_mut().push(id);
                // Members always belong to this scheduler, and completed ones are skipped above.
                let _ = handle.cancel(id);
            }
        }
    }
}

/// A set of sibling tasks that are joined together.
///
/// Created by [`Handle::scope`]. Every task spawned through the scope is tagged with the scope's identifier, and
/// [`join_all`][Self::join_all] waits for all of them:
///
/// - if every task succeeded, their values are returned in spawn order
/// - if exactly one task failed, its error is returned as-is
/// - if several tasks failed, their errors are returned together as a [`TaskError::Group`]
///
/// Under [`ScopePolicy::CancelOnFailure`], the first failure cancels every sibling that has not completed yet, and
/// the cancellations this causes are not counted as failures.
pub struct TaskScope<T> {
    handle: Handle,
    id: ScopeId,
    policy: ScopePolicy,
    children: Vec<TaskHandle<T>>,
    state: Rc<ScopeState>,
}

impl<T> TaskScope<T>
where
    T: Clone + 'static,
{
    pub(crate) fn new(handle: Handle, id: ScopeId, policy: ScopePolicy) -> Self {
        Self {
            handle,
            id,
            policy,
            children: Vec::new(),
            state: Rc::new(ScopeState::default()),
        }
    }

    /// Returns the identifier of this scope.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Returns the failure policy of this scope.
    pub fn policy(&self) -> ScopePolicy {
        self.policy
    }

    /// Returns the number of tasks spawned through this scope.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns `true` if no tasks have been spawned through this scope.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Spawns a task into the scope.
    pub fn spawn<F>(&mut self, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
    {
        self.spawn_inner(None, computation)
    }

    /// Spawns a named task into the scope.
    pub fn spawn_named<F, N>(&mut self, name: N, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
        N: Into<String>,
    {
        self.spawn_inner(Some(name.into()), computation)
    }

    fn spawn_inner<F>(&mut self, name: Option<String>, computation: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, TaskError>> + 'static,
    {
        let child = match self.policy {
            ScopePolicy::WaitAll => self.handle.spawn_scoped(name, self.id, computation),
            ScopePolicy::CancelOnFailure => {
                let state = Rc::clone(&self.state);
                let scope = self.id;
                self.handle.spawn_scoped(name, self.id, async move {
                    let result = computation.await;
                    if let Err(e) = &result {
                        if let Some(task) = context::current_task() {
                            if !state.was_cancelled_by_scope(task.id()) {
                                if let Ok(handle) = Handle::current() {
                                    debug!(
                                        %scope,
                                        task_id = %task.id(),
                                        error = %e,
                                        "Scoped task failed. Cancelling siblings."
                                    );
                                    state.cancel_siblings(&handle, task.id());
                                }
                            }
                        }
                    }
                    result
                })
            }
        };

        self.state.members.borrow_mut().push(child.id());
        self.children.push(child.clone());
        child
    }

    /// Cancels every task in the scope that has not completed yet.
    pub fn cancel(&self) {
        for child in &self.children {
            child.cancel();
        }
    }

    /// Waits for every task in the scope to complete.
    ///
    /// If the task calling this is itself cancelled (or resumed with any other error) while waiting, every task in the
    /// scope is cancelled and that error is returned.
    ///
    /// # Errors
    ///
    /// If one task failed, its error is returned. If several tasks failed, a [`TaskError::Group`] holding every
    /// failure is returned.
    pub async fn join_all(self) -> Result<Vec<T>, TaskError> {
        let mut values = Vec::with_capacity(self.children.len());
        let mut failures = Vec::new();

        for child in &self.children {
            match child.join_settled().await {
                Err(e) => {
                    debug!(scope = %self.id, error = %e, "Scope interrupted while joining. Cancelling all tasks.");
                    self.cancel();
                    return Err(e);
                }
                Ok(Ok(value)) => values.push(value),
                Ok(Err(e)) if e.is_cancelled() && self.state.was_cancelled_by_scope(child.id()) => {}
                Ok(Err(e)) => failures.push(e),
            }
        }

        match failures.len() {
            0 => Ok(values),
            1 => Err(failures.remove(0)),
            n => {
                debug!(scope = %self.id, failures = n, "Multiple scoped tasks failed.");
                match ExceptionGroup::from_errors(failures) {
                    Some(group) => Err(group.into()),
                    None => Ok(values),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cadence_error::generic_error;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        error::ErrorKind,
        scheduler::Scheduler,
        task::{sleep, TaskState},
        time::VirtualClock,
    };

    const VALUE_ERROR: ErrorKind = ErrorKind::new("ValueError");

    fn scheduler() -> Scheduler {
        Scheduler::default().with_clock(VirtualClock::new())
    }

    #[test]
    fn all_successes_in_spawn_order() {
        let scheduler = scheduler();
        let handle = scheduler.handle();

        let parent = scheduler.spawn(async move {
            let mut scope = handle.scope::<u64>();
            for delay in [30, 10, 20] {
                scope.spawn(async move {
                    sleep(Duration::from_millis(delay)).await?;
                    Ok(delay)
                });
            }
            scope.join_all().await
        });

        assert_eq!(scheduler.run_until(&parent).unwrap(), vec![30, 10, 20]);
    }

    #[test]
    fn single_failure_propagates_unwrapped() {
        let scheduler = scheduler();
        let handle = scheduler.handle();

        let parent = scheduler.spawn(async move {
            let mut scope = handle.scope::<()>();
            scope.spawn(async { Ok(()) });
            scope.spawn(async { Err(TaskError::application(VALUE_ERROR, generic_error!("bad"))) });
            scope.join_all().await
        });

        let err = scheduler.run_until(&parent).unwrap_err();
        assert_eq!(err.kind(), VALUE_ERROR);
    }

    #[test]
    fn cancel_on_failure_cancels_siblings() {
        let scheduler = scheduler();
        let handle = scheduler.handle();

        let slow = Rc::new(RefCell::new(None));
        let slow_handle = Rc::clone(&slow);
        let parent = scheduler.spawn(async move {
            let mut scope = handle.scope_with_policy::<()>(ScopePolicy::CancelOnFailure);
            let sleeper = scope.spawn(async {
                sleep(Duration::from_secs(60)).await?;
                Ok(())
            });
            *slow_handle.borrow_mut() = Some(sleeper);
            scope.spawn(async {
                sleep(Duration::from_millis(5)).await?;
                Err(TaskError::application(VALUE_ERROR, generic_error!("bad")))
            });
            scope.join_all().await
        });

        let start = scheduler.now();
        let err = scheduler.run_until(&parent).unwrap_err();
        assert_eq!(err.kind(), VALUE_ERROR);
        assert!(scheduler.now() - start < Duration::from_secs(60));

        let sleeper = slow.borrow_mut().take().unwrap();
        assert_eq!(sleeper.state(), TaskState::Failed);
        assert!(sleeper.future().try_result().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn cancelled_parent_cancels_scope() {
        let scheduler = scheduler();
        let handle = scheduler.handle();

        let children = Rc::new(RefCell::new(Vec::new()));
        let children_handle = Rc::clone(&children);
        let parent = scheduler.spawn(async move {
            let mut scope = handle.scope::<()>();
            for _ in 0..2 {
                let child = scope.spawn(async {
                    sleep(Duration::from_secs(60)).await?;
                    Ok(())
                });
                children_handle.borrow_mut().push(child);
            }
            scope.join_all().await
        });

        scheduler.run_until_stalled();
        parent.cancel();

        assert!(scheduler.run_until(&parent).unwrap_err().is_cancelled());
        scheduler.run();
        for child in children.borrow().iter() {
            assert_eq!(child.state(), TaskState::Failed);
        }
    }

    #[test]
    fn parent_cancelled_after_child_settles_still_cancels_scope() {
        let scheduler = scheduler();
        let handle = scheduler.handle();

        let late = Rc::new(RefCell::new(None));
        let late_handle = Rc::clone(&late);
        let parent = scheduler.spawn(async move {
            let mut scope = handle.scope::<u32>();
            scope.spawn(async { Ok(0) });
            let child = scope.spawn(async {
                sleep(Duration::from_secs(60)).await?;
                Err(TaskError::application(VALUE_ERROR, generic_error!("late")))
            });
            *late_handle.borrow_mut() = Some(child);
            scope.join_all().await
        });

        // The parent suspends joining the first child, which then completes and queues the parent to run again.
        assert!(scheduler.tick());
        assert!(scheduler.tick());
        parent.cancel();

        let start = scheduler.now();
        assert!(scheduler.run_until(&parent).unwrap_err().is_cancelled());
        scheduler.run();

        let late = late.borrow_mut().take().unwrap();
        assert_eq!(late.state(), TaskState::Failed);
        assert!(late.future().try_result().unwrap().unwrap_err().is_cancelled());
        assert!(scheduler.now() - start < Duration::from_secs(60));
    }
}
