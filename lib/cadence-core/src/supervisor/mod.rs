//! Supervised tasks.
//!
//! A supervisor runs a task produced by a factory and, when it fails, spawns a fresh one from the same factory
//! according to a [`RetryPolicy`]: a bounded number of attempts, a [`Backoff`] between them, and a predicate deciding
//! which errors are worth retrying at all.
use std::future::Future;

use tracing::{debug, error, warn};

use crate::{
    error::TaskError,
    scheduler::Handle,
    task::{sleep, TaskHandle},
};

mod backoff;
pub use self::backoff::{Backoff, ExponentialBackoff, FixedBackoff};

mod retry;
pub use self::retry::RetryPolicy;
use self::retry::{GiveUpReason, RetryAction, RetryState};

/// Builder for a supervised task.
///
/// # Example
///
/// ```
/// use cadence_core::{scheduler::Scheduler, supervisor::{RetryPolicy, Supervisor}};
///
/// let scheduler = Scheduler::default();
/// let supervised = Supervisor::new(|| async { Ok::<_, cadence_core::error::TaskError>(42) })
///     .with_name("answer")
///     .with_policy(RetryPolicy::new(3))
///     .spawn(&scheduler.handle());
///
/// assert_eq!(scheduler.run_until(&supervised).unwrap(), 42);
/// ```
pub struct Supervisor<F> {
    factory: F,
    name: Option<String>,
    policy: Option<RetryPolicy>,
}

impl<F, Fut, T> Supervisor<F>
where
    F: FnMut() -> Fut + 'static,
    Fut: Future<Output = Result<T, TaskError>> + 'static,
    T: Clone + 'static,
{
    /// Creates a supervisor for tasks produced by `factory`.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            name: None,
            policy: None,
        }
    }

    /// Sets the name of the supervisor task.
    ///
    /// Attempts are named after it, as `<name>-attempt-<n>`.
    pub fn with_name<N>(mut self, name: N) -> Self
    where
        N: Into<String>,
    {
        self.name = Some(name.into());
        self
    }

    /// Sets the retry policy.
    ///
    /// Defaults to a policy built from the scheduler's supervisor configuration.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Spawns the supervisor task onto the given scheduler.
    ///
    /// The returned handle completes with the value of the first successful attempt, or fails once the supervisor
    /// gives up. Cancelling it cancels the attempt in progress.
    pub fn spawn(self, handle: &Handle) -> TaskHandle<T> {
        let policy = self
            .policy
            .unwrap_or_else(|| RetryPolicy::from_configuration(&handle.configuration().supervisor));
        let name = self.name.unwrap_or_else(|| "supervisor".to_string());

        let supervised = supervise(handle.clone(), name.clone(), self.factory, policy);
        handle.spawn_named(name, supervised)
    }
}

/// Runs tasks produced by `factory` under `policy`, until one succeeds or the policy gives up.
///
/// Shorthand for [`Supervisor::new(factory).with_policy(policy).spawn(handle)`][Supervisor].
pub fn run_supervised<F, Fut, T>(handle: &Handle, factory: F, policy: RetryPolicy) -> TaskHandle<T>
where
    F: FnMut() -> Fut + 'static,
    Fut: Future<Output = Result<T, TaskError>> + 'static,
    T: Clone + 'static,
{
    Supervisor::new(factory).with_policy(policy).spawn(handle)
}

async fn supervise<F, Fut, T>(
    handle: Handle, name: String, mut factory: F, policy: RetryPolicy,
) -> Result<T, TaskError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TaskError>> + 'static,
    T: Clone + 'static,
{
    let mut state = RetryState::new(policy);

    loop {
        let attempt = state.start_attempt();
        let child = handle.spawn_named(format!("{}-attempt-{}", name, attempt), factory());

        let error = match child.join_settled().await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(supervisor = %name, attempt, "Supervised task succeeded after retrying.");
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            // The supervisor itself was interrupted while waiting on the attempt.
            Err(e) => {
                debug!(supervisor = %name, attempt, error = %e, "Supervisor interrupted. Cancelling current attempt.");
                child.cancel();
                return Err(e);
            }
        };

        match state.evaluate_failure(error.clone()) {
            RetryAction::Retry(delay) => {
                warn!(
                    supervisor = %name,
                    attempt,
                    max_attempts = state.max_attempts(),
                    backoff = ?delay,
                    error = %error,
                    "Supervised task failed. Retrying after backoff."
                );
                sleep(delay).await?;
            }
            RetryAction::GiveUp(reason, final_error) => {
                match reason {
                    GiveUpReason::Exhausted => error!(
                        supervisor = %name,
                        attempts = state.attempts(),
                        error = %error,
                        "Supervised task failed on every attempt. Giving up."
                    ),
                    GiveUpReason::NotRetryable => error!(
                        supervisor = %name,
                        attempt,
                        error = %error,
                        "Supervised task failed with a non-retryable error. Giving up."
                    ),
                }
                return Err(final_error);
            }
        }
    }
}
