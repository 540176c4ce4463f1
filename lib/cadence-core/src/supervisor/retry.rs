use std::{fmt, rc::Rc, time::Duration};

use tracing::debug;

use super::backoff::{Backoff, ExponentialBackoff};
use crate::{config::SupervisorConfiguration, error::TaskError};

type RetryPredicate = Rc<dyn Fn(&TaskError) -> bool>;

/// Retry policy for a supervised task.
///
/// Defaults to the values of [`SupervisorConfiguration::default`]: three attempts, exponential backoff between 10ms
/// and 1s, every eligible error retried, and the last attempt's error reported as-is once attempts run out.
///
/// # Eligibility
///
/// Only application errors, cancellations, and groups made up entirely of those are ever retried, and only if the
/// retryability predicate agrees. Anything else fails the supervisor right away, whatever the predicate says: runtime
/// contract violations, timeouts, exhausted retries, closed channels, and any group containing one of them.
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Box<dyn Backoff>,
    is_retryable: RetryPredicate,
    wrap_exhausted: bool,
}

impl RetryPolicy {
    /// Creates a policy allowing up to `max_attempts` attempts, with the default backoff.
    ///
    /// A policy always allows at least one attempt.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Creates a policy from supervisor configuration.
    pub fn from_configuration(config: &SupervisorConfiguration) -> Self {
        let backoff =
            ExponentialBackoff::with_jitter(config.min_backoff(), config.max_backoff(), config.jitter_factor);
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Box::new(backoff),
            is_retryable: Rc::new(|_| true),
            wrap_exhausted: config.wrap_exhausted_error,
        }
    }

    /// Sets the backoff strategy used between attempts.
    pub fn with_backoff<B>(mut self, backoff: B) -> Self
    where
        B: Backoff + 'static,
    {
        self.backoff = Box::new(backoff);
        self
    }

    /// Sets the predicate deciding whether an eligible error is retried.
    pub fn with_retryable<F>(mut self, is_retryable: F) -> Self
    where
        F: Fn(&TaskError) -> bool + 'static,
    {
        self.is_retryable = Rc::new(is_retryable);
        self
    }

    /// Sets whether running out of attempts fails with [`TaskError::MaxRetriesExceeded`] rather than with the last
    /// attempt's error.
    pub fn wrap_exhausted(mut self, wrap: bool) -> Self {
        self.wrap_exhausted = wrap;
        self
    }

    /// Returns the maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn is_eligible(&self, error: &TaskError) -> bool {
        is_eligible_kind(error) && (self.is_retryable)(error)
    }
}

fn is_eligible_kind(error: &TaskError) -> bool {
    match error {
        TaskError::Cancelled | TaskError::Application { .. } => true,
        TaskError::Group { group } => group.iter().all(|(_, leaf)| is_eligible_kind(leaf)),
        TaskError::TimedOut
        | TaskError::MaxRetriesExceeded { .. }
        | TaskError::Runtime { .. }
        | TaskError::ChannelClosed { .. } => false,
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_configuration(&SupervisorConfiguration::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("wrap_exhausted", &self.wrap_exhausted)
            .finish_non_exhaustive()
    }
}

/// Why a supervisor stopped retrying.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum GiveUpReason {
    Exhausted,
    NotRetryable,
}

pub(super) enum RetryAction {
    /// Wait for the given duration, then make another attempt.
    Retry(Duration),

    /// Stop, failing with the given error.
    GiveUp(GiveUpReason, TaskError),
}

pub(super) struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Records the start of a new attempt, returning its number (starting at one).
    pub fn start_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    /// Evaluates a failed attempt and determines what the supervisor should do next.
    pub fn evaluate_failure(&mut self, error: TaskError) -> RetryAction {
        if !self.policy.is_eligible(&error) {
            debug!(attempt = self.attempts, kind = %error.kind(), "Error is not retryable, giving up.");
            return RetryAction::GiveUp(GiveUpReason::NotRetryable, error);
        }

        if self.attempts >= self.policy.max_attempts {
            debug!(attempts = self.attempts, "Retry limit reached, giving up.");
            let error = if self.policy.wrap_exhausted {
                TaskError::MaxRetriesExceeded {
                    attempts: self.attempts,
                    last: Box::new(error),
                }
            } else {
                error
            };
            return RetryAction::GiveUp(GiveUpReason::Exhausted, error);
        }

        RetryAction::Retry(self.policy.backoff.backoff_duration(self.attempts))
    }
}

#[cfg(test)]
mod tests {
    use cadence_error::generic_error;

    use super::*;
    use crate::{
        error::{ErrorKind, RuntimeError},
        group::ExceptionGroup,
        supervisor::FixedBackoff,
    };

    const FLAKY: ErrorKind = ErrorKind::new("Flaky");

    fn flaky() -> TaskError {
        TaskError::application(FLAKY, generic_error!("flaky"))
    }

    fn fixed(max_attempts: u32) -> RetryState {
        RetryState::new(RetryPolicy::new(max_attempts).with_backoff(FixedBackoff::new(Duration::from_millis(5))))
    }

    #[test]
    fn retries_until_limit() {
        let mut state = fixed(2);

        assert_eq!(state.start_attempt(), 1);
        assert!(matches!(state.evaluate_failure(flaky()), RetryAction::Retry(d) if d == Duration::from_millis(5)));

        assert_eq!(state.start_attempt(), 2);
        match state.evaluate_failure(flaky()) {
            RetryAction::GiveUp(GiveUpReason::Exhausted, error) => assert_eq!(error.kind(), FLAKY),
            _ => panic!("expected the supervisor to give up"),
        }
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut state = fixed(0);
        assert_eq!(state.max_attempts(), 1);
        state.start_attempt();
        assert!(matches!(
            state.evaluate_failure(flaky()),
            RetryAction::GiveUp(GiveUpReason::Exhausted, _)
        ));
    }

    #[test]
    fn contract_violations_are_never_retried() {
        let policy = RetryPolicy::new(5).with_retryable(|_| true);
        let mut state = RetryState::new(policy);
        state.start_attempt();

        let action = state.evaluate_failure(RuntimeError::NotInTaskContext.into());
        assert!(matches!(action, RetryAction::GiveUp(GiveUpReason::NotRetryable, _)));
    }

    #[test]
    fn predicate_filters_eligible_errors() {
        let policy = RetryPolicy::new(5).with_retryable(|error| !error.is_cancelled());
        let mut state = RetryState::new(policy);
        state.start_attempt();

        assert!(matches!(
            state.evaluate_failure(TaskError::Cancelled),
            RetryAction::GiveUp(GiveUpReason::NotRetryable, TaskError::Cancelled)
        ));
    }

    #[test]
    fn groups_are_only_retried_when_every_failure_is() {
        let closed = || TaskError::ChannelClosed {
            channel: "jobs".to_string(),
        };

        let mut state = fixed(3);
        state.start_attempt();
        let all_closed = ExceptionGroup::from_errors([closed(), closed()]).unwrap();
        assert!(matches!(
            state.evaluate_failure(all_closed.into()),
            RetryAction::GiveUp(GiveUpReason::NotRetryable, TaskError::Group { .. })
        ));

        let mut state = fixed(3);
        state.start_attempt();
        let mixed = ExceptionGroup::from_errors([flaky(), closed()]).unwrap();
        assert!(matches!(
            state.evaluate_failure(mixed.into()),
            RetryAction::GiveUp(GiveUpReason::NotRetryable, _)
        ));

        let mut state = fixed(3);
        state.start_attempt();
        let transient = ExceptionGroup::from_errors([flaky(), TaskError::Cancelled]).unwrap();
        assert!(matches!(state.evaluate_failure(transient.into()), RetryAction::Retry(_)));
    }

    #[test]
    fn timeouts_are_not_retried() {
        let mut state = fixed(3);
        state.start_attempt();
        assert!(matches!(
            state.evaluate_failure(TaskError::TimedOut),
            RetryAction::GiveUp(GiveUpReason::NotRetryable, TaskError::TimedOut)
        ));
    }

    #[test]
    fn exhausted_error_can_be_wrapped() {
        let mut state = RetryState::new(RetryPolicy::new(1).wrap_exhausted(true));
        state.start_attempt();

        match state.evaluate_failure(flaky()) {
            RetryAction::GiveUp(_, TaskError::MaxRetriesExceeded { attempts, last }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last.kind(), FLAKY);
            }
            _ => panic!("expected a wrapped error"),
        }
    }
}
