//! Runtime and task errors.
//!
//! Two error types flow through the runtime. [`RuntimeError`] describes contract violations: an operation was invoked
//! in a context or state where it is not allowed. [`TaskError`] is what a task fails with, and is what promises carry
//! to every party waiting on them, which is why it is cheaply cloneable.
use std::fmt;

use cadence_error::{GenericError, SharedError};
use snafu::Snafu;

use crate::{
    group::ExceptionGroup,
    task::{TaskId, TaskState},
};

/// A contract violation detected by the runtime.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RuntimeError {
    /// A suspension point was polled outside of the task that owns it.
    #[snafu(display("Suspension point polled outside of a running task."))]
    NotInTaskContext,

    /// A task was in a state that does not permit the requested operation.
    #[snafu(display("Task {} is {}, which does not permit this operation.", task, state))]
    InvalidState {
        /// Task that the operation targeted.
        task: TaskId,

        /// State the task was in.
        state: TaskState,
    },

    /// A promise was settled more than once.
    #[snafu(display("Promise has already been settled."))]
    AlreadySettled,

    /// A task identifier was never issued by this scheduler, or belongs to a task that completed too long ago to still
    /// be tracked.
    #[snafu(display("Task {} is not known to this scheduler.", task))]
    UnknownTask {
        /// Identifier that was looked up.
        task: TaskId,
    },

    /// A task was resumed with a value of a different type than its suspension point expected.
    #[snafu(display("Task was resumed with a value that is not a `{}`.", expected))]
    UnexpectedResumeValue {
        /// Name of the type the suspension point expected.
        expected: &'static str,
    },
}

/// Category of a task error, used to partition and dispatch failures.
///
/// Application code defines its own kinds with [`ErrorKind::new`]. Built-in kinds exist for every failure the runtime
/// itself produces.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ErrorKind(&'static str);

impl ErrorKind {
    /// Kind of [`TaskError::Cancelled`].
    pub const CANCELLED: ErrorKind = ErrorKind("Cancelled");

    /// Kind of [`TaskError::TimedOut`].
    pub const TIMED_OUT: ErrorKind = ErrorKind("TimedOut");

    /// Kind of [`TaskError::MaxRetriesExceeded`].
    pub const MAX_RETRIES_EXCEEDED: ErrorKind = ErrorKind("MaxRetriesExceeded");

    /// Kind of [`TaskError::Group`].
    pub const GROUP: ErrorKind = ErrorKind("ExceptionGroup");

    /// Kind of [`TaskError::Runtime`].
    pub const RUNTIME: ErrorKind = ErrorKind("RuntimeError");

    /// Kind of [`TaskError::ChannelClosed`].
    pub const CHANNEL_CLOSED: ErrorKind = ErrorKind("ChannelClosed");

    /// Creates a new application-defined error kind.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the name of this kind.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// The error a task fails with.
#[derive(Clone, Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TaskError {
    /// The task was cancelled.
    #[snafu(display("Task was cancelled."))]
    Cancelled,

    /// The task did not complete before its deadline.
    #[snafu(display("Task timed out."))]
    TimedOut,

    /// A supervised task failed on every attempt.
    #[snafu(display("Task failed after {} attempts: {}", attempts, last))]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,

        /// Error from the final attempt.
        last: Box<TaskError>,
    },

    /// Application-defined failure.
    #[snafu(display("{}: {}", kind, source))]
    Application {
        /// Kind used to partition and dispatch the failure.
        kind: ErrorKind,

        /// Underlying error.
        source: SharedError,
    },

    /// Multiple sibling tasks failed.
    #[snafu(display("{}", group))]
    Group {
        /// Failures, partitioned by kind.
        group: ExceptionGroup,
    },

    /// The task violated a runtime contract.
    #[snafu(display("Runtime contract violated: {}", source))]
    Runtime {
        /// Underlying runtime error.
        source: RuntimeError,
    },

    /// The broadcast channel being awaited was closed.
    #[snafu(display("Channel '{}' was closed.", channel))]
    ChannelClosed {
        /// Name of the channel.
        channel: String,
    },
}

impl TaskError {
    /// Creates an application error of the given kind.
    pub fn application<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<GenericError>,
    {
        Self::Application {
            kind,
            source: SharedError::from(error.into()),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::CANCELLED,
            Self::TimedOut => ErrorKind::TIMED_OUT,
            Self::MaxRetriesExceeded { .. } => ErrorKind::MAX_RETRIES_EXCEEDED,
            Self::Application { kind, .. } => *kind,
            Self::Group { .. } => ErrorKind::GROUP,
            Self::Runtime { .. } => ErrorKind::RUNTIME,
            Self::ChannelClosed { .. } => ErrorKind::CHANNEL_CLOSED,
        }
    }

    /// Returns `true` if this is [`TaskError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if this error, or any error aggregated within it, is a runtime contract violation.
    pub fn is_contract_violation(&self) -> bool {
        match self {
            Self::Runtime { .. } => true,
            Self::MaxRetriesExceeded { last, .. } => last.is_contract_violation(),
            Self::Group { group } => group.iter().any(|(_, e)| e.is_contract_violation()),
            _ => false,
        }
    }

    /// Returns the group, if this error aggregates multiple failures.
    pub fn as_group(&self) -> Option<&ExceptionGroup> {
        match self {
            Self::Group { group } => Some(group),
            _ => None,
        }
    }
}

impl From<RuntimeError> for TaskError {
    fn from(source: RuntimeError) -> Self {
        Self::Runtime { source }
    }
}

impl From<ExceptionGroup> for TaskError {
    fn from(group: ExceptionGroup) -> Self {
        Self::Group { group }
    }
}
