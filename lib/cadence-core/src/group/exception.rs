use std::fmt;

use indexmap::IndexMap;
use tracing::trace;

use crate::error::{ErrorKind, TaskError};

/// An aggregate of failures from tasks that ran concurrently, partitioned by error kind.
///
/// Kinds are ordered by first appearance, and errors of the same kind keep the order they were added in. Nested
/// groups are flattened as they are added, so every error held by a group is a leaf failure.
#[derive(Clone, Debug)]
pub struct ExceptionGroup {
    errors: IndexMap<ErrorKind, Vec<TaskError>>,
    len: usize,
}

impl ExceptionGroup {
    /// Builds a group out of `errors`.
    ///
    /// Returns `None` if there were no errors, as a group is never empty.
    pub fn from_errors<I>(errors: I) -> Option<Self>
    where
        I: IntoIterator<Item = TaskError>,
    {
        let mut group = Self {
            errors: IndexMap::new(),
            len: 0,
        };
        for error in errors {
            group.push(error);
        }

        (group.len > 0).then_some(group)
    }

    fn push(&mut self, error: TaskError) {
        match error {
            TaskError::Group { group } => {
                for error in group.into_errors() {
                    self.push(error);
                }
            }
            error => {
                self.errors.entry(error.kind()).or_default().push(error);
                self.len += 1;
            }
        }
    }

    /// Returns the kinds present in the group, in order of first appearance.
    pub fn kinds(&self) -> impl Iterator<Item = ErrorKind> + '_ {
        self.errors.keys().copied()
    }

    /// Returns the errors of the given kind.
    pub fn get(&self, kind: ErrorKind) -> &[TaskError] {
        self.errors.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the number of errors of the given kind.
    pub fn count(&self, kind: ErrorKind) -> usize {
        self.get(kind).len()
    }

    /// Returns the total number of errors in the group.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the group holds no errors.
    ///
    /// Always `false` for groups built through [`from_errors`][Self::from_errors].
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over every error in the group, grouped by kind.
    pub fn iter(&self) -> impl Iterator<Item = (ErrorKind, &TaskError)> + '_ {
        self.errors
            .iter()
            .flat_map(|(kind, errors)| errors.iter().map(move |error| (*kind, error)))
    }

    /// Consumes the group, returning every error in it, grouped by kind.
    pub fn into_errors(self) -> Vec<TaskError> {
        self.errors.into_values().flatten().collect()
    }
}

impl fmt::Display for ExceptionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} concurrent failures (", self.len)?;
        for (i, (kind, errors)) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", kind, errors.len())?;
        }
        f.write_str(")")
    }
}

type KindHandler = Box<dyn Fn(TaskError) -> Result<(), TaskError>>;

/// Dispatches the failures of an error, by kind, to registered handlers.
///
/// Failures nobody handles are never dropped: they are re-aggregated and returned. A handler that fails itself adds
/// its error to that remainder.
///
/// # Example
///
/// ```
/// use cadence_core::{error::{ErrorKind, TaskError}, group::{ExceptionGroup, GroupHandler}};
/// use cadence_error::generic_error;
///
/// const VALUE_ERROR: ErrorKind = ErrorKind::new("ValueError");
/// const TYPE_ERROR: ErrorKind = ErrorKind::new("TypeError");
///
/// let group = ExceptionGroup::from_errors([
///     TaskError::application(VALUE_ERROR, generic_error!("bad value")),
///     TaskError::application(TYPE_ERROR, generic_error!("bad type")),
/// ])
/// .unwrap();
///
/// let remainder = GroupHandler::new()
///     .handle_kind(VALUE_ERROR, |_| Ok(()))
///     .handle(group.into())
///     .unwrap_err();
/// assert_eq!(remainder.as_group().unwrap().count(TYPE_ERROR), 1);
/// ```
#[derive(Default)]
pub struct GroupHandler {
    handlers: IndexMap<ErrorKind, KindHandler>,
}

impl GroupHandler {
    /// Creates a handler with no kinds registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for failures of the given kind, replacing any handler already registered for it.
    pub fn handle_kind<F>(mut self, kind: ErrorKind, handler: F) -> Self
    where
        F: Fn(TaskError) -> Result<(), TaskError> + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
        self
    }

    /// Dispatches every failure in `error` to its handler.
    ///
    /// A group is split into its leaf failures first. Any other error is dispatched as a single failure.
    ///
    /// # Errors
    ///
    /// If any failure was left unhandled, or a handler failed, those errors are returned as a
    /// [`TaskError::Group`], even when there is only one of them.
    pub fn handle(&self, error: TaskError) -> Result<(), TaskError> {
        let failures = match error {
            TaskError::Group { group } => group.into_errors(),
            error => vec![error],
        };

        let mut remainder = Vec::new();
        for failure in failures {
            match self.handlers.get(&failure.kind()) {
                Some(handler) => {
                    trace!(kind = %failure.kind(), "Dispatching failure to handler.");
                    if let Err(e) = handler(failure) {
                        remainder.push(e);
                    }
                }
                None => remainder.push(failure),
            }
        }

        match ExceptionGroup::from_errors(remainder) {
            Some(group) => Err(group.into()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for GroupHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupHandler")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use cadence_error::generic_error;
    use similar_asserts::assert_eq;

    use super::*;

    const VALUE_ERROR: ErrorKind = ErrorKind::new("ValueError");
    const TYPE_ERROR: ErrorKind = ErrorKind::new("TypeError");

    fn value_error(msg: &'static str) -> TaskError {
        TaskError::application(VALUE_ERROR, generic_error!(msg))
    }

    fn type_error(msg: &'static str) -> TaskError {
        TaskError::application(TYPE_ERROR, generic_error!(msg))
    }

    fn messages(errors: &[TaskError]) -> Vec<String> {
        errors.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn empty_group_is_none() {
        assert!(ExceptionGroup::from_errors(Vec::new()).is_none());
    }

    #[test]
    fn partitions_by_kind_in_first_appearance_order() {
        let group = ExceptionGroup::from_errors([value_error("a"), type_error("b"), value_error("c")]).unwrap();

        assert_eq!(group.len(), 3);
        assert_eq!(group.kinds().collect::<Vec<_>>(), vec![VALUE_ERROR, TYPE_ERROR]);
        assert_eq!(messages(group.get(VALUE_ERROR)), vec!["ValueError: a", "ValueError: c"]);
        assert_eq!(group.count(TYPE_ERROR), 1);
        assert_eq!(group.count(ErrorKind::CANCELLED), 0);
        assert_eq!(group.to_string(), "3 concurrent failures (ValueError: 2, TypeError: 1)");
    }

    #[test]
    fn nested_groups_are_flattened() {
        let inner = ExceptionGroup::from_errors([value_error("a"), TaskError::TimedOut]).unwrap();
        let outer = ExceptionGroup::from_errors([inner.into(), value_error("b")]).unwrap();

        assert_eq!(outer.len(), 3);
        assert_eq!(outer.count(VALUE_ERROR), 2);
        assert_eq!(outer.count(ErrorKind::TIMED_OUT), 1);
        assert_eq!(outer.count(ErrorKind::GROUP), 0);
    }

    #[test]
    fn handler_leaves_unhandled_kinds_in_remainder() {
        let handled = Rc::new(Cell::new(0));
        let handled_count = Rc::clone(&handled);

        let group = ExceptionGroup::from_errors([value_error("a"), type_error("b"), value_error("c")]).unwrap();
        let result = GroupHandler::new()
            .handle_kind(VALUE_ERROR, move |_| {
                handled_count.set(handled_count.get() + 1);
                Ok(())
            })
            .handle(group.into());

        assert_eq!(handled.get(), 2);
        let remainder = result.unwrap_err();
        let remainder = remainder.as_group().unwrap();
        assert_eq!(remainder.len(), 1);
        assert_eq!(messages(remainder.get(TYPE_ERROR)), vec!["TypeError: b"]);
    }

    #[test]
    fn fully_handled_group_is_ok() {
        let group = ExceptionGroup::from_errors([value_error("a"), type_error("b")]).unwrap();
        let result = GroupHandler::new()
            .handle_kind(VALUE_ERROR, |_| Ok(()))
            .handle_kind(TYPE_ERROR, |_| Ok(()))
            .handle(group.into());
        assert!(result.is_ok());
    }

    #[test]
    fn failing_handler_joins_remainder() {
        let result = GroupHandler::new()
            .handle_kind(VALUE_ERROR, |_| Err(TaskError::TimedOut))
            .handle(value_error("a"));

        let remainder = result.unwrap_err();
        let remainder = remainder.as_group().unwrap();
        assert_eq!(remainder.kinds().collect::<Vec<_>>(), vec![ErrorKind::TIMED_OUT]);
    }

    #[test]
    fn single_unhandled_error_is_still_grouped() {
        let remainder = GroupHandler::new().handle(TaskError::Cancelled).unwrap_err();
        assert_eq!(remainder.kind(), ErrorKind::GROUP);
        assert_eq!(remainder.as_group().unwrap().count(ErrorKind::CANCELLED), 1);
    }
}
