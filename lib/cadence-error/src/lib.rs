//! Error primitives shared across the Cadence workspace.
//!
//! Application code running inside tasks fails with arbitrary errors. Those are carried as [`GenericError`], and once
//! they need to be observed by more than one party (every waiter on a promise gets its own copy of a failure) they are
//! wrapped in a [`SharedError`].
#![deny(warnings)]
#![deny(missing_docs)]

use std::{fmt, sync::Arc};

/// A type-erased error.
pub type GenericError = anyhow::Error;

/// Macro for constructing a generic error.
///
/// Accepts a string literal, a format string followed by its arguments (same order as `std::format!`), or any value
/// implementing both `Debug` and `Display`. When the value is an existing `std::error::Error`, its source chain is
/// preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

// NOTE: Wrapping `anyhow::Context` keeps these extension methods from colliding with `snafu::ResultExt` in modules that
// import both.
/// Extension trait for attaching context to fallible results.
pub trait ErrorContext<T, E>: private::Sealed {
    /// Wraps the error value with additional context.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: fmt::Display + Send + Sync + 'static;

    /// Wraps the error value with additional context that is only evaluated once an error actually occurs.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        <Self as anyhow::Context<T, E>>::context(self, context)
    }

    fn with_error_context<C, F>(self, context: F) -> Result<T, GenericError>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        <Self as anyhow::Context<T, E>>::with_context(self, context)
    }
}

/// A cheaply cloneable, thread-safe wrapper around a [`GenericError`].
///
/// Clones share the same underlying error, so identity can be checked with [`SharedError::ptr_eq`].
#[derive(Clone)]
pub struct SharedError(Arc<GenericError>);

impl SharedError {
    /// Returns a reference to the wrapped error.
    pub fn inner(&self) -> &GenericError {
        &self.0
    }

    /// Returns `true` if both values wrap the same underlying error.
    pub fn ptr_eq(&self, other: &SharedError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Attempts to downcast the wrapped error to a concrete error type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl From<GenericError> for SharedError {
    fn from(e: GenericError) -> Self {
        Self(Arc::new(e))
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Alternate formatting renders the full cause chain, which is what we want in log output.
        write!(f, "{:#}", &*self.0)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_error_macro_forms() {
        let literal = generic_error!("queue is empty");
        assert_eq!(literal.to_string(), "queue is empty");

        let formatted = generic_error!("task {} failed after {} attempts", 7, 3);
        assert_eq!(formatted.to_string(), "task 7 failed after 3 attempts");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let wrapped = generic_error!(io);
        assert_eq!(wrapped.to_string(), "disk on fire");
    }

    #[test]
    fn error_context_wraps_source() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(std::io::ErrorKind::Other, "root"));
        let err = result.error_context("Failed to read state.").unwrap_err();
        assert_eq!(err.to_string(), "Failed to read state.");
        assert_eq!(err.root_cause().to_string(), "root");
    }

    #[test]
    fn shared_error_clones_share_identity() {
        let shared = SharedError::from(generic_error!("boom"));
        let clone = shared.clone();
        assert!(shared.ptr_eq(&clone));
        assert!(!shared.ptr_eq(&SharedError::from(generic_error!("boom"))));
        assert_eq!(clone.to_string(), "boom");
    }

    #[test]
    fn shared_error_display_includes_chain() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(std::io::ErrorKind::Other, "socket closed"));
        let shared = SharedError::from(result.error_context("Failed to flush.").unwrap_err());
        assert_eq!(shared.to_string(), "Failed to flush.: socket closed");
        assert!(shared.downcast_ref::<std::io::Error>().is_some());
    }
}
