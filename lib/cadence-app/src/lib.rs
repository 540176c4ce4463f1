//! High-level application primitives.
//!
//! This crate provides the primitives needed to bootstrap a process that hosts Cadence schedulers, such as initializing
//! logging.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(feature = "logging")]
pub mod logging;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging};
}
