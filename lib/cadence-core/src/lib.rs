//! A cooperative, single-threaded concurrency runtime.
//!
//! Tasks are plain Rust futures, driven one step at a time by a [`Scheduler`] until they complete or reach a
//! suspension point: yielding, sleeping until a deadline, or waiting on a [`Promise`]. Every task settles a promise
//! with its result, which is how tasks wait on each other, how failures propagate, and how [`TaskScope`]s and
//! [supervisors][supervisor] build on top of plain tasks.
//!
//! Work happening on other threads reports back through a [`Completer`], the only part of the runtime that can cross
//! threads.
#![deny(missing_docs)]

pub mod broadcast;
pub mod config;
pub mod error;
pub mod group;
pub mod promise;
pub mod queue;
pub mod scheduler;
pub mod supervisor;
pub mod task;
pub mod time;
pub mod timer;

pub use self::{
    broadcast::{Broker, Subscription},
    config::RuntimeConfiguration,
    error::{ErrorKind, RuntimeError, TaskError},
    group::{ExceptionGroup, GroupHandler, TaskScope},
    promise::Promise,
    scheduler::{inbox::Completer, Handle, RunReport, Scheduler},
    supervisor::{run_supervised, RetryPolicy, Supervisor},
    task::{sleep, suspend, suspend_value, timeout, yield_now, Suspension, TaskHandle, TaskId, TaskState},
    time::{Clock, MonotonicClock, VirtualClock},
};
