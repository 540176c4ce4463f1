use std::{
    future::{poll_fn, Future as _},
    pin::pin,
    task::Poll,
    time::Duration,
};

use tracing::debug;

use super::{sleep_until, TaskHandle};
use crate::{error::TaskError, scheduler::Handle};

enum Race<T> {
    Completed(Result<T, TaskError>),
    Elapsed(Result<(), TaskError>),
}

/// Waits for `task` to complete, for at most `duration`.
///
/// The task's promise is raced against a timer entry on the current scheduler. If the task completes first, the timer
/// entry is removed and the task's result is returned. If the timer fires first, the task is cancelled and
/// [`TaskError::TimedOut`] is returned.
///
/// # Errors
///
/// Besides the task's own error and `TimedOut`, fails with a runtime error if called outside of a task.
pub async fn timeout<T>(duration: Duration, task: &TaskHandle<T>) -> Result<T, TaskError>
where
    T: Clone + 'static,
{
    let handle = Handle::current()?;
    let deadline = handle.now() + duration;

    let mut completion = pin!(task.join());
    let mut elapsed = pin!(sleep_until(deadline));

    let race = poll_fn(|cx| {
        if let Poll::Ready(result) = completion.as_mut().poll(cx) {
            return Poll::Ready(Race::Completed(result));
        }
        if let Poll::Ready(result) = elapsed.as_mut().poll(cx) {
            return Poll::Ready(Race::Elapsed(result));
        }
        Poll::Pending
    })
    .await;

    match race {
        Race::Completed(result) => result,
        Race::Elapsed(Ok(())) => {
            debug!(task_id = %task.id(), timeout = ?duration, "Task timed out. Cancelling.");
            task.cancel();
            Err(TaskError::TimedOut)
        }
        // The awaiting task itself was cancelled while racing.
        Race::Elapsed(Err(e)) => Err(e),
    }
}
