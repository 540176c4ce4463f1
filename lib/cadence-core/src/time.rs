//! Clocks.
//!
//! The scheduler never reads the system time directly. Everything time-related (timer deadlines, `sleep`, timeouts)
//! goes through a [`Clock`], so tests can swap in a [`VirtualClock`] that jumps straight to the next deadline instead
//! of actually waiting.
use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, Instant},
};

/// A monotonic time source.
pub trait Clock {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Blocks until `deadline` has been reached.
    ///
    /// Returns immediately if the deadline is already in the past.
    fn sleep_until(&self, deadline: Instant);
}

/// A clock backed by the operating system's monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
    }
}

/// A deterministic clock that only moves when told to.
///
/// Sleeping advances the clock to the deadline instantly. Clones share the same underlying time, so a test can keep a
/// clone around to inspect or advance the time seen by a scheduler.
#[derive(Clone, Debug)]
pub struct VirtualClock {
    now: Rc<Cell<Instant>>,
}

impl VirtualClock {
    /// Creates a new virtual clock, starting at the current instant.
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    /// Advances the clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep_until(&self, deadline: Instant) {
        if deadline > self.now.get() {
            self.now.set(deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_only_moves_forward() {
        let clock = VirtualClock::new();
        let start = clock.now();

        clock.sleep_until(start + Duration::from_millis(100));
        assert_eq!(clock.now() - start, Duration::from_millis(100));

        // Sleeping until a past instant is a no-op.
        clock.sleep_until(start);
        assert_eq!(clock.now() - start, Duration::from_millis(100));

        let shared = clock.clone();
        shared.advance(Duration::from_millis(5));
        assert_eq!(clock.now() - start, Duration::from_millis(105));
    }

    #[test]
    fn monotonic_clock_sleeps() {
        let clock = MonotonicClock;
        let start = clock.now();
        clock.sleep_until(start + Duration::from_millis(5));
        assert!(clock.now() - start >= Duration::from_millis(5));
    }
}
