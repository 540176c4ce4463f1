use std::{cell::RefCell, fmt, rc::Rc, time::Duration};

use rand::{rngs::StdRng, Rng as _, SeedableRng as _};

/// A strategy for spacing out retry attempts.
pub trait Backoff {
    /// Returns how long to wait before the next attempt, given the number of consecutive failures so far.
    ///
    /// The first retry is made after a single failure, so `failures` is always at least one when called by a
    /// supervisor.
    fn backoff_duration(&mut self, failures: u32) -> Duration;
}

#[derive(Clone)]
enum BackoffRng {
    /// The thread-local generator, seeded by the operating system.
    Thread,

    /// A deterministic generator, shared by every clone of the backoff.
    Seeded(Rc<RefCell<StdRng>>),
}

impl BackoffRng {
    fn jitter(&self, lower: Duration, upper: Duration) -> Duration {
        match self {
            Self::Thread => rand::rng().random_range(lower..=upper),
            Self::Seeded(rng) => rng.borrow_mut().random_range(lower..=upper),
        }
    }
}

impl fmt::Debug for BackoffRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => f.write_str("Thread"),
            Self::Seeded(_) => f.write_str("Seeded"),
        }
    }
}

/// An exponential backoff strategy.
///
/// Durations double with every failure, starting from the minimum backoff and never exceeding the maximum backoff.
/// Jitter can be applied to keep callers that failed at the same time from retrying at the same time.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    min_backoff: Duration,
    max_backoff: Duration,
    min_backoff_factor: f64,
    rng: BackoffRng,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given minimum and maximum backoff durations, without jitter.
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            min_backoff_factor: 1.0,
            rng: BackoffRng::Thread,
        }
    }

    /// Creates a new `ExponentialBackoff` with the given minimum and maximum backoff durations, and minimum backoff
    /// factor.
    ///
    /// Jitter spreads each calculated duration `D` over `[D/min_backoff_factor, D]`. A factor of 1.0 or less disables
    /// jitter. Once the exponential duration reaches the maximum backoff, the maximum is used as-is.
    ///
    /// With a minimum backoff of 10ms and a factor of 2.0, the second failure waits 20ms without jitter, and anywhere
    /// between 10ms and 20ms with it.
    pub fn with_jitter(min_backoff: Duration, max_backoff: Duration, min_backoff_factor: f64) -> Self {
        Self {
            min_backoff_factor: min_backoff_factor.max(1.0),
            ..Self::new(min_backoff, max_backoff)
        }
    }

    /// Seeds the random number generator used for jitter, making backoff durations reproducible.
    ///
    /// Clones share the seeded generator. Defaults to the thread-local generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = BackoffRng::Seeded(Rc::new(RefCell::new(StdRng::seed_from_u64(seed))));
        self
    }

    /// Returns the minimum backoff duration.
    pub fn min_backoff(&self) -> Duration {
        self.min_backoff
    }

    /// Returns the maximum backoff duration.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Calculates the backoff duration for the given error count.
    ///
    /// An error count of zero yields the minimum backoff, and every additional error doubles it.
    pub fn get_backoff_duration(&mut self, error_count: u32) -> Duration {
        let backoff = 2u32
            .checked_pow(error_count)
            .and_then(|factor| self.min_backoff.checked_mul(factor))
            .filter(|backoff| *backoff < self.max_backoff);

        let Some(backoff) = backoff else {
            return self.max_backoff;
        };

        let backoff = if self.min_backoff_factor > 1.0 {
            self.rng.jitter(backoff.div_f64(self.min_backoff_factor), backoff)
        } else {
            backoff
        };

        backoff.clamp(self.min_backoff, self.max_backoff)
    }
}

impl Backoff for ExponentialBackoff {
    fn backoff_duration(&mut self, failures: u32) -> Duration {
        self.get_backoff_duration(failures.saturating_sub(1))
    }
}

/// A backoff strategy that always waits the same amount of time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FixedBackoff(Duration);

impl FixedBackoff {
    /// Creates a new `FixedBackoff` that waits `delay` between attempts.
    pub const fn new(delay: Duration) -> Self {
        Self(delay)
    }
}

impl Backoff for FixedBackoff {
    fn backoff_duration(&mut self, _failures: u32) -> Duration {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_exponential_backoff(min_backoff_factor: f64) -> impl Strategy<Value = ExponentialBackoff> {
        (1u64..=u64::MAX / 2, 0u64..u64::MAX / 2, any::<u64>()).prop_map(move |(min_backoff, extra, seed)| {
            ExponentialBackoff::with_jitter(
                Duration::from_nanos(min_backoff),
                Duration::from_nanos(min_backoff + extra),
                min_backoff_factor,
            )
            .with_seed(seed)
        })
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100));
        let durations: Vec<u64> = (0..6)
            .map(|count| backoff.get_backoff_duration(count).as_millis() as u64)
            .collect();
        assert_eq!(durations, vec![10, 20, 40, 80, 100, 100]);
    }

    #[test]
    fn first_retry_waits_minimum() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(backoff.backoff_duration(1), Duration::from_millis(10));
        assert_eq!(backoff.backoff_duration(2), Duration::from_millis(20));
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let make =
            || ExponentialBackoff::with_jitter(Duration::from_millis(10), Duration::from_secs(10), 2.0).with_seed(42);
        let (mut a, mut b) = (make(), make());
        for count in 0..8 {
            let duration = a.get_backoff_duration(count);
            assert_eq!(duration, b.get_backoff_duration(count));
            assert!(duration >= Duration::from_millis(10));
        }
    }

    #[test]
    fn fixed_backoff_never_changes() {
        let mut backoff = FixedBackoff::new(Duration::from_millis(25));
        assert_eq!(backoff.backoff_duration(1), Duration::from_millis(25));
        assert_eq!(backoff.backoff_duration(50), Duration::from_millis(25));
    }

    proptest! {
        #[test]
        fn property_test_exponential_backoff_no_jitter(
            mut backoff in arb_exponential_backoff(1.0),
            error_count in 0..u32::MAX,
            error_count_increase in 1..5u32
        ) {
            // Durations never shrink as the error count grows, and always stay within bounds.
            let first = backoff.get_backoff_duration(error_count);
            let first_followup = backoff.get_backoff_duration(error_count);
            let second = backoff.get_backoff_duration(error_count.saturating_add(error_count_increase));

            prop_assert_eq!(first, first_followup);
            prop_assert!(first <= second);
            prop_assert!(first >= backoff.min_backoff() && first <= backoff.max_backoff());
            prop_assert!(second >= backoff.min_backoff() && second <= backoff.max_backoff());
        }

        #[test]
        fn property_test_exponential_backoff_default_jitter(
            mut backoff in arb_exponential_backoff(2.0),
            error_count in 0..64u32,
            error_count_increase in 1..5u32
        ) {
            let first = backoff.get_backoff_duration(error_count);
            let second = backoff.get_backoff_duration(error_count.saturating_add(error_count_increase));

            prop_assert!(first <= second);
            prop_assert!(first >= backoff.min_backoff() && first <= backoff.max_backoff());
            prop_assert!(second >= backoff.min_backoff() && second <= backoff.max_backoff());
        }
    }
}
