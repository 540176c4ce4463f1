//! Timer queue.
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crate::task::TaskId;

/// Position of an entry in a [`TimerQueue`].
///
/// Keys order by deadline first and insertion sequence second, which is exactly the order entries fire in.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TimerKey {
    deadline: Instant,
    seq: u64,
}

/// A scheduled wake-up for a suspended task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimerEntry {
    /// When the entry fires.
    pub deadline: Instant,

    /// Insertion sequence number, breaking ties between equal deadlines.
    pub seq: u64,

    /// Task to wake.
    pub task: TaskId,

    /// Resume epoch of the task when the entry was scheduled.
    pub epoch: u64,
}

impl TimerEntry {
    /// Returns the key of this entry.
    pub fn key(&self) -> TimerKey {
        TimerKey {
            deadline: self.deadline,
            seq: self.seq,
        }
    }
}

/// Deadline-ordered queue of timer entries.
///
/// Entries fire in ascending deadline order, and in insertion order among entries with equal deadlines. A fired or
/// cancelled entry is removed from the queue, so it can only ever be returned once.
#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<TimerKey, TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    /// Creates an empty timer queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `task` to be woken at `deadline`.
    pub fn schedule_at(&mut self, deadline: Instant, task: TaskId, epoch: u64) -> TimerKey {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = TimerEntry {
            deadline,
            seq,
            task,
            epoch,
        };
        let key = entry.key();
        self.entries.insert(key, entry);
        key
    }

    /// Schedules `task` to be woken once `duration` has elapsed from `now`.
    pub fn schedule_after(&mut self, now: Instant, duration: Duration, task: TaskId, epoch: u64) -> TimerKey {
        self.schedule_at(now + duration, task, epoch)
    }

    /// Removes a scheduled entry, returning it if it had not yet fired.
    pub fn cancel(&mut self, key: TimerKey) -> Option<TimerEntry> {
        self.entries.remove(&key)
    }

    /// Removes and returns every entry whose deadline is at or before `now`, in firing order.
    pub fn poll_due(&mut self, now: Instant) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().deadline > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// Returns the earliest deadline in the queue.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first_key_value().map(|(key, _)| key.deadline)
    }

    /// Returns the number of scheduled entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every scheduled entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn task(raw: u64) -> TaskId {
        TaskId::from_raw(raw)
    }

    #[test]
    fn fires_in_deadline_order() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule_after(start, Duration::from_millis(30), task(1), 0);
        timers.schedule_after(start, Duration::from_millis(10), task(2), 0);
        timers.schedule_after(start, Duration::from_millis(20), task(3), 0);

        assert_eq!(timers.next_deadline(), Some(start + Duration::from_millis(10)));
        assert!(timers.poll_due(start).is_empty());

        let due = timers.poll_due(start + Duration::from_millis(20));
        let fired: Vec<u64> = due.iter().map(|entry| entry.task.as_u64()).collect();
        assert_eq!(fired, vec![2, 3]);
        assert_eq!(timers.len(), 1);

        let due = timers.poll_due(start + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert!(timers.is_empty());
        assert!(timers.poll_due(start + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn cancelled_entries_never_fire() {
        let start = Instant::now();
        let mut timers = TimerQueue::new();
        let first = timers.schedule_at(start, task(1), 0);
        timers.schedule_at(start, task(2), 0);

        assert_eq!(timers.cancel(first).map(|entry| entry.task), Some(task(1)));
        assert_eq!(timers.cancel(first), None);

        let due = timers.poll_due(start);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task, task(2));
    }

    proptest! {
        #[test]
        fn property_test_due_entries_are_ordered(offsets in proptest::collection::vec(0u64..50, 1..64), cutoff in 0u64..60) {
            // Deadlines are drawn from a small range so that ties are common.
            let start = Instant::now();
            let mut timers = TimerQueue::new();
            for (i, offset) in offsets.iter().enumerate() {
                timers.schedule_after(start, Duration::from_millis(*offset), task(i as u64), 0);
            }

            let due = timers.poll_due(start + Duration::from_millis(cutoff));
            let expected_due = offsets.iter().filter(|offset| **offset <= cutoff).count();
            prop_assert_eq!(due.len(), expected_due);
            prop_assert_eq!(timers.len(), offsets.len() - expected_due);

            for pair in due.windows(2) {
                prop_assert!(pair[0].deadline <= pair[1].deadline);
                if pair[0].deadline == pair[1].deadline {
                    // Tasks were numbered in insertion order.
                    prop_assert!(pair[0].task < pair[1].task);
                }
            }

            if let Some(next) = timers.next_deadline() {
                prop_assert!(next > start + Duration::from_millis(cutoff));
            }
        }
    }
}
