//! Epoch & Counter State
//!
//! An `EpochCounter` only exists in the active state: it is created with a
//! random epoch and a zero counter, and is discarded with its instance.
//! Counter values are issued under a mutex so that each value is handed out
//! once, without gaps, in the order calls complete.

use crate::error::{Result, UsigError};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Counter value before the first identifier is issued
pub const INITIAL_COUNTER: u64 = 0;

#[derive(Debug)]
pub struct EpochCounter {
    epoch: u64,
    last: Mutex<u64>,
}

impl EpochCounter {
    /// Enter the active state with a uniformly random epoch
    pub fn activate() -> Self {
        Self::with_epoch(rand::random())
    }

    pub(crate) fn with_epoch(epoch: u64) -> Self {
        Self::starting_at(epoch, INITIAL_COUNTER)
    }

    pub(crate) fn starting_at(epoch: u64, last: u64) -> Self {
        Self {
            epoch,
            last: Mutex::new(last),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Last value handed out (or [`INITIAL_COUNTER`] if none)
    pub fn last_issued(&self) -> u64 {
        *self.lock()
    }

    /// Reserve and return the next counter value
    pub fn next_counter(&self) -> Result<u64> {
        self.issue(|_| Ok(())).map(|(counter, ())| counter)
    }

    /// Run `stamp` with the next counter value and commit it on success
    ///
    /// The counter lock is held across `stamp`, so concurrent callers are
    /// serialized and a failed stamp leaves the counter untouched. At
    /// `u64::MAX` the counter refuses to advance rather than wrap.
    pub fn issue<T, F>(&self, stamp: F) -> Result<(u64, T)>
    where
        F: FnOnce(u64) -> Result<T>,
    {
        let mut last = self.lock();
        let next = last.checked_add(1).ok_or(UsigError::CounterExhausted)?;
        let stamped = stamp(next)?;
        *last = next;
        Ok((next, stamped))
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequential_counters() {
        let counter = EpochCounter::with_epoch(99);
        for expected in 1..=100 {
            assert_eq!(counter.next_counter().unwrap(), expected);
        }
        assert_eq!(counter.last_issued(), 100);
        assert_eq!(counter.epoch(), 99);
    }

    #[test]
    fn test_failed_stamp_does_not_advance() {
        let counter = EpochCounter::with_epoch(1);
        assert_eq!(counter.next_counter().unwrap(), 1);

        let result: Result<(u64, ())> =
            counter.issue(|_| Err(UsigError::SigningFailure("boom".into())));
        assert!(matches!(result, Err(UsigError::SigningFailure(_))));

        assert_eq!(counter.next_counter().unwrap(), 2);
    }

    #[test]
    fn test_exhaustion_refuses_instead_of_wrapping() {
        let counter = EpochCounter::starting_at(5, u64::MAX - 1);
        assert_eq!(counter.next_counter().unwrap(), u64::MAX);
        assert!(matches!(counter.next_counter(), Err(UsigError::CounterExhausted)));
        assert!(matches!(counter.next_counter(), Err(UsigError::CounterExhausted)));
        assert_eq!(counter.last_issued(), u64::MAX);
    }

    #[test]
    fn test_concurrent_counters_are_gapless() {
        let counter = Arc::new(EpochCounter::activate());
        let threads = 8;
        let per_thread = 500;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    (0..per_thread)
                        .map(|_| counter.next_counter().unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let values = handle.join().unwrap();
            // Each caller observes its own values in increasing order
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            for v in values {
                assert!(seen.insert(v), "counter {} issued twice", v);
            }
        }

        let total = (threads * per_thread) as u64;
        assert_eq!(seen.len() as u64, total);
        assert!((1..=total).all(|v| seen.contains(&v)));
        assert_eq!(counter.last_issued(), total);
    }

    #[test]
    fn test_completion_order_matches_counter_order() {
        let counter = Arc::new(EpochCounter::with_epoch(3));
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..200 {
                        counter
                            .issue(|value| {
                                log.lock().unwrap().push(value);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let log = log.lock().unwrap();
        let expected: Vec<u64> = (1..=800).collect();
        assert_eq!(*log, expected);
    }

    #[test]
    fn test_epochs_are_random() {
        let epochs: HashSet<u64> = (0..1000).map(|_| EpochCounter::activate().epoch()).collect();
        assert!(epochs.len() >= 999);
    }
}
