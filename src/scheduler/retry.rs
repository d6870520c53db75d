//! Exponential-backoff retry policy and the delay queue holding pending retries.
//!
//! A failed attempt is not slept on. The supervisor computes the retry's
//! ready time from the [`RetryPolicy`] and parks the next attempt in a
//! [`DelayQueue`]; each polling tick releases whatever has come due back into
//! the job queue.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Upper bound on a single retry delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(3600);

/// Retry ceiling and backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on every further retry.
    pub base_delay: Duration,
    /// Ceiling applied to the computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Returns true if a job that has used `retry_count` retries gets another.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Retries left for a job that has used `retry_count`.
    pub fn remaining_retries(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }

    /// Delay before retrying a job that has used `retry_count` retries:
    /// `base_delay * 2^retry_count`, capped at `max_delay`.
    ///
    /// Delays strictly increase up to the retry ceiling only when
    /// [`RetryPolicy::fits_ceiling`] holds.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.uncapped_delay(retry_count)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `base_delay * 2^retry_count`, or `None` on overflow.
    pub fn uncapped_delay(&self, retry_count: u32) -> Option<Duration> {
        let factor = 1u32.checked_shl(retry_count)?;
        self.base_delay.checked_mul(factor)
    }

    /// True if every retry up to the ceiling gets a non-zero delay longer
    /// than the previous one, i.e. `max_delay` never flattens the schedule.
    pub fn fits_ceiling(&self) -> bool {
        if self.base_delay.is_zero() {
            return false;
        }
        match self.max_retries.checked_sub(1) {
            None => true,
            Some(last) => self
                .uncapped_delay(last)
                .is_some_and(|peak| peak <= self.max_delay),
        }
    }
}

struct Entry<T> {
    ready_at: DateTime<Utc>,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Items parked until a ready time, released in ready order (insertion order
/// for equal times).
pub struct DelayQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks `item` until `ready_at`.
    pub fn push(&mut self, ready_at: DateTime<Utc>, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { ready_at, seq, item }));
    }

    /// Removes and returns every item whose ready time is at or before `now`.
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Vec<T> {
        let mut ready = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.ready_at <= now)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                ready.push(entry.item);
            }
        }
        ready
    }

    /// Earliest pending ready time.
    pub fn next_ready_at(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(entry)| entry.ready_at)
    }

    /// Removes every pending item regardless of ready time.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut entries: Vec<Entry<T>> = self.heap.drain().map(|Reverse(e)| e).collect();
        entries.sort();
        entries.into_iter().map(|e| e.item).collect()
    }

    /// Iterates over pending items in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().map(|Reverse(entry)| &entry.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert_eq!(policy.remaining_retries(1), 2);
        assert_eq!(policy.remaining_retries(7), 0);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_strictly_increases_until_ceiling() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100)).with_max_delay(Duration::from_secs(60));
        assert!(policy.fits_ceiling());

        let delays: Vec<Duration> = (0..policy.max_retries).map(|n| policy.delay_for(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0], "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert_eq!(delays[9], Duration::from_millis(51_200));
    }

    #[test]
    fn test_fits_ceiling() {
        // 5s * 2^9 overshoots a 60s cap.
        let capped = RetryPolicy::new(10, Duration::from_secs(5)).with_max_delay(Duration::from_secs(60));
        assert!(!capped.fits_ceiling());

        let exact = RetryPolicy::new(4, Duration::from_secs(5)).with_max_delay(Duration::from_secs(40));
        assert!(exact.fits_ceiling());

        assert!(!RetryPolicy::new(3, Duration::ZERO).fits_ceiling());
        assert!(!RetryPolicy::new(40, Duration::from_secs(5)).fits_ceiling());
        assert!(RetryPolicy::new(0, Duration::from_secs(5)).fits_ceiling());
        assert!(RetryPolicy::default().fits_ceiling());
    }

    #[test]
    fn test_delay_queue_releases_in_order() {
        let now = Utc::now();
        let mut queue = DelayQueue::new();
        queue.push(now + chrono::Duration::seconds(10), "late");
        queue.push(now + chrono::Duration::seconds(1), "early");
        queue.push(now + chrono::Duration::seconds(1), "early-2");

        assert!(queue.pop_ready(now).is_empty());
        assert_eq!(queue.next_ready_at(), Some(now + chrono::Duration::seconds(1)));

        let ready = queue.pop_ready(now + chrono::Duration::seconds(5));
        assert_eq!(ready, vec!["early", "early-2"]);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.drain_all(), vec!["late"]);
        assert!(queue.is_empty());
    }
}
