//! Idle-expiry index for the connection reaper.
//!
//! [`TimeoutCache`] maps connection ids to absolute expiry times (whole
//! seconds on a monotonic clock) and yields the earliest expirer in
//! `O(log n)`. Renewing or overriding an entry does not eagerly remove
//! the old heap slot; stale slots are discarded lazily during
//! [`extract`](TimeoutCache::extract). Ties are broken by insertion
//! order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Monotonic whole-second clock shared by the server and its connections.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// Create a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since the clock was created.
    #[must_use]
    pub fn now_secs(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Earliest-expiry index keyed by connection id.
#[derive(Debug)]
pub struct TimeoutCache {
    /// Configured idle timeout, in whole seconds (at least 1).
    timeout: u64,
    /// Current deadline and heap slot generation per live id.
    deadlines: HashMap<u64, (u64, u64)>,
    /// Min-heap of (expiry, generation, id); stale slots linger until
    /// extraction.
    queue: BinaryHeap<Reverse<(u64, u64, u64)>>,
    next_generation: u64,
}

impl TimeoutCache {
    /// Create a cache with the given idle timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout: timeout.as_secs().max(1),
            deadlines: HashMap::new(),
            queue: BinaryHeap::new(),
            next_generation: 0,
        }
    }

    /// Set `id` to expire one idle timeout from `now`.
    pub fn renew(&mut self, id: u64, now: u64) {
        self.update(id, now + self.timeout);
    }

    /// Override the expiry of `id`.
    pub fn update(&mut self, id: u64, expiry: u64) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.deadlines.insert(id, (expiry, generation));
        self.queue.push(Reverse((expiry, generation, id)));
    }

    /// Remove `id` from the index. The heap slot is discarded lazily.
    pub fn clear(&mut self, id: u64) {
        self.deadlines.remove(&id);
    }

    /// Remove and return one id whose expiry is at or before `now`, or
    /// `None` if nothing has expired. Earliest expiry first; equal
    /// expiries come out in insertion order.
    pub fn extract(&mut self, now: u64) -> Option<u64> {
        while let Some(&Reverse((expiry, generation, id))) = self.queue.peek() {
            match self.deadlines.get(&id) {
                Some(&(current_expiry, current_generation))
                    if current_expiry == expiry && current_generation == generation =>
                {
                    if expiry > now {
                        return None;
                    }
                    self.queue.pop();
                    self.deadlines.remove(&id);
                    return Some(id);
                }
                // Renewed, overridden, or cleared since this slot was pushed.
                _ => {
                    self.queue.pop();
                }
            }
        }
        None
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Returns `true` if no entries are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Returns the current deadline for `id`, if live.
    #[must_use]
    pub fn deadline(&self, id: u64) -> Option<u64> {
        self.deadlines.get(&id).map(|&(expiry, _)| expiry)
    }
}
