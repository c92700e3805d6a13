//! Per-sensor FIFO queues with drain prioritization.
//!
//! Every sensor gets its own unbounded queue plus the instant it was last
//! drained. [`PriorityQueueMap::select_next_drain_key`] picks the queue that
//! most urgently needs draining:
//!
//! 1. A queue not drained for longer than `max_age` wins over one that was;
//!    among two such queues the longer-waiting one wins.
//! 2. A queue holding more than `max_batch_size` events wins over one that
//!    does not; among two such queues the larger one wins, then the
//!    longer-waiting one.
//! 3. Otherwise the longer-waiting queue wins.
//!
//! Empty queues are never selected.

use eventcache_core::Event;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_millis(5000);

#[derive(Debug)]
pub struct PriorityQueueMap {
    queues: HashMap<String, VecDeque<Event>>,
    last_drained: HashMap<String, Instant>,
    max_batch_size: usize,
    max_age: Duration,
}

/// Ranking inputs of one queue at selection time.
struct Candidate<'a> {
    key: &'a str,
    age: Duration,
    size: usize,
}

impl Default for PriorityQueueMap {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_AGE)
    }
}

impl PriorityQueueMap {
    pub fn new(max_batch_size: usize, max_age: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            last_drained: HashMap::new(),
            max_batch_size,
            max_age,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Appends `event` to the queue of `key`.
    pub fn put(&mut self, key: &str, event: Event) {
        self.put_at(key, event, Instant::now());
    }

    pub fn put_at(&mut self, key: &str, event: Event, now: Instant) {
        match self.queues.get_mut(key) {
            Some(queue) => queue.push_back(event),
            None => {
                self.queues.insert(key.to_string(), VecDeque::from([event]));
                self.last_drained.entry(key.to_string()).or_insert(now);
            }
        }
    }

    /// The non-empty queue most in need of draining.
    pub fn select_next_drain_key(&self) -> Option<&str> {
        self.select_next_drain_key_at(Instant::now())
    }

    pub fn select_next_drain_key_at(&self, now: Instant) -> Option<&str> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(key, queue)| Candidate {
                key,
                age: self
                    .last_drained
                    .get(key)
                    .map(|drained| now.saturating_duration_since(*drained))
                    .unwrap_or_default(),
                size: queue.len(),
            })
            .min_by(|a, b| self.rank(a, b))
            .map(|candidate| candidate.key)
    }

    /// Orders `a` before `b` when `a` should be drained first.
    fn rank(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        let a_stale = a.age > self.max_age;
        let b_stale = b.age > self.max_age;
        if a_stale || b_stale {
            return match (a_stale, b_stale) {
                (true, true) => b.age.cmp(&a.age),
                (true, false) => Ordering::Less,
                _ => Ordering::Greater,
            };
        }

        let a_full = a.size > self.max_batch_size;
        let b_full = b.size > self.max_batch_size;
        match (a_full, b_full) {
            (true, true) => b.size.cmp(&a.size).then_with(|| b.age.cmp(&a.age)),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => b.age.cmp(&a.age),
        }
    }

    /// Removes up to `max` events from the front of the queue of `key` and
    /// records the drain.
    pub fn drain(&mut self, key: &str, max: usize) -> Vec<Event> {
        self.drain_at(key, max, Instant::now())
    }

    pub fn drain_at(&mut self, key: &str, max: usize, now: Instant) -> Vec<Event> {
        let Some(queue) = self.queues.get_mut(key) else {
            return Vec::new();
        };
        let count = max.min(queue.len());
        let events = queue.drain(..count).collect();
        self.last_drained.insert(key.to_string(), now);
        events
    }

    /// Selects the most urgent queue and drains up to `max_batch_size` events
    /// from it.
    pub fn drain_next(&mut self) -> Vec<Event> {
        self.drain_next_at(Instant::now())
    }

    pub fn drain_next_at(&mut self, now: Instant) -> Vec<Event> {
        match self.select_next_drain_key_at(now).map(str::to_string) {
            Some(key) => self.drain_at(&key, self.max_batch_size, now),
            None => Vec::new(),
        }
    }

    /// Events waiting across all queues.
    pub fn total_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn queue_len(&self, key: &str) -> usize {
        self.queues.get(key).map_or(0, VecDeque::len)
    }

    /// Number of known keys, including those with empty queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Forgets `key` together with its drain history.
    pub fn remove(&mut self, key: &str) -> Vec<Event> {
        self.last_drained.remove(key);
        self.queues
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn reset(&mut self) {
        self.queues.clear();
        self.last_drained.clear();
    }
}
