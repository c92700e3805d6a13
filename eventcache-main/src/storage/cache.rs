use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Rate limiter for cache pruning.
///
/// Holds the instant the next pruning pass becomes due. Claiming a due pass
/// advances that instant past `now` in one atomic step, so concurrent writers
/// never prune twice for the same interval.
#[derive(Debug)]
pub struct CleanupSchedule {
    next_due_millis: AtomicI64,
    interval_millis: i64,
}

impl CleanupSchedule {
    /// First pass becomes due one `interval` from now.
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Utc::now() + interval, interval)
    }

    pub fn starting_at(first_due: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            next_due_millis: AtomicI64::new(first_due.timestamp_millis()),
            interval_millis: interval.num_milliseconds().max(1),
        }
    }

    pub fn next_due(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.next_due_millis.load(Ordering::Acquire))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns true if a pass is due at `now` and this caller won it.
    ///
    /// The due instant moves forward by every whole interval that elapsed
    /// since it passed, plus one.
    pub fn try_claim(&self, now: DateTime<Utc>) -> bool {
        let now = now.timestamp_millis();
        let interval = self.interval_millis;
        self.next_due_millis
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |due| {
                (now > due).then(|| due + ((now - due) / interval + 1) * interval)
            })
            .is_ok()
    }
}
