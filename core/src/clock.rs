use parking_lot::Mutex;
use std::time::Duration;
use time::OffsetDateTime;

/// Source of wall-clock time for the time-sensitive engines.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    /// Unix time in fractional seconds.
    fn unix_seconds(&self) -> f64 {
        self.now().unix_timestamp_nanos() as f64 / 1e9
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}
