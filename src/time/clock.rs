use std::sync::Mutex;
use chrono::{DateTime, Duration, FixedOffset, Local, Offset, Utc};

use super::codec::{self, DayKey};

/// Source of "now" and of the observer's calendar.
///
/// Day keys and midnights are computed by the clock so that a service always
/// evaluates them in the timezone that is current at evaluation time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn day_key(&self, at: DateTime<Utc>) -> DayKey;

    fn next_midnight(&self, at: DateTime<Utc>) -> DateTime<Utc>;

    fn today(&self) -> DayKey {
        self.day_key(self.now())
    }
}

/// Wall clock in the machine's local timezone
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn day_key(&self, at: DateTime<Utc>) -> DayKey {
        codec::day_key_in(at, &Local)
    }

    fn next_midnight(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        codec::next_midnight_in(at, &Local)
    }
}

/// Settable clock with a fixed UTC offset, used by tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_offset(now, Utc.fix())
    }

    pub fn with_offset(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self {
            now: Mutex::new(now),
            offset,
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn day_key(&self, at: DateTime<Utc>) -> DayKey {
        codec::day_key_in(at, &self.offset)
    }

    fn next_midnight(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        codec::next_midnight_in(at, &self.offset)
    }
}
