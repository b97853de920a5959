//! Clock abstraction for entity timestamps.
//!
//! Sort keys embed `created_at` and `joined_at`, so every timestamp the ledger
//! assigns is truncated to microseconds (the precision of the key format) and,
//! in production, drawn from a clock that never repeats or goes backwards.

use chrono::{DateTime, Duration, Timelike, Utc};
use std::sync::{Arc, Mutex};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Source of entity timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Drop sub-microsecond precision.
pub fn truncate_to_micros(ts: Timestamp) -> Timestamp {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000).unwrap_or(ts)
}

/// Production clock using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        truncate_to_micros(Utc::now())
    }
}

/// Wraps another clock so that successive readings strictly increase.
///
/// If the inner clock stalls or steps backwards the reading is bumped one
/// microsecond past the previous one.
#[derive(Debug, Default)]
pub struct MonotonicClock<C = SystemClock> {
    inner: C,
    last: Mutex<Option<Timestamp>>,
}

impl<C: Clock> MonotonicClock<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            last: Mutex::new(None),
        }
    }
}

impl<C: Clock> Clock for MonotonicClock<C> {
    fn now(&self) -> Timestamp {
        let mut reading = truncate_to_micros(self.inner.now());
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = *last {
            if reading <= prev {
                reading = prev + Duration::microseconds(1);
            }
        }
        *last = Some(reading);
        reading
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same current time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(Mutex::new(truncate_to_micros(start))),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = truncate_to_micros(ts);
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current = truncate_to_micros(*current + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}
