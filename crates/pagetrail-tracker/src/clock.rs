//! Dwell-time measurement

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Leave payloads at or above this many seconds are dropped.
pub const MAX_LEAVE_SECS: u64 = 3600;

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Start time of the current logical page view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionClock {
    page_start: Option<i64>,
}

impl SessionClock {
    pub fn reset(&mut self, now_ms: i64) {
        self.page_start = Some(now_ms);
    }

    pub fn page_start(&self) -> Option<i64> {
        self.page_start
    }

    /// Whole seconds spent on the page, if within `(0, MAX_LEAVE_SECS)`.
    pub fn leave_duration(&self, now_ms: i64) -> Option<u64> {
        let start = self.page_start?;
        let secs = (now_ms.saturating_sub(start) as f64 / 1000.0).round();

        if secs > 0.0 && secs < MAX_LEAVE_SECS as f64 {
            Some(secs as u64)
        } else {
            None
        }
    }
}
