// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clock abstraction for testable time handling.
//!
//! The dispatcher stamps its ownership claims with its start time and
//! paces several bounded polls; both go through [`Clock`] so tests can
//! drive them deterministically.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A clock that provides the current time
pub trait Clock: Clone + Send + Sync {
    fn now(&self) -> Instant;
    fn epoch_ms(&self) -> u64;
}

/// Real system clock
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn epoch_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Render an epoch timestamp as the dispatcher start stamp embedded in
/// ownership tag values, e.g. `01Aug10:22:05`.
///
/// Only the `<user>_` prefix of a tag value is contractual; the stamp
/// merely has to be stable for the lifetime of one dispatcher.
pub fn start_stamp(epoch_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms as i64)
        .map(|dt| dt.format("%d%b%H:%M:%S").to_string())
        .unwrap_or_else(|| epoch_ms.to_string())
}

/// Fake clock for testing with controllable time
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeNow>>,
}

struct FakeNow {
    current: Instant,
    epoch_ms: u64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeNow { current: Instant::now(), epoch_ms: 1_000_000 })),
        }
    }

    /// Advance the clock by the given duration
    pub fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.current += duration;
        inner.epoch_ms += duration.as_millis() as u64;
    }

    /// Set the epoch milliseconds value
    pub fn set_epoch_ms(&self, ms: u64) {
        self.inner.lock().epoch_ms = ms;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.inner.lock().current
    }

    fn epoch_ms(&self) -> u64 {
        self.inner.lock().epoch_ms
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
