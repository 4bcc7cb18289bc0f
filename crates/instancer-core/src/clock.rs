// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wall clock abstraction.
//!
//! Record timestamps are persisted as whole unix seconds, so every clock
//! truncates to one-second resolution. That keeps
//! `deadline_at == created_at + max_lifetime` exact after a round trip
//! through either database backend.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Source of the current time for lifecycle decisions.
pub trait Clock: Send + Sync {
    /// Current time, truncated to whole seconds.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        from_unix(Utc::now().timestamp())
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at the given unix timestamp.
    pub fn at(unix_secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(unix_secs),
        }
    }

    /// Jump to the given unix timestamp.
    pub fn set(&self, unix_secs: i64) {
        self.secs.store(unix_secs, Ordering::SeqCst);
    }

    /// Move forward by `secs` seconds.
    pub fn advance(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        from_unix(self.secs.load(Ordering::SeqCst))
    }
}

/// Convert a unix timestamp in seconds to a UTC datetime.
///
/// Out-of-range values collapse to the unix epoch.
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_set_and_advance() {
        let clock = ManualClock::at(1000);
        assert_eq!(clock.now().timestamp(), 1000);

        clock.advance(1800);
        assert_eq!(clock.now().timestamp(), 2800);

        clock.set(5);
        assert_eq!(clock.now().timestamp(), 5);
    }

    #[test]
    fn test_system_clock_has_whole_seconds() {
        let now = SystemClock.now();
        assert_eq!(now.timestamp_subsec_nanos(), 0);
    }
}
