// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Monotonic microsecond clocks.
//!
//! All bookkeeping (LRU timestamps, buffer idle times, cool-downs) reads time through
//! the [`Clock`] trait so tests can drive it by hand.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// A monotonic clock reporting microseconds since an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
}

/// Converts a duration into signed microseconds, saturating at `i64::MAX`.
pub fn micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// The process clock.
pub struct SystemClock {
    #[cfg(not(feature = "quanta"))]
    origin: std::time::Instant,
    #[cfg(feature = "quanta")]
    clock: quanta::Clock,
    #[cfg(feature = "quanta")]
    origin: quanta::Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        #[cfg(not(feature = "quanta"))]
        {
            SystemClock {
                origin: std::time::Instant::now(),
            }
        }
        #[cfg(feature = "quanta")]
        {
            let clock = quanta::Clock::new();
            let origin = clock.now();
            SystemClock { clock, origin }
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[cfg(not(feature = "quanta"))]
    fn now_micros(&self) -> i64 {
        micros(self.origin.elapsed())
    }

    #[cfg(feature = "quanta")]
    fn now_micros(&self) -> i64 {
        micros(self.clock.now().duration_since(self.origin))
    }
}

/// A clock that only moves when told to.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_micros: i64) -> ManualClock {
        ManualClock {
            now: AtomicI64::new(start_micros),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(micros(duration), Ordering::SeqCst);
    }

    pub fn set(&self, now_micros: i64) {
        self.now.store(now_micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now_micros(), 6_000);
        clock.set(42);
        assert_eq!(clock.now_micros(), 42);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_micros();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now_micros() > first);
    }
}
