//! Wall-clock seam.
//!
//! Queue timestamps are local, second-precision values, so the clock
//! hands out `NaiveDateTime` truncated to whole seconds.

use chrono::{Local, NaiveDateTime, Timelike};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local system time, truncated to seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }
}
