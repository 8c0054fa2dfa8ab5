//! Clocks and deadline conversion.
//!
//! Timed waits take absolute deadlines against one of four clocks. The kernel
//! wait primitive takes a relative millisecond budget, so every retry of a
//! timed wait recomputes the remaining budget from the deadline here. That
//! keeps interrupted waits honest: a signal that cuts a sleep short does not
//! extend the total wait.

use crate::error::{Error, Result};

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;

/// Clocks a timed wait may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    #[default]
    Realtime,
    RealtimeCoarse,
    Monotonic,
    MonotonicCoarse,
}

impl Clock {
    pub(crate) fn raw(self) -> libc::clockid_t {
        match self {
            Clock::Realtime => libc::CLOCK_REALTIME,
            Clock::RealtimeCoarse => libc::CLOCK_REALTIME_COARSE,
            Clock::Monotonic => libc::CLOCK_MONOTONIC,
            Clock::MonotonicCoarse => libc::CLOCK_MONOTONIC_COARSE,
        }
    }

    /// True for the monotonic family.
    #[must_use]
    pub fn is_monotonic(self) -> bool {
        matches!(self, Clock::Monotonic | Clock::MonotonicCoarse)
    }
}

/// An absolute point in time on some clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    #[must_use]
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// A deadline is well formed when the nanosecond field is in range.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.nsec >= 0 && self.nsec < NANOS_PER_SECOND
    }

    pub(crate) const fn as_nanos(&self) -> i128 {
        self.sec as i128 * NANOS_PER_SECOND as i128 + self.nsec as i128
    }
}

/// Read the current time on `clock`.
#[must_use]
pub fn now(clock: Clock) -> Timespec {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a live local and the clock id is one of the four fixed
    // clocks above, all of which Linux supports.
    unsafe {
        libc::clock_gettime(clock.raw(), &raw mut ts);
    }
    Timespec { sec: ts.tv_sec, nsec: ts.tv_nsec as i64 }
}

/// An absolute deadline `ms` milliseconds from now on `clock`.
///
/// Convenience for callers that think in relative budgets, such as the
/// credential broadcast retry loop.
#[must_use]
pub fn deadline_after_ms(clock: Clock, ms: u32) -> Timespec {
    let base = now(clock);
    let total = base.nsec + i64::from(ms) * NANOS_PER_MILLI;
    Timespec { sec: base.sec + total / NANOS_PER_SECOND, nsec: total % NANOS_PER_SECOND }
}

/// Milliseconds remaining until `deadline` on `clock`, rounded up.
///
/// Returns `Err(TimedOut)` when the deadline has already passed, so callers
/// can fail a timed wait without entering the kernel.
pub fn remaining_ms(clock: Clock, deadline: &Timespec) -> Result<u32> {
    let left = deadline.as_nanos() - now(clock).as_nanos();
    if left <= 0 {
        return Err(Error::TimedOut);
    }
    let ms = (left + i128::from(NANOS_PER_MILLI) - 1) / i128::from(NANOS_PER_MILLI);
    Ok(u32::try_from(ms).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nanosecond_field_bounds() {
        assert!(Timespec::new(0, 0).is_valid());
        assert!(Timespec::new(5, NANOS_PER_SECOND - 1).is_valid());
        assert!(!Timespec::new(5, NANOS_PER_SECOND).is_valid());
        assert!(!Timespec::new(5, -1).is_valid());
    }

    #[test]
    fn past_deadline_times_out_without_sleeping() {
        let past = Timespec::new(0, 0);
        assert_eq!(remaining_ms(Clock::Monotonic, &past), Err(Error::TimedOut));
    }

    #[test]
    fn future_deadline_rounds_up() {
        let deadline = deadline_after_ms(Clock::Monotonic, 200);
        let ms = remaining_ms(Clock::Monotonic, &deadline).unwrap();
        assert!(ms > 0 && ms <= 200, "budget {ms} out of range");
    }

    #[test]
    fn clocks_advance() {
        let a = now(Clock::Monotonic);
        let b = now(Clock::Monotonic);
        assert!(b.as_nanos() >= a.as_nanos());
    }
}
