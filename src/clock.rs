//! Monotonic clock helpers used for scheduling deadlines.
//!
//! The reactor never needs wall-clock time, only a monotonically increasing
//! instant to compare fiber deadlines against, so this wraps
//! [`std::time::Instant`] rather than reimplementing `clock_gettime`.

use std::time::{Duration, Instant};

/// A duration long enough that `suspend_until` should treat it as "forever".
///
/// A `Duration` rather than "seconds as an f64", since every timeout in
/// this crate is already a `Duration`.
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The current monotonic instant.
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

/// `deadline`, or `None` if `timeout` is effectively infinite.
#[inline]
pub fn deadline_from(timeout: Duration) -> Option<Instant> {
    if timeout >= INFINITY {
        None
    } else {
        Some(now() + timeout)
    }
}
