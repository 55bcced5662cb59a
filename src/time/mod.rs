//! Monotonic time primitives used for task ordering and wait computation.
//!
//! - [`TimeTicks`] is a point on the monotonic clock that may also be *null*,
//!   which is how a pending task says "run me now" and how a pump says "no
//!   delayed work is armed".
//! - Durations are plain [`std::time::Duration`] values.
//! - [`delay_until`] converts a deadline into the timeout a pump should wait.
//!
//! # Example
//!
//! ```ignore
//! use msgloop::time::{TimeTicks, delay_until};
//! use std::time::Duration;
//!
//! let deadline = TimeTicks::now() + Duration::from_millis(20);
//! let wait = delay_until(deadline).unwrap();
//! assert!(wait <= Duration::from_millis(20));
//! ```

use std::cmp::Ordering;
use std::ops::Add;
use std::time::{Duration, Instant};

/// A monotonic timestamp, or null.
///
/// Null compares lower than every real timestamp so that "no deadline" sorts
/// first, matching how the loop treats immediate tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TimeTicks(Option<Instant>);

impl TimeTicks {
    /// The null timestamp.
    pub const fn null() -> Self {
        Self(None)
    }

    /// Current value of the monotonic clock.
    pub fn now() -> Self {
        Self(Some(Instant::now()))
    }

    /// Returns `true` when this timestamp carries no time.
    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// Underlying instant, if any.
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Computes the run time of a task posted now with `delay`.
    ///
    /// A zero delay yields the null timestamp, i.e. an immediate task.
    pub fn from_delay(delay: Duration) -> Self {
        if delay.is_zero() {
            Self::null()
        } else {
            Self::now() + delay
        }
    }
}

impl From<Instant> for TimeTicks {
    fn from(instant: Instant) -> Self {
        Self(Some(instant))
    }
}

impl Add<Duration> for TimeTicks {
    type Output = TimeTicks;

    fn add(self, rhs: Duration) -> TimeTicks {
        match self.0 {
            Some(instant) => TimeTicks(Some(instant + rhs)),
            None => TimeTicks(None),
        }
    }
}

impl PartialOrd for TimeTicks {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeTicks {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

/// Time left until `deadline`, rounded up to whole milliseconds.
///
/// Returns `None` for a null deadline (wait forever) and `Duration::ZERO`
/// once the deadline has passed. Rounding up keeps a pump from waking before
/// the delayed task is actually due: 5.5ms left waits 6ms.
pub fn delay_until(deadline: TimeTicks) -> Option<Duration> {
    let deadline = deadline.instant()?;
    let remaining = deadline.saturating_duration_since(Instant::now());

    let micros = remaining.as_micros();
    let millis = micros.div_ceil(1000);

    Some(Duration::from_millis(millis.min(u64::MAX as u128) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sorts_before_real_time() {
        let now = TimeTicks::now();

        assert!(TimeTicks::null() < now);
        assert!(TimeTicks::null().is_null());
        assert!(!now.is_null());
    }

    #[test]
    fn zero_delay_is_immediate() {
        assert!(TimeTicks::from_delay(Duration::ZERO).is_null());
        assert!(!TimeTicks::from_delay(Duration::from_millis(1)).is_null());
    }

    #[test]
    fn delay_rounds_up_and_saturates() {
        assert_eq!(delay_until(TimeTicks::null()), None);

        let past = TimeTicks::from(Instant::now() - Duration::from_millis(5));
        assert_eq!(delay_until(past), Some(Duration::ZERO));

        let future = TimeTicks::now() + Duration::from_micros(5_500);
        let wait = delay_until(future).expect("deadline is set");
        assert!(wait <= Duration::from_millis(6));
        assert_eq!(wait.subsec_nanos() % 1_000_000, 0, "whole milliseconds");
    }
}
