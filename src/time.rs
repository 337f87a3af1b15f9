//! Virtual simulation clock.
//!
//! The kernel never touches wall-clock time. `SimTime` is a fixed-point
//! nanosecond count so that event ordering (`Ord`) is total and exact,
//! unlike `f64`, which cannot back a `BinaryHeap` key without losing the
//! ability to derive `Eq`/`Ord`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A point in virtual simulation time, expressed in nanoseconds since run start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_nanos(nanos: u64) -> Self {
        SimTime(nanos)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        debug_assert!(secs.is_finite() && secs >= 0.0, "negative or non-finite simulated delay");
        SimTime((secs.max(0.0) * 1_000_000_000.0).round() as u64)
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    pub fn checked_add(self, other: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(other.0))
    }

    pub fn checked_sub(self, other: SimTime) -> Option<SimTime> {
        self.0.checked_sub(other.0).map(SimTime)
    }
}

impl std::ops::Add for SimTime {
    type Output = SimTime;
    fn add(self, rhs: SimTime) -> SimTime {
        self.checked_add(rhs)
    }
}

impl From<Duration> for SimTime {
    fn from(d: Duration) -> Self {
        SimTime(d.as_nanos() as u64)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total_and_monotonic_under_addition() {
        let a = SimTime::from_secs_f64(1.0);
        let b = SimTime::from_secs_f64(2.5);
        assert!(a < b);
        assert_eq!(a.checked_add(b), SimTime::from_secs_f64(3.5));
    }

    #[test]
    fn clamps_negative_delay_to_zero() {
        assert_eq!(SimTime::from_secs_f64(-5.0), SimTime::ZERO);
    }

    #[test]
    fn round_trips_through_seconds() {
        let t = SimTime::from_secs_f64(0.125);
        assert_eq!(t.as_secs_f64(), 0.125);
    }
}
