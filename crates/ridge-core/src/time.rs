//! Monotonic time, threaded explicitly.
//!
//! The core never reads a clock. Every operation receives the current
//! [`Timestamp`] through the [`Context`](crate::context::Context); the daemon
//! maps `std::time::Instant` onto it once per event-loop turn, and tests
//! drive it by hand.

use std::ops::{Add, Sub};
use std::time::Duration;

/// Milliseconds on an arbitrary monotonic axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`. Zero if `earlier` is in the future.
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_saturates() {
        let a = Timestamp::from_millis(100);
        let b = Timestamp::from_millis(250);
        assert_eq!(b.since(a), Duration::from_millis(150));
        assert_eq!(a.since(b), Duration::ZERO);
    }

    #[test]
    fn add_sub_duration() {
        let t = Timestamp::from_millis(1000);
        assert_eq!(t + Duration::from_secs(2), Timestamp::from_millis(3000));
        assert_eq!(t - Duration::from_millis(400), Timestamp::from_millis(600));
    }
}
