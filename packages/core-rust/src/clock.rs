//! Wall-clock timestamps and an injectable clock source.
//!
//! Operation start times reported by the server and the client-side
//! `initial_call_time` of a resumable call are both expressed as
//! [`Timestamp`]s, so they can be compared directly.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A point in time as seconds and nanoseconds since the Unix epoch.
///
/// Ordering is seconds first, then nanos. The all-zero value is what servers
/// send when they have no time to report; [`Timestamp::non_default`] maps it
/// to `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the Unix epoch.
    pub seconds: i64,
    /// Sub-second nanoseconds, `0..1_000_000_000`.
    pub nanos: i32,
}

impl Timestamp {
    #[must_use]
    pub const fn new(seconds: i64, nanos: i32) -> Self {
        Self { seconds, nanos }
    }

    /// Builds a timestamp from milliseconds since the Unix epoch.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let seconds = (millis / 1000) as i64;
        #[allow(clippy::cast_possible_truncation)]
        let nanos = ((millis % 1000) * 1_000_000) as i32;
        Self { seconds, nanos }
    }

    /// Drops the sub-second part.
    #[must_use]
    pub const fn truncate_to_seconds(self) -> Self {
        Self {
            seconds: self.seconds,
            nanos: 0,
        }
    }

    /// Returns `None` for the all-zero default timestamp.
    #[must_use]
    pub fn non_default(self) -> Option<Self> {
        if self == Self::default() {
            None
        } else {
            Some(self)
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Abstraction over the system clock for dependency injection.
///
/// The retry helper and the operation coordinator read time only through
/// this trait, so tests can substitute a [`ManualClock`].
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since Unix epoch.
    fn now_millis(&self) -> u64;

    /// Returns the current time as a [`Timestamp`].
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now_millis())
    }
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> u64 {
        // A clock set before 1970 reads as the epoch.
        #[allow(clippy::cast_possible_truncation)]
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        millis
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(millis),
        }
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let by = by.as_millis() as u64;
        self.millis.fetch_add(by, AtomicOrdering::SeqCst);
    }
}

impl ClockSource for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(AtomicOrdering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_compares_seconds_then_nanos() {
        let a = Timestamp::new(10, 5);
        let b = Timestamp::new(10, 6);
        let c = Timestamp::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.cmp(&Timestamp::new(10, 5)), Ordering::Equal);
    }

    #[test]
    fn from_millis_splits_seconds_and_nanos() {
        let ts = Timestamp::from_millis(1_500);
        assert_eq!(ts, Timestamp::new(1, 500_000_000));
        assert_eq!(ts.truncate_to_seconds(), Timestamp::new(1, 0));
    }

    #[test]
    fn default_timestamp_is_absent() {
        assert_eq!(Timestamp::default().non_default(), None);
        assert_eq!(
            Timestamp::new(0, 1).non_default(),
            Some(Timestamp::new(0, 1))
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), Timestamp::new(1, 0));
        clock.advance(Duration::from_millis(2_250));
        assert_eq!(clock.now_millis(), 3_250);
        clock.set_millis(0);
        assert_eq!(clock.now(), Timestamp::default());
    }

    #[test]
    fn system_clock_is_after_epoch() {
        assert!(SystemClock.now_millis() > 0);
    }

    proptest::proptest! {
        #[test]
        fn ordering_matches_tuple_order(
            s1 in -1_000i64..1_000, n1 in 0i32..1_000_000_000,
            s2 in -1_000i64..1_000, n2 in 0i32..1_000_000_000,
        ) {
            let a = Timestamp::new(s1, n1);
            let b = Timestamp::new(s2, n2);
            proptest::prop_assert_eq!(a.cmp(&b), (s1, n1).cmp(&(s2, n2)));
        }
    }
}
