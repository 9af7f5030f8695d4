//! Time primitives for the Stroop link protocol
//!
//! Wire timestamps are wall-clock milliseconds. Locally they are derived
//! from a monotonic clock so that elapsed-time arithmetic never goes
//! backwards, even if the system clock is adjusted mid-session.

use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Milliseconds since the Unix epoch
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    #[inline]
    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Timestamp(millis as u64)
    }

    /// Elapsed time since an earlier timestamp (zero if `earlier` is later)
    #[inline]
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Self::Output {
        self.saturating_since(rhs)
    }
}

impl std::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t({}ms)", self.0)
    }
}

/// Session clock - monotonic source of wire timestamps
///
/// Captures a wall-clock origin once and advances it by the elapsed time of
/// a `tokio::time::Instant`, so tests running on tokio's paused clock see
/// consistent timestamps.
#[derive(Clone, Copy, Debug)]
pub struct SessionClock {
    origin: Timestamp,
    reference: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        SessionClock {
            origin: Timestamp::now(),
            reference: Instant::now(),
        }
    }

    /// Clock anchored at a fixed origin (deterministic tests)
    pub fn with_origin(origin: Timestamp) -> Self {
        SessionClock {
            origin,
            reference: Instant::now(),
        }
    }

    /// Current session timestamp
    pub fn now(&self) -> Timestamp {
        self.at(Instant::now())
    }

    /// Timestamp corresponding to a monotonic instant
    pub fn at(&self, instant: Instant) -> Timestamp {
        self.origin + instant.saturating_duration_since(self.reference)
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
