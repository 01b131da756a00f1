use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Values below this many seconds are relative, anything larger is a UNIX timestamp.
pub const RELATIVE_THRESHOLD_SECS: f64 = 1000.0;

/// Deadline applied when a caller does not supply one.
pub const DEFAULT_DEADLINE: Deadline = Deadline::After(Duration::from_secs(10));

// Stand-in for "never" when an expiry cannot be represented as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// A time limit for a blocking operation.
///
/// A deadline is a description, not a point in time: a relative deadline is
/// resolved against the clock each time [`Deadline::expires_at`] is called,
/// so the same value can be reused for every call on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Expires this long after the operation starts.
    After(Duration),
    /// Expires at a fixed wall-clock time.
    At(SystemTime),
}

impl Deadline {
    /// Interpret a number of seconds the way the wire clients do: small values
    /// are relative to now, values of at least [`RELATIVE_THRESHOLD_SECS`] are
    /// seconds since the UNIX epoch.
    ///
    /// Negative and NaN inputs mean "already expired".
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() || secs <= 0.0 {
            return Self::After(Duration::ZERO);
        }
        let duration = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        if secs < RELATIVE_THRESHOLD_SECS {
            Self::After(duration)
        } else {
            Self::At(UNIX_EPOCH.checked_add(duration).unwrap_or(UNIX_EPOCH + FAR_FUTURE))
        }
    }

    /// Relative deadline.
    pub fn after(duration: Duration) -> Self {
        Self::After(duration)
    }

    /// Absolute deadline.
    pub fn at(time: SystemTime) -> Self {
        Self::At(time)
    }

    /// Resolve this deadline to a monotonic expiry, starting now.
    pub fn expires_at(&self) -> Instant {
        let now = Instant::now();
        let remaining = match self {
            Self::After(duration) => *duration,
            Self::At(time) => time
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        };
        now.checked_add(remaining)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now)
    }
}

impl Default for Deadline {
    fn default() -> Self {
        DEFAULT_DEADLINE
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl From<f64> for Deadline {
    fn from(secs: f64) -> Self {
        Self::from_secs_f64(secs)
    }
}
