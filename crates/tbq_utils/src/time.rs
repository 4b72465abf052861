use serde_derive::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp, used for enqueue and lease times that are reported outside the process.
/// Liveness decisions use monotonic [std::time::Instant]s instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EpochMillis(u128);

impl EpochMillis {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(since_epoch.as_millis())
    }

    pub fn as_millis(self) -> u128 {
        self.0
    }

    pub fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    /// Time elapsed between an `earlier` timestamp and this one; zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: EpochMillis) -> Duration {
        let millis = self.0.saturating_sub(earlier.0);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}
