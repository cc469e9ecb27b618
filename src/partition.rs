//! Observation-time partition windows.

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Partition key text format, e.g. `2026-01-05-13:00`.
pub const PARTITION_FORMAT: &str = "%Y-%m-%d-%H:%M";

/// Fixed-width windows anchored at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWindow {
    start: DateTime<Utc>,
    width: Duration,
}

impl PartitionWindow {
    /// Returns `None` for a zero-minute window.
    pub fn new(start: DateTime<Utc>, minutes: u32) -> Option<Self> {
        if minutes == 0 {
            return None;
        }
        Some(Self {
            start,
            width: Duration::minutes(i64::from(minutes)),
        })
    }

    /// The window containing `at`. Instants before `start` land in windows
    /// extrapolated backwards on the same grid.
    pub fn partition_for(&self, at: DateTime<Utc>) -> PartitionKey {
        let width = self.width.num_seconds();
        let offset = (at - self.start).num_seconds();
        let index = offset.div_euclid(width);
        let start = self.start + Duration::seconds(index * width);
        PartitionKey {
            start,
            end: start + self.width,
        }
    }
}

impl Default for PartitionWindow {
    /// Five-minute windows starting 2026-01-01 00:00 UTC.
    fn default() -> Self {
        Self {
            start: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            width: Duration::minutes(5),
        }
    }
}

/// Half-open `[start, end)` window a batch is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PartitionKey {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start.format(PARTITION_FORMAT))
    }
}
