//! Timestamp helpers.
//!
//! Backup timestamps are kept at millisecond precision because they are
//! encoded in storage folder names.

use chrono::{DateTime, Duration, Utc};

/// Current time truncated to milliseconds.
pub fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

/// Half-open interval `[from, to)`. A missing bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeBounds {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeBounds {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to }
    }

    pub fn all() -> Self {
        Self::default()
    }

    /// `(after, until]` expressed at millisecond resolution. An `until` at
    /// the end of representable time leaves the upper bound open.
    pub fn after_until(after: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        let step = Duration::milliseconds(1);
        match after.checked_add_signed(step) {
            Some(from) => Self {
                from: Some(from),
                to: until.checked_add_signed(step),
            },
            // Nothing comes after the last instant
            None => Self {
                from: Some(after),
                to: Some(after),
            },
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| t >= from) && self.to.map_or(true, |to| t < to)
    }
}
