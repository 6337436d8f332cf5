use crate::config::RebalanceSchedule;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use std::time::Duration;

/// Time left until the next top of the hour (UTC).
///
/// Exactly on the hour returns a full hour, never zero.
pub fn until_next_hour(now: DateTime<Utc>) -> Duration {
    let this_hour = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let next_hour = this_hour + ChronoDuration::hours(1);
    (next_hour - now)
        .to_std()
        .unwrap_or(Duration::from_secs(3600))
}

impl RebalanceSchedule {
    /// How long to sleep before the next scheduled point.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            RebalanceSchedule::TopOfHour => until_next_hour(now),
            RebalanceSchedule::Every(interval) => *interval,
        }
    }
}
