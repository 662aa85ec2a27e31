use std::fmt;
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest accepted component values for `HH:MM:SS`
const MAX_HOURS: u32 = 23;
const MAX_MINUTES: u32 = 59;
const MAX_SECONDS: u32 = 59;

/// Time codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("Invalid budget format: {0}")]
    InvalidFormat(String),
}

/// Result type for time codec operations
pub type TimeResult<T> = Result<T, TimeError>;

/// Calendar day identifier in `YYYY-MM-DD` form.
///
/// Two instants belong to the same budget day iff their keys are equal.
/// The key is always computed in the observer's timezone at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayKey(String);

impl DayKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<NaiveDate> for DayKey {
    fn from(date: NaiveDate) -> Self {
        DayKey(date.format("%Y-%m-%d").to_string())
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a `HH:MM:SS` budget into seconds.
///
/// Missing trailing components default to 0, so `"1"` is one hour and
/// `"0:30"` is thirty minutes. A total of zero parses fine; rejecting it is
/// left to policy validation.
pub fn parse_budget(text: &str) -> TimeResult<u32> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }

    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() > 3 {
        return Err(TimeError::InvalidFormat(text.to_string()));
    }

    let mut values = [0u32; 3];
    for (slot, part) in values.iter_mut().zip(parts.iter()) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(TimeError::InvalidFormat(text.to_string()));
        }
        *slot = part
            .parse::<u32>()
            .map_err(|_| TimeError::InvalidFormat(text.to_string()))?;
    }

    let [hours, minutes, seconds] = values;
    if hours > MAX_HOURS || minutes > MAX_MINUTES || seconds > MAX_SECONDS {
        return Err(TimeError::InvalidFormat(text.to_string()));
    }

    Ok(hours * 3600 + minutes * 60 + seconds)
}

/// Format seconds as zero padded `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_budget(seconds: u32) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

/// Day key of `instant` in the machine's local timezone
pub fn day_key(instant: DateTime<Utc>) -> DayKey {
    day_key_in(instant, &Local)
}

/// Day key of `instant` in the given timezone
pub fn day_key_in<Tz: TimeZone>(instant: DateTime<Utc>, tz: &Tz) -> DayKey {
    DayKey::from(instant.with_timezone(tz).date_naive())
}

/// Next local midnight strictly after `instant`, in the machine's timezone
pub fn next_midnight(instant: DateTime<Utc>) -> DateTime<Utc> {
    next_midnight_in(instant, &Local)
}

/// Next `00:00:00` in `tz` strictly after `instant`.
///
/// When midnight falls into a DST gap the earliest valid local instant of that
/// day is returned.
pub fn next_midnight_in<Tz: TimeZone>(instant: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let local_date = instant.with_timezone(tz).date_naive();
    let Some(next_date) = local_date.succ_opt() else {
        return instant + Duration::days(1);
    };

    let mut candidate = next_date.and_time(chrono::NaiveTime::MIN);
    // Gaps are at most a few hours wide; step forward 15 minutes at a time.
    for _ in 0..(4 * 24) {
        if let Some(resolved) = tz.from_local_datetime(&candidate).earliest() {
            return resolved.with_timezone(&Utc);
        }
        candidate += Duration::minutes(15);
    }

    instant + Duration::days(1)
}
