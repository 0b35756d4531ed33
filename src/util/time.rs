use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_WEEK: i64 = 604_800;

/// Source of "now" for expiration checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, seconds: i64) {
        let mut now = self.now.lock();
        *now = *now + Duration::seconds(seconds);
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

pub fn truncate_to_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(instant.timestamp_millis()).unwrap_or(instant)
}

/// Parses `<amount><unit>` with unit one of `s m h d w`.
/// Anything malformed or non-positive yields `None`, which callers must
/// reject before issuing a punishment.
pub fn parse_duration(input: &str) -> Option<i64> {
    let input = input.trim();
    let unit = input.chars().last()?;
    let amount = input[..input.len() - unit.len_utf8()].parse::<i64>().ok()?;
    let multiplier = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => SECONDS_PER_MINUTE,
        'h' => SECONDS_PER_HOUR,
        'd' => SECONDS_PER_DAY,
        'w' => SECONDS_PER_WEEK,
        _ => return None
    };
    let seconds = amount.checked_mul(multiplier)?;
    if seconds <= 0 { None } else { Some(seconds) }
}

/// Largest whole unit only: `45s`, `5m`, `3h`, `2d`, `1w`.
pub fn format_duration_short(seconds: i64) -> String {
    if seconds < SECONDS_PER_MINUTE { return format!("{}s", seconds) };
    if seconds < SECONDS_PER_HOUR { return format!("{}m", seconds / SECONDS_PER_MINUTE) };
    if seconds < SECONDS_PER_DAY { return format!("{}h", seconds / SECONDS_PER_HOUR) };
    if seconds < SECONDS_PER_WEEK { return format!("{}d", seconds / SECONDS_PER_DAY) };
    format!("{}w", seconds / SECONDS_PER_WEEK)
}

/// `1d 2h 3m 4s`, skipping zero parts.
pub fn format_compound_duration(seconds: i64) -> String {
    let mut remaining = seconds.max(0);
    let days = remaining / SECONDS_PER_DAY;
    remaining %= SECONDS_PER_DAY;
    let hours = remaining / SECONDS_PER_HOUR;
    remaining %= SECONDS_PER_HOUR;
    let minutes = remaining / SECONDS_PER_MINUTE;
    remaining %= SECONDS_PER_MINUTE;

    let parts = [(days, "d"), (hours, "h"), (minutes, "m"), (remaining, "s")];
    parts.iter()
        .filter(|(amount, _)| *amount > 0)
        .map(|(amount, unit)| format!("{}{}", amount, unit))
        .collect::<Vec<String>>()
        .join(" ")
}

/// Human countdown until `expiration`, e.g. `2 days 3 hours`.
/// Minutes are only shown once less than a day remains.
pub fn format_expiration(expiration: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let until = expiration - now;
    let days = until.num_days();
    let hours = until.num_hours() % 24;
    let minutes = until.num_minutes() % 60;

    let mut parts: Vec<String> = Vec::new();
    if days > 0 { parts.push(format!("{} days", days)) };
    if hours > 0 { parts.push(format!("{} hours", hours)) };
    if days == 0 && minutes > 0 { parts.push(format!("{} minutes", minutes)) };
    if parts.is_empty() {
        return String::from("less than a minute");
    }
    parts.join(" ")
}
