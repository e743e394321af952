//! Rate-limit detection for coding agent errors.
//!
//! The agent reports exhausted usage with text such as
//! `You've hit your limit · resets 6am (Europe/Podgorica)`. This module
//! recognizes that text and turns the stated wall-clock reset into an
//! absolute instant so the task can be parked in the retry queue.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::flog_debug;

static RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)?(?:\s*\(([^)]+)\))?")
        .unwrap()
});

static OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:utc|gmt)?\s*([+-])(\d{1,2})(?::?(\d{2}))?$").unwrap()
});

/// A parsed rate-limit rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitInfo {
    pub reset_time: DateTime<Utc>,
    /// Zone name as written in the error, `Local` when absent.
    pub timezone: String,
    pub raw_error: String,
}

impl RateLimitInfo {
    /// Time left until the limit resets; zero once it has passed.
    pub fn time_until_reset(&self) -> Duration {
        (self.reset_time - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// `now`, `45m`, or `2h 30m`.
    pub fn human_readable_reset(&self) -> String {
        let remaining = self.time_until_reset();
        if remaining.is_zero() {
            return "now".to_string();
        }
        let total_minutes = remaining.as_secs() / 60;
        let hours = total_minutes / 60;
        let minutes = total_minutes % 60;
        if hours > 0 {
            format!("{}h {}m", hours, minutes)
        } else {
            format!("{}m", minutes)
        }
    }
}

/// Whether an error message looks like a usage-limit rejection.
pub fn is_rate_limit_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("hit your limit") || lower.contains("rate limit") || lower.contains("resets")
}

/// Extract the reset instant from a rate-limit error.
///
/// Returns `None` for non rate-limit text and for rate-limit text without a
/// recognizable reset time.
pub fn parse_rate_limit_error(text: &str) -> Option<RateLimitInfo> {
    parse_rate_limit_error_at(text, Utc::now())
}

/// Same as [`parse_rate_limit_error`] with an explicit clock.
pub fn parse_rate_limit_error_at(text: &str, now: DateTime<Utc>) -> Option<RateLimitInfo> {
    if !is_rate_limit_error(text) {
        return None;
    }
    let caps = RESET_RE.captures(text)?;
    let raw_hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    if minute > 59 {
        return None;
    }
    let hour = match caps.get(3).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(meridiem) => {
            if !(1..=12).contains(&raw_hour) {
                return None;
            }
            match (meridiem.as_str(), raw_hour) {
                ("am", 12) => 0,
                ("am", h) => h,
                ("pm", 12) => 12,
                (_, h) => h + 12,
            }
        }
        None if caps.get(2).is_some() && raw_hour < 24 => raw_hour,
        // A bare number with neither minutes nor am/pm is too ambiguous.
        None => return None,
    };

    let timezone = caps
        .get(4)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| "Local".to_string());

    let reset_time = if let Some(offset) = zone_offset(&timezone) {
        next_occurrence(&offset, now, hour, minute)?
    } else if let Ok(zone) = timezone.parse::<Tz>() {
        next_occurrence(&zone, now, hour, minute)?
    } else {
        if timezone != "Local" {
            flog_debug!("Unknown zone {:?} in rate-limit error, using local time", timezone);
        }
        next_occurrence(&Local, now, hour, minute)?
    };

    Some(RateLimitInfo {
        reset_time,
        timezone,
        raw_error: text.to_string(),
    })
}

/// Fixed offset for UTC-like and numeric zone names such as `UTC+2`.
/// IANA names return `None` and go through the tz database.
fn zone_offset(name: &str) -> Option<FixedOffset> {
    let upper = name.trim().to_ascii_uppercase();
    if matches!(upper.as_str(), "UTC" | "GMT" | "Z" | "ETC/UTC" | "ETC/GMT") {
        return FixedOffset::east_opt(0);
    }
    let caps = OFFSET_RE.captures(name.trim())?;
    let hours: i32 = caps.get(2)?.as_str().parse().ok()?;
    let minutes: i32 = caps
        .get(3)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    if hours > 14 || minutes > 59 {
        return None;
    }
    let secs = hours * 3600 + minutes * 60;
    match caps.get(1)?.as_str() {
        "-" => FixedOffset::west_opt(secs),
        _ => FixedOffset::east_opt(secs),
    }
}

/// First instant strictly after `now` whose wall clock in `tz` reads
/// `hour:minute`.
fn next_occurrence<Z: TimeZone>(
    tz: &Z,
    now: DateTime<Utc>,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    let today = now.with_timezone(tz).date_naive();
    for day in 0..=2 {
        let date = today + ChronoDuration::days(day);
        let naive = date.and_hms_opt(hour, minute, 0)?;
        // Skipped wall-clock times (DST gaps) fall through to the next day.
        if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return Some(candidate);
            }
        }
    }
    None
}
