//! Grid rounding for timestamps.
//!
//! # Responsibility
//! - Snap instants onto a regular grid of whole seconds or weekday
//!   midnights.
//!
//! # Invariants
//! - Sub-second components are discarded before any rounding.
//! - Duration grids are aligned to the Unix epoch.
//! - Rounding an already rounded value returns it unchanged.

use chrono::{DateTime, TimeDelta, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;
use thiserror::Error;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)(\d+)\s*([smhdw]?)$").expect("valid precision regex"));

/// Rounding failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundingError {
    #[error("invalid rounding precision: {0}")]
    InvalidPrecision(String),
    #[error("rounded timestamp is out of range")]
    OutOfRange,
}

/// Grid granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Multiples of a whole-second duration since the Unix epoch.
    Duration(TimeDelta),
    /// Midnight of the named weekday, every seven days.
    Weekday(Weekday),
}

impl Precision {
    pub fn seconds(seconds: i64) -> Self {
        Self::Duration(TimeDelta::seconds(seconds))
    }

    pub fn minutes(minutes: i64) -> Self {
        Self::Duration(TimeDelta::minutes(minutes))
    }

    pub fn hours(hours: i64) -> Self {
        Self::Duration(TimeDelta::hours(hours))
    }

    pub fn days(days: i64) -> Self {
        Self::Duration(TimeDelta::days(days))
    }

    /// Returns the grid step and the epoch offset of grid point zero.
    fn grid(self) -> Result<(i64, i64), RoundingError> {
        match self {
            Self::Duration(step) => {
                if step.subsec_nanos() != 0 || step.num_seconds() <= 0 {
                    return Err(RoundingError::InvalidPrecision(format!(
                        "duration must be a positive whole number of seconds, got {step}"
                    )));
                }
                Ok((step.num_seconds(), 0))
            }
            // 1970-01-01 was a Thursday.
            Self::Weekday(day) => {
                let days_after_thursday =
                    (i64::from(day.num_days_from_monday()) - 3).rem_euclid(7);
                Ok((SECONDS_PER_WEEK, days_after_thursday * SECONDS_PER_DAY))
            }
        }
    }
}

/// Parses `MON`/`monday`, plain seconds (`60`), or a number with a
/// `s|m|h|d|w` suffix (`15m`).
impl FromStr for Precision {
    type Err = RoundingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(day) = trimmed.parse::<Weekday>() {
            return Ok(Self::Weekday(day));
        }

        let caps = DURATION_RE
            .captures(trimmed)
            .ok_or_else(|| RoundingError::InvalidPrecision(format!("unrecognized `{trimmed}`")))?;
        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| RoundingError::InvalidPrecision(format!("amount too large `{trimmed}`")))?;
        let unit_seconds = match caps[2].to_ascii_lowercase().as_str() {
            "" | "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => SECONDS_PER_DAY,
            _ => SECONDS_PER_WEEK,
        };
        let seconds = amount
            .checked_mul(unit_seconds)
            .ok_or_else(|| RoundingError::InvalidPrecision(format!("amount too large `{trimmed}`")))?;
        let delta = TimeDelta::try_seconds(seconds)
            .ok_or_else(|| RoundingError::InvalidPrecision(format!("amount too large `{trimmed}`")))?;
        let precision = Self::Duration(delta);
        precision.grid()?;
        Ok(precision)
    }
}

/// Rounding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rounding {
    /// Closest grid point; exact midpoints go up.
    #[default]
    Nearest,
    Up,
    Down,
}

impl FromStr for Rounding {
    type Err = RoundingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(RoundingError::InvalidPrecision(format!(
                "unsupported rounding `{other}`; expected nearest|up|down"
            ))),
        }
    }
}

/// Rounds `when` onto the grid described by `precision`.
///
/// Weekday grids never round backwards under `Nearest`: the result is the
/// same instant when it already sits on that weekday at midnight, otherwise
/// the following such midnight. `Down` returns the previous one.
///
/// # Errors
/// - [`RoundingError::InvalidPrecision`] for zero, negative or sub-second
///   durations.
/// - [`RoundingError::OutOfRange`] when the result is not representable.
pub fn round_datetime(
    when: DateTime<Utc>,
    precision: Precision,
    rounding: Rounding,
) -> Result<DateTime<Utc>, RoundingError> {
    let (step, origin) = precision.grid()?;
    // `timestamp()` floors, which strips the sub-second part.
    let seconds = when.timestamp();
    let remainder = (seconds - origin).rem_euclid(step);
    let floor = seconds - remainder;
    let ceiling = if remainder == 0 {
        Some(floor)
    } else {
        floor.checked_add(step)
    };

    let rounded = match (precision, rounding) {
        (_, Rounding::Down) => Some(floor),
        (_, Rounding::Up) | (Precision::Weekday(_), Rounding::Nearest) => ceiling,
        (Precision::Duration(_), Rounding::Nearest) => {
            if remainder * 2 >= step {
                ceiling
            } else {
                Some(floor)
            }
        }
    };

    rounded
        .and_then(|value| DateTime::from_timestamp(value, 0))
        .ok_or(RoundingError::OutOfRange)
}
