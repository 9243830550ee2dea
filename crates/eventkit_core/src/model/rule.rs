//! Repeat rule model.
//!
//! # Responsibility
//! - Parse `repeat_expression` text (`FREQ=DAILY;INTERVAL=1;COUNT=20`) into a
//!   typed rule.
//! - Render typed rules back to canonical RRULE text for expansion.
//!
//! # Invariants
//! - `interval >= 1`.
//! - COUNT and UNTIL are mutually exclusive; COUNT is never zero.
//! - Only FREQ/INTERVAL/COUNT/UNTIL parts are accepted.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Largest COUNT accepted; expansion limits are expressed as `u16`.
pub const MAX_COUNT: u32 = u16::MAX as u32;

const UNTIL_FORMAT: &str = "%Y%m%dT%H%M%S";
const UNTIL_DATE_FORMAT: &str = "%Y%m%d";

/// Errors raised while parsing or materializing a repeat rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// Rule text is malformed or uses an unsupported part.
    #[error("invalid repeat rule `{rule}`: {reason}")]
    Invalid { rule: String, reason: String },
    /// Rule has neither COUNT nor UNTIL and a full series was requested.
    #[error("repeat rule `{0}` has neither COUNT nor UNTIL and cannot be materialized")]
    Unbounded(String),
}

impl RuleError {
    fn invalid(rule: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

/// Frequency unit of a repeat rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    /// RRULE keyword for this frequency.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Secondly => "SECONDLY",
            Self::Minutely => "MINUTELY",
            Self::Hourly => "HOURLY",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
            Self::Monthly => "MONTHLY",
            Self::Yearly => "YEARLY",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "SECONDLY" => Some(Self::Secondly),
            "MINUTELY" => Some(Self::Minutely),
            "HOURLY" => Some(Self::Hourly),
            "DAILY" => Some(Self::Daily),
            "WEEKLY" => Some(Self::Weekly),
            "MONTHLY" => Some(Self::Monthly),
            "YEARLY" => Some(Self::Yearly),
            _ => None,
        }
    }
}

/// Termination bound of a repeat rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleBound {
    /// Exactly this many occurrences, the anchor included.
    Count(u32),
    /// Occurrences up to and including this instant.
    Until(DateTime<Utc>),
    /// No bound; only materializable with an explicit cap.
    Unbounded,
}

/// Typed recurrence rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatRule {
    pub frequency: Frequency,
    pub interval: u32,
    pub bound: RuleBound,
}

impl RepeatRule {
    /// Creates an unbounded rule stepping one `frequency` unit at a time.
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            bound: RuleBound::Unbounded,
        }
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.bound = RuleBound::Count(count);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.bound = RuleBound::Until(until);
        self
    }

    /// Parses rule text. An optional leading `RRULE:` is accepted.
    ///
    /// # Errors
    /// - [`RuleError::Invalid`] for unknown/duplicate parts, a missing or
    ///   unknown FREQ, non-positive INTERVAL/COUNT, or COUNT with UNTIL.
    pub fn parse(text: &str) -> Result<Self, RuleError> {
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix("RRULE:")
            .or_else(|| trimmed.strip_prefix("rrule:"))
            .unwrap_or(trimmed);
        if body.is_empty() {
            return Err(RuleError::invalid(text, "rule is empty"));
        }

        let mut frequency = None;
        let mut interval = None;
        let mut count = None;
        let mut until = None;

        for part in body.split(';').map(str::trim).filter(|part| !part.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| RuleError::invalid(text, format!("part `{part}` is not KEY=VALUE")))?;
            let key = key.trim().to_ascii_uppercase();
            let value = value.trim();
            match key.as_str() {
                "FREQ" => {
                    let parsed = Frequency::parse(value).ok_or_else(|| {
                        RuleError::invalid(text, format!("unknown frequency `{value}`"))
                    })?;
                    set_once(&mut frequency, parsed, text, "FREQ")?;
                }
                "INTERVAL" => {
                    let parsed = parse_positive(value, text, "INTERVAL")?;
                    set_once(&mut interval, parsed, text, "INTERVAL")?;
                }
                "COUNT" => {
                    let parsed = parse_positive(value, text, "COUNT")?;
                    if parsed > MAX_COUNT {
                        return Err(RuleError::invalid(
                            text,
                            format!("COUNT must not exceed {MAX_COUNT}"),
                        ));
                    }
                    set_once(&mut count, parsed, text, "COUNT")?;
                }
                "UNTIL" => {
                    let parsed = parse_until(value)
                        .ok_or_else(|| RuleError::invalid(text, format!("bad UNTIL `{value}`")))?;
                    set_once(&mut until, parsed, text, "UNTIL")?;
                }
                other => {
                    return Err(RuleError::invalid(
                        text,
                        format!("unsupported rule part `{other}`"),
                    ));
                }
            }
        }

        let frequency = frequency.ok_or_else(|| RuleError::invalid(text, "FREQ is required"))?;
        let bound = match (count, until) {
            (Some(_), Some(_)) => {
                return Err(RuleError::invalid(text, "COUNT and UNTIL are exclusive"));
            }
            (Some(count), None) => RuleBound::Count(count),
            (None, Some(until)) => RuleBound::Until(until),
            (None, None) => RuleBound::Unbounded,
        };

        Ok(Self {
            frequency,
            interval: interval.unwrap_or(1),
            bound,
        })
    }

    /// Returns whether the rule carries COUNT or UNTIL.
    pub fn is_bounded(&self) -> bool {
        !matches!(self.bound, RuleBound::Unbounded)
    }
}

impl FromStr for RepeatRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical RRULE text, e.g. `FREQ=DAILY;INTERVAL=1;COUNT=20`.
impl Display for RepeatRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FREQ={};INTERVAL={}",
            self.frequency.as_str(),
            self.interval
        )?;
        match self.bound {
            RuleBound::Count(count) => write!(f, ";COUNT={count}"),
            RuleBound::Until(until) => write!(f, ";UNTIL={}Z", until.format(UNTIL_FORMAT)),
            RuleBound::Unbounded => Ok(()),
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, rule: &str, key: &str) -> Result<(), RuleError> {
    if slot.is_some() {
        return Err(RuleError::invalid(rule, format!("duplicate {key}")));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_positive(value: &str, rule: &str, key: &str) -> Result<u32, RuleError> {
    match value.parse::<u32>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(RuleError::invalid(
            rule,
            format!("{key} must be a positive integer, got `{value}`"),
        )),
    }
}

fn parse_until(value: &str) -> Option<DateTime<Utc>> {
    let value = value.strip_suffix('Z').unwrap_or(value);
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, UNTIL_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    let date = NaiveDate::parse_from_str(value, UNTIL_DATE_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}
