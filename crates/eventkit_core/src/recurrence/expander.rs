//! Repeat rule expansion.
//!
//! # Responsibility
//! - Turn an anchor instant plus a [`RepeatRule`] into concrete occurrence
//!   instants.
//!
//! # Invariants
//! - Output starts at the anchor and is strictly increasing.
//! - COUNT rules yield exactly COUNT instants; UNTIL is inclusive.
//! - Expansion never reads the clock.
//! - Rules without COUNT/UNTIL are only expanded with an explicit cap.

use crate::model::rule::{RepeatRule, RuleBound, RuleError};
use chrono::{DateTime, TimeDelta, Utc};
use rrule::RRuleSet;

/// Finite sequence of occurrence instants, ascending.
#[derive(Debug, Clone)]
pub struct Occurrences {
    inner: std::vec::IntoIter<DateTime<Utc>>,
    truncated: bool,
}

impl Occurrences {
    fn empty() -> Self {
        Self {
            inner: Vec::new().into_iter(),
            truncated: false,
        }
    }

    /// Returns whether the cap cut the series short.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for Occurrences {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Occurrences {}

/// Expands a bounded rule completely.
///
/// # Errors
/// - [`RuleError::Unbounded`] when the rule has neither COUNT nor UNTIL.
/// - [`RuleError::Invalid`] when the rule cannot be expanded.
pub fn expand(anchor: DateTime<Utc>, rule: &RepeatRule) -> Result<Occurrences, RuleError> {
    if !rule.is_bounded() {
        return Err(RuleError::Unbounded(rule.to_string()));
    }
    expand_capped(anchor, rule, u16::MAX)
}

/// Parses `expression` and expands it completely.
pub fn expand_str(anchor: DateTime<Utc>, expression: &str) -> Result<Occurrences, RuleError> {
    expand(anchor, &RepeatRule::parse(expression)?)
}

/// Expands at most `cap` occurrences of any rule, bounded or not.
///
/// # Errors
/// - [`RuleError::Invalid`] when the rule cannot be expanded.
pub fn expand_capped(
    anchor: DateTime<Utc>,
    rule: &RepeatRule,
    cap: u16,
) -> Result<Occurrences, RuleError> {
    let limit = match rule.bound {
        RuleBound::Count(count) => u16::try_from(count).unwrap_or(u16::MAX).min(cap),
        RuleBound::Until(until) if until < anchor => return Ok(Occurrences::empty()),
        RuleBound::Until(_) | RuleBound::Unbounded => cap,
    };
    if limit == 0 {
        return Ok(Occurrences::empty());
    }

    // DTSTART carries whole seconds; the fraction is re-applied afterwards.
    let fraction = TimeDelta::nanoseconds(i64::from(anchor.timestamp_subsec_nanos()));
    let whole_anchor = anchor - fraction;

    let rrule_text = format!(
        "DTSTART:{}\nRRULE:{}",
        whole_anchor.format("%Y%m%dT%H%M%SZ"),
        rule
    );
    let rrule_set: RRuleSet = rrule_text.parse().map_err(|err| RuleError::Invalid {
        rule: rule.to_string(),
        reason: format!("{err}"),
    })?;

    let result = rrule_set.all(limit);
    let dates: Vec<DateTime<Utc>> = result
        .dates
        .iter()
        .map(|occurrence| occurrence.with_timezone(&Utc) + fraction)
        .collect();
    let count_reached = matches!(rule.bound, RuleBound::Count(count) if dates.len() as u32 >= count);

    Ok(Occurrences {
        truncated: dates.len() == usize::from(limit) && !count_reached,
        inner: dates.into_iter(),
    })
}

#[cfg(test)]
mod tests {
    use super::{expand, expand_capped, expand_str};
    use crate::model::rule::{Frequency, RepeatRule, RuleError};
    use chrono::{TimeDelta, TimeZone, Utc};

    #[test]
    fn daily_count_starts_at_anchor() {
        let anchor = Utc.with_ymd_and_hms(1999, 12, 31, 9, 30, 0).unwrap();
        let dates: Vec<_> = expand_str(anchor, "FREQ=DAILY;INTERVAL=1;COUNT=20")
            .unwrap()
            .collect();
        assert_eq!(dates.len(), 20);
        assert_eq!(dates[0], anchor);
        assert_eq!(dates[19], anchor + TimeDelta::days(19));
    }

    #[test]
    fn until_is_inclusive() {
        let anchor = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let dates: Vec<_> = expand_str(anchor, "FREQ=DAILY;INTERVAL=2;UNTIL=20000105T000000Z")
            .unwrap()
            .collect();
        assert_eq!(
            dates,
            vec![
                anchor,
                anchor + TimeDelta::days(2),
                anchor + TimeDelta::days(4)
            ]
        );
    }

    #[test]
    fn until_before_anchor_is_empty() {
        let anchor = Utc.with_ymd_and_hms(2000, 1, 10, 0, 0, 0).unwrap();
        let occurrences = expand_str(anchor, "FREQ=DAILY;UNTIL=20000101").unwrap();
        assert_eq!(occurrences.len(), 0);
    }

    #[test]
    fn unbounded_rule_requires_cap() {
        let anchor = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let rule = RepeatRule::new(Frequency::Weekly);
        assert!(matches!(
            expand(anchor, &rule),
            Err(RuleError::Unbounded(_))
        ));

        let capped = expand_capped(anchor, &rule, 5).unwrap();
        assert!(capped.is_truncated());
        let dates: Vec<_> = capped.collect();
        assert_eq!(dates.len(), 5);
        assert_eq!(dates[4], anchor + TimeDelta::weeks(4));
    }

    #[test]
    fn cap_below_count_reports_truncation() {
        let anchor = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let rule = RepeatRule::new(Frequency::Hourly).with_count(10);
        let capped = expand_capped(anchor, &rule, 4).unwrap();
        assert!(capped.is_truncated());
        assert_eq!(capped.len(), 4);

        let full = expand(anchor, &rule).unwrap();
        assert!(!full.is_truncated());
        assert_eq!(full.len(), 10);
    }

    #[test]
    fn sub_second_anchor_is_preserved() {
        let anchor = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap() + TimeDelta::milliseconds(250);
        let dates: Vec<_> = expand_str(anchor, "FREQ=MINUTELY;COUNT=2").unwrap().collect();
        assert_eq!(dates, vec![anchor, anchor + TimeDelta::minutes(1)]);
    }

    #[test]
    fn malformed_rule_is_invalid() {
        let anchor = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            expand_str(anchor, "FREQ=SOMETIMES;COUNT=2"),
            Err(RuleError::Invalid { .. })
        ));
    }
}
