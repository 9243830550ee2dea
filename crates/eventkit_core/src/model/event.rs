//! Event domain model.
//!
//! # Responsibility
//! - Define the canonical event record shared by masters, children and
//!   standalone events.
//! - Derive the series role of an event as a tagged state.
//! - Project master fields onto generated children.
//!
//! # Invariants
//! - `id` is stable and never reused for another event.
//! - `end` is not earlier than `start` when set.
//! - `master_id` is a non-owning reference; it never points at the event
//!   itself.

use crate::model::rule::{RepeatRule, RuleError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier for every event.
pub type EventId = Uuid;

/// Structural validation failures for [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventValidationError {
    #[error("event {id} ends at {end} before it starts at {start}")]
    EndBeforeStart {
        id: EventId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("event {0} cannot be its own master")]
    SelfReference(EventId),
    /// Target master is itself linked to another event.
    #[error("event {id} cannot point at {master_id}, which already points at {grand_master}")]
    NestedMaster {
        id: EventId,
        master_id: EventId,
        grand_master: EventId,
    },
}

/// Role of an event inside (or outside) a repeat series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesState {
    /// Neither a master nor linked to one.
    Standalone,
    /// Carries a repeat rule and owns the events that point back at it.
    Master,
    /// Generated from (and still passive inside) a master's series.
    Child { master_id: EventId },
    /// Still points at a master but carries its own rule, so the old
    /// master's reconciliation no longer sees it.
    DetachedChild { master_id: EventId },
}

/// Canonical event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub title: String,
    pub description: String,
    pub location: Option<String>,
    /// Persisted with millisecond precision; finer parts are dropped.
    pub start: DateTime<Utc>,
    /// `None` means a point-in-time event. Millisecond precision like `start`.
    pub end: Option<DateTime<Utc>>,
    /// Recurrence rule text; blank text is treated as absent.
    pub repeat_expression: Option<String>,
    pub master_id: Option<EventId>,
    /// Stamped by the store on insert.
    pub created: DateTime<Utc>,
    /// Stamped by the store on every mutation.
    pub modified: DateTime<Utc>,
}

impl Event {
    /// Creates a standalone event with a generated ID.
    ///
    /// `created`/`modified` hold `DateTime::MIN_UTC` until the store stamps
    /// them.
    pub fn new(title: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self::with_id(Uuid::new_v4(), title, start)
    }

    /// Creates a standalone event with a caller-provided ID.
    pub fn with_id(id: EventId, title: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            location: None,
            start,
            end: None,
            repeat_expression: None,
            master_id: None,
            created: DateTime::<Utc>::MIN_UTC,
            modified: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_repeat(mut self, expression: impl Into<String>) -> Self {
        self.repeat_expression = Some(expression.into());
        self
    }

    /// Checks structural invariants before persistence.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if let Some(end) = self.end {
            if end < self.start {
                return Err(EventValidationError::EndBeforeStart {
                    id: self.id,
                    start: self.start,
                    end,
                });
            }
        }
        if self.master_id == Some(self.id) {
            return Err(EventValidationError::SelfReference(self.id));
        }
        Ok(())
    }

    /// Rule text with blank values normalized away.
    pub fn repeat_expression(&self) -> Option<&str> {
        self.repeat_expression
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Parses the rule text, if any.
    pub fn repeat_rule(&self) -> Result<Option<RepeatRule>, RuleError> {
        self.repeat_expression().map(RepeatRule::parse).transpose()
    }

    pub fn series_state(&self) -> SeriesState {
        match (self.master_id, self.repeat_expression().is_some()) {
            (None, false) => SeriesState::Standalone,
            (None, true) => SeriesState::Master,
            (Some(master_id), false) => SeriesState::Child { master_id },
            (Some(master_id), true) => SeriesState::DetachedChild { master_id },
        }
    }

    /// Length of the occupied range, zero for point events.
    pub fn duration(&self) -> TimeDelta {
        self.end
            .map_or_else(TimeDelta::zero, |end| end - self.start)
    }

    /// Builds a new child of this event occurring at `start`.
    ///
    /// Propagated fields are listed explicitly: `title`, `description`,
    /// `location` and the event duration. Identity, timestamps, the master
    /// link and the rule are never copied.
    pub fn project_to_child(&self, start: DateTime<Utc>) -> Event {
        let mut child = Event::new(self.title.clone(), start);
        child.description = self.description.clone();
        child.location = self.location.clone();
        child.end = self.end.map(|_| start + self.duration());
        child.master_id = Some(self.id);
        child
    }
}
