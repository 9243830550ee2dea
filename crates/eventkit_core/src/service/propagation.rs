//! Repeat series propagation engine.
//!
//! # Responsibility
//! - Materialize a master's children from its repeat rule.
//! - Classify every edit into one explicit [`SeriesTransition`] and apply
//!   its side effects on the stored series.
//!
//! # Invariants
//! - One reconciliation pass is all-or-nothing (single store transaction).
//! - A series is reconciled by at most one caller at a time.
//! - Reconciliation only resizes the tail of a series; children kept in
//!   range are never rewritten.
//! - COUNT rules are materialized in full; UNTIL rules beyond
//!   `max_occurrences` fail instead of being cut short.
//! - Events that left a series are never touched by its old master again.

use crate::config::EngineConfig;
use crate::model::event::{Event, EventId, EventValidationError, SeriesState};
use crate::model::rule::{RepeatRule, RuleBound, RuleError};
use crate::recurrence::{expand, expand_capped};
use crate::repo::event_repo::{EventRepository, RepoError};
use crate::service::series_lock::{SeriesLockTimeout, SeriesLocks};
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced to engine callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or unsupported repeat rule. Not retriable.
    #[error("invalid repeat rule: {0}")]
    InvalidRule(String),
    /// Rule lacks COUNT/UNTIL where a full series is required. Not retriable.
    #[error("unbounded repeat rule: {0}")]
    UnboundedRule(String),
    /// Referenced event or master does not exist. Not retriable.
    #[error("event not found: {0}")]
    NotFound(EventId),
    /// Series or database contention. Retriable with backoff.
    #[error("lock wait timed out: {0}")]
    LockTimeout(String),
    /// UNTIL rule yields more occurrences than `max_occurrences`. Not retriable.
    #[error("series of {master_id} exceeds {limit} occurrences")]
    OccurrenceLimit { master_id: EventId, limit: u16 },
    #[error(transparent)]
    Validation(#[from] EventValidationError),
    #[error(transparent)]
    Store(RepoError),
}

impl EngineError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

impl From<RuleError> for EngineError {
    fn from(value: RuleError) -> Self {
        match &value {
            RuleError::Invalid { .. } => Self::InvalidRule(value.to_string()),
            RuleError::Unbounded(_) => Self::UnboundedRule(value.to_string()),
        }
    }
}

impl From<RepoError> for EngineError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(id) => Self::NotFound(id),
            RepoError::Validation(err) => Self::Validation(err),
            RepoError::Busy(message) => Self::LockTimeout(message),
            other => Self::Store(other),
        }
    }
}

impl From<SeriesLockTimeout> for EngineError {
    fn from(value: SeriesLockTimeout) -> Self {
        Self::LockTimeout(value.to_string())
    }
}

/// Store mutations performed by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub created: usize,
    pub deleted: usize,
    /// Children left in place.
    pub kept: usize,
}

/// Series side effect of one `save_event` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesTransition {
    /// Field update only.
    Update,
    /// Rule unchanged (or newly added); reconcile on request.
    Propagate,
    /// Master rule replaced; series recomputed from the new rule.
    Reset,
    /// Rule cleared; former children become standalone.
    ///
    /// `detached_from` names the master an event carrying its own rule
    /// still pointed at; that link is cleared as well.
    Dissolve { detached_from: Option<EventId> },
    /// Child cut its master link.
    Detach {
        former_master: EventId,
        propagate: bool,
    },
    /// Child split off as master of a new series.
    Promote {
        former_master: EventId,
        propagate: bool,
    },
}

impl SeriesTransition {
    /// Classifies an edit of `stored` into `incoming`.
    pub fn classify(stored: &Event, incoming: &Event, propagate: bool) -> Result<Self, RuleError> {
        let incoming_rule = incoming.repeat_rule()?;

        if let SeriesState::Child { master_id } = stored.series_state() {
            return Ok(match incoming.master_id {
                None => Self::Detach {
                    former_master: master_id,
                    propagate: propagate && incoming_rule.is_some(),
                },
                Some(target) if target == master_id => {
                    if propagate || incoming_rule.is_some() {
                        Self::Promote {
                            former_master: master_id,
                            propagate,
                        }
                    } else {
                        Self::Update
                    }
                }
                Some(_) => Self::Update,
            });
        }

        let detached_from = match stored.series_state() {
            SeriesState::DetachedChild { master_id } if incoming.master_id == Some(master_id) => {
                Some(master_id)
            }
            _ => None,
        };

        let stored_rule = stored.repeat_rule().ok().flatten();
        Ok(match (stored.repeat_expression().is_some(), incoming_rule) {
            (true, None) => Self::Dissolve { detached_from },
            (true, Some(rule)) if stored_rule != Some(rule) => Self::Reset,
            (_, Some(_)) if propagate => Self::Propagate,
            _ => Self::Update,
        })
    }
}

/// Result of [`PropagationEngine::save_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOutcome {
    pub transition: SeriesTransition,
    /// Present when a series was reconciled.
    pub report: Option<PropagationReport>,
}

/// Owns the lifecycle of repeat series on top of an event store.
pub struct PropagationEngine<R: EventRepository> {
    repo: R,
    locks: Arc<SeriesLocks>,
    config: EngineConfig,
}

impl<R: EventRepository> PropagationEngine<R> {
    /// Creates an engine with default config and a private lock registry.
    pub fn new(repo: R) -> Self {
        Self::with_config(repo, EngineConfig::default(), Arc::new(SeriesLocks::new()))
    }

    /// Creates an engine sharing `locks` with other engines on the same store.
    pub fn with_config(repo: R, config: EngineConfig, locks: Arc<SeriesLocks>) -> Self {
        Self {
            repo,
            locks,
            config,
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persists a new event without materializing any children.
    ///
    /// # Errors
    /// - `InvalidRule` when the rule text does not parse.
    /// - `NotFound` when `master_id` points at a missing event.
    pub fn create_master(&self, event: &Event) -> EngineResult<EventId> {
        event.validate()?;
        event.repeat_rule()?;

        let id = self.repo.atomically(|| {
            if let Some(master_id) = event.master_id {
                self.load_master(event.id, master_id)?;
            }
            Ok::<_, EngineError>(self.repo.insert_event(event)?)
        })?;

        info!(
            "event=event_create module=engine status=ok event_id={} recurring={}",
            id,
            event.repeat_expression().is_some()
        );
        Ok(id)
    }

    pub fn get_event(&self, id: EventId) -> EngineResult<Event> {
        self.load(id)
    }

    /// Lists the attached children of `master_id` by start ascending.
    pub fn repeat_events(&self, master_id: EventId) -> EngineResult<Vec<Event>> {
        self.load(master_id)?;
        Ok(self.repo.query_children(master_id)?)
    }

    /// Converges the stored series of `master_id` to its rule.
    ///
    /// # Errors
    /// - `NotFound` when the event is missing or carries no rule.
    /// - `InvalidRule`/`UnboundedRule` when the rule cannot be materialized.
    /// - `LockTimeout` when another pass holds the series too long.
    pub fn propagate(&self, master_id: EventId) -> EngineResult<PropagationReport> {
        let _guard = self.locks.acquire(master_id, self.config.lock_timeout())?;
        self.repo.atomically(|| self.reconcile(master_id))
    }

    /// Persists an edit and applies its series side effects.
    ///
    /// See [`SeriesTransition`] for the possible outcomes.
    pub fn save_event(&self, event: &Event, propagate: bool) -> EngineResult<SaveOutcome> {
        event.validate()?;
        event.repeat_rule()?;

        let stored = self.load(event.id)?;
        let scope = series_scope(&stored, event);
        let _guards = self.locks.acquire_all(&scope, self.config.lock_timeout())?;

        let outcome = self.repo.atomically(|| {
            let stored = self.load(event.id)?;
            if !series_scope(&stored, event)
                .iter()
                .all(|id| scope.contains(id))
            {
                return Err(EngineError::LockTimeout(format!(
                    "series membership of {} changed while waiting",
                    event.id
                )));
            }

            let transition = SeriesTransition::classify(&stored, event, propagate)?;
            let report = self.apply(&stored, event, transition)?;
            Ok(SaveOutcome { transition, report })
        })?;

        info!(
            "event=event_save module=engine status=ok event_id={} transition={:?}",
            event.id, outcome.transition
        );
        Ok(outcome)
    }

    /// Deletes one event; its children become standalone.
    pub fn delete_event(&self, id: EventId) -> EngineResult<()> {
        let stored = self.load(id)?;
        let mut scope = vec![id];
        scope.extend(stored.master_id);
        let _guards = self.locks.acquire_all(&scope, self.config.lock_timeout())?;

        self.repo.delete_event(id)?;
        info!("event=event_delete module=engine status=ok event_id={id}");
        Ok(())
    }

    fn apply(
        &self,
        stored: &Event,
        event: &Event,
        transition: SeriesTransition,
    ) -> EngineResult<Option<PropagationReport>> {
        match transition {
            SeriesTransition::Update => {
                self.persist(stored, event)?;
                Ok(None)
            }
            SeriesTransition::Propagate | SeriesTransition::Reset => {
                self.persist(stored, event)?;
                self.reconcile(event.id).map(Some)
            }
            SeriesTransition::Dissolve { detached_from } => {
                let mut dissolved = event.clone();
                if detached_from.is_some() {
                    dissolved.master_id = None;
                }
                self.persist(stored, &dissolved)?;
                let released = self.repo.orphan_children(event.id)?;
                info!(
                    "event=series_dissolve module=engine status=ok master_id={} released={} detached={}",
                    event.id,
                    released,
                    detached_from.is_some()
                );
                Ok(None)
            }
            SeriesTransition::Detach {
                former_master,
                propagate,
            } => {
                self.persist(stored, event)?;
                info!(
                    "event=series_detach module=engine status=ok event_id={} former_master={}",
                    event.id, former_master
                );
                if propagate {
                    return self.reconcile(event.id).map(Some);
                }
                Ok(None)
            }
            SeriesTransition::Promote {
                former_master,
                propagate,
            } => self.promote(stored, event, former_master, propagate),
        }
    }

    /// Severs `event` from its master. When propagating, the old series is
    /// cut at the promoted position and the new one is materialized from the
    /// promoted event's own anchor. The rule is inherited from the old master
    /// when absent.
    fn promote(
        &self,
        stored: &Event,
        event: &Event,
        former_master_id: EventId,
        propagate: bool,
    ) -> EngineResult<Option<PropagationReport>> {
        let former_master = self.load(former_master_id)?;
        let mut promoted = event.clone();
        promoted.master_id = None;
        if promoted.repeat_expression().is_none() {
            promoted.repeat_expression = former_master.repeat_expression.clone();
        }
        self.repo.update_event(&promoted)?;

        if !propagate || promoted.repeat_expression().is_none() {
            return Ok(None);
        }

        let mut truncated = 0;
        for sibling in self.repo.query_children(former_master_id)? {
            if (sibling.start, sibling.id) > (stored.start, stored.id) {
                self.repo.delete_event(sibling.id)?;
                truncated += 1;
            }
        }
        info!(
            "event=series_promote module=engine status=ok event_id={} former_master={} truncated={}",
            promoted.id, former_master_id, truncated
        );

        self.reconcile(promoted.id).map(Some)
    }

    /// Writes `event` over `stored`, checking a newly set master link.
    fn persist(&self, stored: &Event, event: &Event) -> EngineResult<()> {
        match event.master_id {
            Some(master_id) if stored.master_id != Some(master_id) => {
                self.load_master(event.id, master_id)?;
            }
            _ => {}
        }
        self.repo.update_event(event)?;
        Ok(())
    }

    /// Loads the event `id` is about to point at. Masters must not point at
    /// another master themselves, which keeps links one level deep and
    /// acyclic.
    fn load_master(&self, id: EventId, master_id: EventId) -> EngineResult<Event> {
        let master = self.load(master_id)?;
        if let Some(grand_master) = master.master_id {
            return Err(EventValidationError::NestedMaster {
                id,
                master_id,
                grand_master,
            }
            .into());
        }
        Ok(master)
    }

    /// One read-reconcile-write pass. Callers hold the series lock and an
    /// open transaction.
    fn reconcile(&self, master_id: EventId) -> EngineResult<PropagationReport> {
        let master = self.load(master_id)?;
        let rule = master
            .repeat_rule()?
            .ok_or(EngineError::NotFound(master_id))?;
        let target = self.target_starts(&master, &rule)?;

        let mut children = self.repo.query_children(master_id)?;
        let excess = children.split_off(children.len().min(target.len()));
        for child in &excess {
            self.repo.delete_event(child.id)?;
        }

        // Missing tail positions take their own target timestamp; a slot a
        // kept child already occupies is not doubled.
        let occupied: HashSet<DateTime<Utc>> = children.iter().map(|child| child.start).collect();
        let mut created = 0;
        for start in &target[children.len()..] {
            if occupied.contains(start) {
                continue;
            }
            self.repo.insert_event(&master.project_to_child(*start))?;
            created += 1;
        }

        let report = PropagationReport {
            created,
            deleted: excess.len(),
            kept: children.len(),
        };
        info!(
            "event=propagate module=engine status=ok master_id={} target={} created={} deleted={} kept={}",
            master_id,
            target.len(),
            report.created,
            report.deleted,
            report.kept
        );
        Ok(report)
    }

    /// Occurrence starts of the series, the master's own anchor excluded.
    fn target_starts(
        &self,
        master: &Event,
        rule: &RepeatRule,
    ) -> EngineResult<Vec<DateTime<Utc>>> {
        if !rule.is_bounded() {
            return Err(RuleError::Unbounded(rule.to_string()).into());
        }

        let occurrences = match rule.bound {
            RuleBound::Count(_) => expand(master.start, rule)?,
            RuleBound::Until(_) | RuleBound::Unbounded => {
                let limit = self.config.max_occurrences;
                let occurrences = expand_capped(master.start, rule, limit.saturating_add(1))?;
                if occurrences.is_truncated() {
                    warn!(
                        "event=propagate module=engine status=error master_id={} error_code=occurrence_limit max_occurrences={}",
                        master.id, limit
                    );
                    return Err(EngineError::OccurrenceLimit {
                        master_id: master.id,
                        limit,
                    });
                }
                occurrences
            }
        };
        Ok(occurrences.filter(|start| *start != master.start).collect())
    }

    fn load(&self, id: EventId) -> EngineResult<Event> {
        self.repo.get_event(id)?.ok_or(EngineError::NotFound(id))
    }
}

/// Series whose lock an edit of `stored` into `incoming` needs.
fn series_scope(stored: &Event, incoming: &Event) -> Vec<EventId> {
    let mut scope = vec![incoming.id];
    scope.extend(stored.master_id);
    scope.extend(incoming.master_id);
    scope
}

#[cfg(test)]
mod tests {
    use super::{EngineError, SeriesTransition};
    use crate::model::event::Event;
    use crate::model::rule::RuleError;
    use crate::repo::event_repo::RepoError;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn child_of(master_id: Uuid) -> Event {
        let mut child = Event::new("occurrence", Utc.with_ymd_and_hms(2000, 1, 2, 0, 0, 0).unwrap());
        child.master_id = Some(master_id);
        child
    }

    #[test]
    fn classifies_child_edits() {
        let master_id = Uuid::new_v4();
        let stored = child_of(master_id);

        let mut retitled = stored.clone();
        retitled.title = "renamed".to_string();
        assert_eq!(
            SeriesTransition::classify(&stored, &retitled, false).unwrap(),
            SeriesTransition::Update
        );
        assert_eq!(
            SeriesTransition::classify(&stored, &retitled, true).unwrap(),
            SeriesTransition::Promote {
                former_master: master_id,
                propagate: true
            }
        );

        let mut unlinked = stored.clone();
        unlinked.master_id = None;
        assert_eq!(
            SeriesTransition::classify(&stored, &unlinked, true).unwrap(),
            SeriesTransition::Detach {
                former_master: master_id,
                propagate: false
            }
        );

        let own_rule = stored.clone().with_repeat("FREQ=DAILY;COUNT=3");
        assert_eq!(
            SeriesTransition::classify(&stored, &own_rule, false).unwrap(),
            SeriesTransition::Promote {
                former_master: master_id,
                propagate: false
            }
        );
    }

    #[test]
    fn classifies_master_edits() {
        let stored = Event::new("series", Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap())
            .with_repeat("FREQ=DAILY;COUNT=5");

        let same_rule_reordered = stored.clone().with_repeat("COUNT=5;FREQ=DAILY;INTERVAL=1");
        assert_eq!(
            SeriesTransition::classify(&stored, &same_rule_reordered, false).unwrap(),
            SeriesTransition::Update
        );
        assert_eq!(
            SeriesTransition::classify(&stored, &same_rule_reordered, true).unwrap(),
            SeriesTransition::Propagate
        );

        let shorter = stored.clone().with_repeat("FREQ=DAILY;COUNT=2");
        assert_eq!(
            SeriesTransition::classify(&stored, &shorter, false).unwrap(),
            SeriesTransition::Reset
        );

        let mut cleared = stored.clone();
        cleared.repeat_expression = None;
        assert_eq!(
            SeriesTransition::classify(&stored, &cleared, true).unwrap(),
            SeriesTransition::Dissolve {
                detached_from: None
            }
        );
    }

    #[test]
    fn clearing_own_rule_of_linked_event_detaches_it() {
        let master_id = Uuid::new_v4();
        let stored = child_of(master_id).with_repeat("FREQ=DAILY;COUNT=2");

        let mut cleared = stored.clone();
        cleared.repeat_expression = None;
        assert_eq!(
            SeriesTransition::classify(&stored, &cleared, false).unwrap(),
            SeriesTransition::Dissolve {
                detached_from: Some(master_id)
            }
        );

        let relinked = Uuid::new_v4();
        cleared.master_id = Some(relinked);
        assert_eq!(
            SeriesTransition::classify(&stored, &cleared, false).unwrap(),
            SeriesTransition::Dissolve {
                detached_from: None
            }
        );
    }

    #[test]
    fn classifies_standalone_edits() {
        let stored = Event::new("one-off", Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap());
        let recurring = stored.clone().with_repeat("FREQ=WEEKLY;COUNT=2");
        assert_eq!(
            SeriesTransition::classify(&stored, &recurring, false).unwrap(),
            SeriesTransition::Update
        );
        assert_eq!(
            SeriesTransition::classify(&stored, &recurring, true).unwrap(),
            SeriesTransition::Propagate
        );
        assert_eq!(
            SeriesTransition::classify(&stored, &stored, true).unwrap(),
            SeriesTransition::Update
        );
    }

    #[test]
    fn error_mapping_keeps_taxonomy() {
        let invalid: EngineError = RuleError::Invalid {
            rule: "x".to_string(),
            reason: "y".to_string(),
        }
        .into();
        assert!(matches!(invalid, EngineError::InvalidRule(_)));

        let unbounded: EngineError = RuleError::Unbounded("FREQ=DAILY".to_string()).into();
        assert!(matches!(unbounded, EngineError::UnboundedRule(_)));

        let id = Uuid::new_v4();
        assert!(matches!(
            EngineError::from(RepoError::NotFound(id)),
            EngineError::NotFound(found) if found == id
        ));

        let busy = EngineError::from(RepoError::Busy("database is locked".to_string()));
        assert!(busy.is_retriable());
        assert!(!unbounded.is_retriable());
    }
}
