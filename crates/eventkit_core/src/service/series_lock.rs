//! Per-series mutual exclusion.
//!
//! # Responsibility
//! - Serialize read-reconcile-write passes that touch the same master's
//!   series.
//!
//! # Invariants
//! - At most one guard exists per master ID at any time.
//! - Waiting is bounded; callers get [`SeriesLockTimeout`] instead of
//!   blocking forever.
//! - Multi-series acquisition always locks in ascending ID order.

use crate::model::event::EventId;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lock wait exceeded its bound.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("series {master_id} still locked after {waited_ms} ms")]
pub struct SeriesLockTimeout {
    pub master_id: EventId,
    pub waited_ms: u128,
}

/// Registry of series currently being reconciled.
///
/// Share one instance (behind `Arc`) between every engine that writes to
/// the same store.
#[derive(Debug, Default)]
pub struct SeriesLocks {
    held: Mutex<HashSet<EventId>>,
    released: Condvar,
}

/// Holds one series lock until dropped.
#[derive(Debug)]
pub struct SeriesGuard<'a> {
    locks: &'a SeriesLocks,
    master_id: EventId,
}

impl SeriesLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the series of `master_id`, waiting at most `timeout`.
    pub fn acquire(
        &self,
        master_id: EventId,
        timeout: Duration,
    ) -> Result<SeriesGuard<'_>, SeriesLockTimeout> {
        let started_at = Instant::now();
        let deadline = started_at + timeout;
        let mut held = self.held();

        while held.contains(&master_id) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SeriesLockTimeout {
                    master_id,
                    waited_ms: started_at.elapsed().as_millis(),
                });
            }
            held = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        held.insert(master_id);
        Ok(SeriesGuard {
            locks: self,
            master_id,
        })
    }

    /// Locks several series in ascending ID order.
    ///
    /// Already acquired guards are released when a later one times out.
    pub fn acquire_all(
        &self,
        master_ids: &[EventId],
        timeout: Duration,
    ) -> Result<Vec<SeriesGuard<'_>>, SeriesLockTimeout> {
        let mut ordered = master_ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let deadline = Instant::now() + timeout;
        let mut guards = Vec::with_capacity(ordered.len());
        for master_id in ordered {
            let remaining = deadline.saturating_duration_since(Instant::now());
            guards.push(self.acquire(master_id, remaining)?);
        }
        Ok(guards)
    }

    /// Returns whether `master_id` is currently locked.
    pub fn is_locked(&self, master_id: EventId) -> bool {
        self.held().contains(&master_id)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<EventId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SeriesGuard<'_> {
    pub fn master_id(&self) -> EventId {
        self.master_id
    }
}

impl Drop for SeriesGuard<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.master_id);
        self.locks.released.notify_all();
    }
}
