//! Series-level services on top of the event store.
//!
//! # Responsibility
//! - Own the repeat series lifecycle (propagation, detach, promote).
//! - Serialize concurrent work on the same series.

pub mod propagation;
pub mod series_lock;

pub use propagation::{
    EngineError, EngineResult, PropagationEngine, PropagationReport, SaveOutcome,
    SeriesTransition,
};
pub use series_lock::{SeriesGuard, SeriesLockTimeout, SeriesLocks};
