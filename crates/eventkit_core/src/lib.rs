//! Calendar event core for eventkit.
//!
//! Time rounding, repeat rule expansion and repeat series propagation over
//! a SQLite event store.

pub mod clock;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod recurrence;
pub mod repo;
pub mod service;
pub mod time;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use db::{open_db, open_db_in_memory, DbError};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::event::{Event, EventId, EventValidationError, SeriesState};
pub use model::rule::{Frequency, RepeatRule, RuleBound, RuleError};
pub use recurrence::{expand, expand_capped, expand_str, Occurrences};
pub use repo::event_repo::{EventRepository, RepoError, RepoResult, SqliteEventRepository};
pub use service::{
    EngineError, EngineResult, PropagationEngine, PropagationReport, SaveOutcome,
    SeriesLocks, SeriesTransition,
};
pub use time::{round_datetime, Precision, Rounding, RoundingError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
