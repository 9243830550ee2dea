//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the store contract the propagation engine consumes.
//! - Isolate SQLite query details from service orchestration.
//!
//! # Invariants
//! - Repository writes enforce `Event::validate()` before persistence.
//! - Repository APIs return semantic errors (`NotFound`, `Busy`) in addition
//!   to DB transport errors.

pub mod event_repo;
