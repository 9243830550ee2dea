//! Domain model for events and their repeat rules.
//!
//! # Responsibility
//! - Define canonical data structures used by core business logic.
//! - Keep series roles explicit instead of inferring them ad hoc.
//!
//! # Invariants
//! - Every event is identified by a stable `EventId`.
//! - A master never holds an owning reference to its children.

pub mod event;
pub mod rule;
