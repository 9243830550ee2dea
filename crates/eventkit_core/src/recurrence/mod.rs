//! Recurrence expansion.
//!
//! # Responsibility
//! - Materialize repeat rules into occurrence instants for the engine.
//!
//! # Invariants
//! - Stateless and deterministic; safe to call from any thread.

pub mod expander;

pub use expander::{expand, expand_capped, expand_str, Occurrences};
