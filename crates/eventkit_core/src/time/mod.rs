//! Time normalization helpers.

pub mod round;

pub use round::{round_datetime, Precision, Rounding, RoundingError};
