//! Domain layer types and invariants.

pub mod chain;
pub mod entities;
pub mod error;
