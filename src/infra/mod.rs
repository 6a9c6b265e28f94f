//! Infrastructure adapters: document stores and telemetry.

pub mod db;
pub mod error;
pub mod memory;
pub mod telemetry;
