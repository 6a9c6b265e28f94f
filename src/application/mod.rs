//! Application services: content fetching, the page cache's inputs, and chain upkeep.

pub mod chain;
pub mod content;
pub mod error;
pub mod page;
pub mod repos;
