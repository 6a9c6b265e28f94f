//! Quire content cache
//!
//! Holds recently fetched content keyed by an opaque string (usually the
//! request path) and decides whether a request is served from memory or
//! triggers a fetch:
//!
//! - entries younger than the TTL are served as-is;
//! - stale or missing entries are refetched under a timeout;
//! - failed fetches store the not-found sentinel, so misses are cached too;
//! - inserting past capacity evicts arbitrary entries.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl_seconds = 60
//! max_entries = 10000
//! fetch_timeout_seconds = 10
//! ```

mod config;
pub(crate) mod lock;
mod lookup;
mod store;

pub use config::CacheConfig;
pub use lookup::CacheRoute;
pub use store::{CacheEntry, ContentCache};
