//! Entry map for the content cache.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;

use crate::application::content::Content;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Content stored under a key together with when it was fetched.
///
/// Entries are never mutated; a refetch replaces the whole entry.
#[derive(Clone)]
pub struct CacheEntry {
    pub fetched_at: Instant,
    pub content: Content,
}

impl CacheEntry {
    pub fn new(content: Content) -> Self {
        Self {
            fetched_at: Instant::now(),
            content,
        }
    }

    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) < ttl
    }
}

/// Bounded TTL cache of renderable content, keyed by an opaque string.
///
/// Reads share the lock; inserts and evictions take it exclusively. The lock
/// is never held while a fetch runs.
pub struct ContentCache {
    config: CacheConfig,
    limit: NonZeroUsize,
    entries: RwLock<HashMap<String, CacheEntry>>,
    not_found: Content,
}

impl ContentCache {
    /// `not_found` is stored in place of content whose fetch failed.
    pub fn new(config: CacheConfig, not_found: Content) -> Self {
        let limit = config.max_entries_non_zero();
        Self {
            config,
            limit,
            entries: RwLock::new(HashMap::new()),
            not_found,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn not_found(&self) -> Content {
        Arc::clone(&self.not_found)
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        rw_read(&self.entries, SOURCE, "get").get(key).cloned()
    }

    /// Insert or replace the entry for `key`.
    ///
    /// When a new key would push the map past capacity, arbitrary existing
    /// entries are dropped until it fits. Which ones is left to the map's
    /// iteration order: this is neither LRU nor FIFO. Returns how many
    /// entries were evicted.
    pub fn put(&self, key: String, entry: CacheEntry) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "put");

        let mut evicted = 0;
        if !entries.contains_key(&key) {
            let excess = (entries.len() + 1).saturating_sub(self.limit.get());
            if excess > 0 {
                let victims: Vec<String> = entries.keys().take(excess).cloned().collect();
                for victim in &victims {
                    entries.remove(victim);
                }
                evicted = victims.len();
            }
        }
        entries.insert(key, entry);
        drop(entries);

        if evicted > 0 {
            counter!("quire_cache_evict_total").increment(evicted as u64);
        }
        evicted
    }

    pub fn invalidate(&self, key: &str) -> bool {
        rw_write(&self.entries, SOURCE, "invalidate")
            .remove(key)
            .is_some()
    }

    pub fn invalidate_all(&self) {
        rw_write(&self.entries, SOURCE, "invalidate_all").clear();
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::application::content::StaticContent;

    fn content(body: &'static str) -> Content {
        Arc::new(StaticContent::html(body))
    }

    fn cache_with_limit(max_entries: usize) -> ContentCache {
        let config = CacheConfig {
            max_entries,
            ..Default::default()
        };
        ContentCache::new(config, content("not found"))
    }

    #[test]
    fn put_then_get_returns_same_content() {
        let cache = cache_with_limit(4);
        let stored = content("hello");
        cache.put("/hello".to_string(), CacheEntry::new(Arc::clone(&stored)));

        let entry = cache.get("/hello").expect("cached entry");
        assert!(std::ptr::addr_eq(
            Arc::as_ptr(&entry.content),
            Arc::as_ptr(&stored)
        ));
        assert!(cache.get("/other").is_none());
    }

    #[test]
    fn size_stays_bounded() {
        let cache = cache_with_limit(3);
        for i in 0..50 {
            cache.put(format!("/page-{i}"), CacheEntry::new(content("x")));
            assert!(cache.len() <= 3);
        }
        // The entry just written always survives its own insertion.
        assert!(cache.get("/page-49").is_some());
    }

    #[test]
    fn parallel_puts_stay_bounded() {
        let cache = cache_with_limit(8);
        std::thread::scope(|scope| {
            for worker in 0..8 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..500 {
                        cache.put(format!("/w{worker}/{i}"), CacheEntry::new(content("x")));
                        assert!(cache.len() <= 8);
                    }
                });
            }
        });
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn replacing_a_key_evicts_nothing() {
        let cache = cache_with_limit(2);
        cache.put("/a".to_string(), CacheEntry::new(content("a")));
        cache.put("/b".to_string(), CacheEntry::new(content("b")));

        assert_eq!(cache.put("/a".to_string(), CacheEntry::new(content("a2"))), 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn zero_capacity_still_holds_one_entry() {
        let cache = cache_with_limit(0);
        cache.put("/a".to_string(), CacheEntry::new(content("a")));
        cache.put("/b".to_string(), CacheEntry::new(content("b")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidation_removes_entries() {
        let cache = cache_with_limit(4);
        cache.put("/a".to_string(), CacheEntry::new(content("a")));
        cache.put("/b".to_string(), CacheEntry::new(content("b")));

        assert!(cache.invalidate("/a"));
        assert!(!cache.invalidate("/a"));
        assert_eq!(cache.len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn freshness_is_strictly_less_than_ttl() {
        let entry = CacheEntry::new(content("a"));
        let ttl = Duration::from_secs(60);

        assert!(entry.is_fresh(ttl, entry.fetched_at + Duration::from_secs(59)));
        assert!(!entry.is_fresh(ttl, entry.fetched_at + ttl));
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let cache = cache_with_limit(4);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = cache
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        cache.put("/a".to_string(), CacheEntry::new(content("a")));
        assert!(cache.get("/a").is_some());
    }
}
