//! Cache-or-fetch path used for every cacheable request.

use std::sync::Arc;

use metrics::counter;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::application::content::{
    Content, ContentSink, FetchError, Fetcher, PathParams, RequestContext,
};

use super::store::{CacheEntry, ContentCache};

const SOURCE: &str = "cache::lookup";

impl ContentCache {
    /// Serve a fresh entry for `key`, or fetch, store and return new content.
    ///
    /// Fetch errors and timeouts never reach the caller: they are logged and
    /// the not-found sentinel is cached under `key` for a full TTL.
    ///
    /// Concurrent misses on the same key each run the fetcher; there is no
    /// request coalescing.
    pub async fn lookup_or_fetch(
        &self,
        key: &str,
        fetcher: &dyn Fetcher,
        params: &PathParams,
    ) -> Content {
        if let Some(entry) = self.get(key) {
            if entry.is_fresh(self.config().ttl, Instant::now()) {
                counter!("quire_cache_hit_total").increment(1);
                return entry.content;
            }
        }
        counter!("quire_cache_miss_total").increment(1);

        let limit = self.config().fetch_timeout;
        let fetched = match timeout(limit, fetcher.fetch(key, params)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout { after: limit }),
        };

        let content = match fetched {
            Ok(content) => {
                debug!(target: SOURCE, key, "Fetched content");
                content
            }
            Err(err) => {
                counter!("quire_cache_fetch_error_total", "reason" => err.reason()).increment(1);
                warn!(target: SOURCE, key, error = %err, "Couldn't fetch content; caching not-found page");
                self.not_found()
            }
        };

        self.put(key.to_string(), CacheEntry::new(Arc::clone(&content)));
        content
    }
}

/// A fetcher bound to the cache, optionally under a fixed key.
///
/// Without a fixed key the request path is the cache key. A fixed key lets
/// several paths (`/feed`, `/feed/`, `/rss.xml`) share one entry.
#[derive(Clone)]
pub struct CacheRoute {
    cache: Arc<ContentCache>,
    fetcher: Arc<dyn Fetcher>,
    key: Option<String>,
}

impl CacheRoute {
    pub fn new(cache: Arc<ContentCache>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            cache,
            fetcher,
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn cache_key<'a>(&'a self, request: &'a RequestContext) -> &'a str {
        self.key.as_deref().unwrap_or(&request.path)
    }

    pub async fn content(&self, request: &RequestContext, params: &PathParams) -> Content {
        let key = self.cache_key(request);
        self.cache
            .lookup_or_fetch(key, self.fetcher.as_ref(), params)
            .await
    }

    pub async fn serve(
        &self,
        request: &RequestContext,
        params: &PathParams,
        sink: &mut (dyn ContentSink + Send),
    ) {
        let content = self.content(request, params).await;
        content.render(request, sink);
    }
}
