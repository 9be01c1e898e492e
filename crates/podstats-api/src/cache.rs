//! Response cache with TTL expiration, LRU eviction, and a refresh key.
//!
//! Sits in front of the scrape route as axum middleware. Successful `GET`
//! responses are buffered and replayed until they expire; a request carrying
//! the refresh query key drops the cached copy and renders again.
//!
//! The cache key is the request path plus its query pairs, sorted, with the
//! refresh key removed, so `/?opn` and `/` share an entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    /// How long a cached response is served (default: 10 seconds).
    pub ttl: Duration,
    /// Maximum cached responses; 0 means unbounded (default: 100).
    pub max_entries: usize,
    /// Query key that forces a fresh render (default: `opn`).
    pub refresh_key: String,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            max_entries: 100,
            refresh_key: "opn".to_string(),
        }
    }
}

struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    inserted_at: Instant,
    /// Logical access time for LRU ordering.
    last_used: u64,
}

impl CachedResponse {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }

    fn to_response(&self) -> Response {
        let mut resp = Response::new(Body::from(self.body.clone()));
        *resp.status_mut() = self.status;
        *resp.headers_mut() = self.headers.clone();
        resp
    }
}

#[derive(Default)]
struct CacheStore {
    entries: HashMap<String, CachedResponse>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheStore {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lru(&mut self) {
        let lru_key = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = lru_key {
            self.entries.remove(&key);
            self.evictions += 1;
            debug!(evicted = %key, cache_evictions = self.evictions, "response cache LRU eviction");
        }
    }
}

/// Shared response cache. Cheap to clone; clones share entries.
#[derive(Clone)]
pub struct ResponseCache {
    config: Arc<ResponseCacheConfig>,
    store: Arc<Mutex<CacheStore>>,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        Self {
            config: Arc::new(config),
            store: Arc::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// `(hits, misses, evictions)` since creation.
    pub fn stats(&self) -> (u64, u64, u64) {
        let store = self.lock();
        (store.hits, store.misses, store.evictions)
    }

    /// Cache key for `uri`, and whether the refresh key was present.
    pub fn key_for(&self, uri: &Uri) -> (String, bool) {
        let mut refresh = false;
        let mut pairs: Vec<&str> = Vec::new();
        for pair in uri.query().unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let name = pair.split_once('=').map_or(pair, |(name, _)| name);
            if name == self.config.refresh_key {
                refresh = true;
            } else {
                pairs.push(pair);
            }
        }
        pairs.sort_unstable();

        let mut key = uri.path().to_string();
        if !pairs.is_empty() {
            key.push('?');
            key.push_str(&pairs.join("&"));
        }
        (key, refresh)
    }

    /// Cached response for `key` if present and not expired.
    fn get(&self, key: &str) -> Option<Response> {
        let mut guard = self.lock();
        let store = &mut *guard;
        let now = store.tick();
        let expired = match store.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(self.config.ttl) => {
                entry.last_used = now;
                let resp = entry.to_response();
                store.hits += 1;
                return Some(resp);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            store.entries.remove(key);
        }
        store.misses += 1;
        debug!(key, expired, cache_misses = store.misses, "response cache miss");
        None
    }

    fn insert(&self, key: String, status: StatusCode, headers: HeaderMap, body: Bytes) {
        let mut guard = self.lock();
        let store = &mut *guard;
        let now = store.tick();
        let max = self.config.max_entries;
        if max > 0 && !store.entries.contains_key(&key) && store.entries.len() >= max {
            store.evict_lru();
        }
        store.entries.insert(
            key,
            CachedResponse {
                status,
                headers,
                body,
                inserted_at: Instant::now(),
                last_used: now,
            },
        );
    }

    fn invalidate(&self, key: &str) {
        if self.lock().entries.remove(key).is_some() {
            debug!(key, "response cache entry refreshed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// axum middleware serving and populating the cache.
pub async fn cache_responses(State(cache): State<ResponseCache>, req: Request, next: Next) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }

    let (key, refresh) = cache.key_for(req.uri());
    if refresh {
        cache.invalidate(&key);
    } else if let Some(hit) = cache.get(&key) {
        return hit;
    }

    let resp = next.run(req).await;
    if !resp.status().is_success() {
        return resp;
    }

    let (parts, body) = resp.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to buffer response for caching");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read response body\n").into_response();
        }
    };
    cache.insert(key, parts.status, parts.headers.clone(), bytes.clone());
    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_secs: u64, max_entries: usize) -> ResponseCache {
        ResponseCache::new(ResponseCacheConfig {
            ttl: Duration::from_secs(ttl_secs),
            max_entries,
            ..Default::default()
        })
    }

    fn put(cache: &ResponseCache, key: &str, body: &'static str) {
        cache.insert(key.to_string(), StatusCode::OK, HeaderMap::new(), Bytes::from_static(body.as_bytes()));
    }

    #[test]
    fn default_config_values() {
        let config = ResponseCacheConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(10));
        assert_eq!(config.max_entries, 100);
        assert_eq!(config.refresh_key, "opn");
    }

    #[test]
    fn key_sorts_query_and_drops_refresh_key() {
        let cache = cache(10, 100);

        let uri: Uri = "/?b=2&a=1".parse().unwrap();
        assert_eq!(cache.key_for(&uri), ("/?a=1&b=2".to_string(), false));

        let uri: Uri = "/?opn&b=2&a=1".parse().unwrap();
        assert_eq!(cache.key_for(&uri), ("/?a=1&b=2".to_string(), true));

        let uri: Uri = "/?opn=1".parse().unwrap();
        assert_eq!(cache.key_for(&uri), ("/".to_string(), true));

        let uri: Uri = "/".parse().unwrap();
        assert_eq!(cache.key_for(&uri), ("/".to_string(), false));
    }

    #[test]
    fn refresh_key_must_match_whole_name() {
        let cache = cache(10, 100);
        let uri: Uri = "/?opnx=1".parse().unwrap();
        assert_eq!(cache.key_for(&uri), ("/?opnx=1".to_string(), false));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = cache(10, 100);
        put(&cache, "/", "body");

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("/").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("/").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), (1, 1, 0));
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = cache(60, 2);
        put(&cache, "/a", "a");
        put(&cache, "/b", "b");
        assert!(cache.get("/a").is_some());

        put(&cache, "/c", "c");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("/b").is_none());
        assert!(cache.get("/a").is_some());
        assert!(cache.get("/c").is_some());
        assert_eq!(cache.stats().2, 1);
    }

    #[test]
    fn replacing_existing_key_does_not_evict() {
        let cache = cache(60, 2);
        put(&cache, "/a", "a");
        put(&cache, "/b", "b");
        put(&cache, "/a", "a2");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().2, 0);
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let cache = cache(60, 0);
        for i in 0..500 {
            put(&cache, &format!("/{i}"), "x");
        }
        assert_eq!(cache.len(), 500);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = cache(60, 10);
        put(&cache, "/", "x");
        cache.invalidate("/");
        assert!(cache.is_empty());
    }
}
