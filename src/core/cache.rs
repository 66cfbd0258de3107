//! Stale-if-error response cache.
//!
//! Holds the last successful GET response per key. Entries are classified by age:
//! fresh (`age <= fresh_ttl`), stale (`fresh_ttl < age <= stale_ttl`) or expired.
//! Expired entries are dropped on lookup and behave exactly like a miss.
use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode, Uri, header};
use lru::LruCache;
use serde::Serialize;
use thiserror::Error;

use crate::{config::CacheConfig, ports::{Clock, ForwardResponse}};

/// Response headers kept with a cached entry; everything else is transport detail.
const RETAINED_HEADERS: [header::HeaderName; 3] =
    [header::CONTENT_TYPE, header::CACHE_CONTROL, header::ETAG];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    service: String,
    method: String,
    url: String,
}

impl CacheKey {
    /// Key from service name, upper-cased method and the upstream URL.
    ///
    /// The query string is part of the URL, so `?page=1` and `?page=2` are distinct
    /// resources.
    pub fn new(service: &str, method: &Method, uri: &Uri) -> Self {
        let mut url = String::new();
        if let Some(scheme) = uri.scheme_str() {
            url.push_str(&scheme.to_ascii_lowercase());
            url.push_str("://");
        }
        if let Some(authority) = uri.authority() {
            url.push_str(&authority.as_str().to_ascii_lowercase());
        }
        url.push_str(uri.path());
        if let Some(query) = uri.query() {
            url.push('?');
            url.push_str(query);
        }

        Self {
            service: service.to_string(),
            method: method.as_str().to_ascii_uppercase(),
            url,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub captured_at: Instant,
    pub service: String,
}

impl CacheEntry {
    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.captured_at)
    }
}

/// Result of a lookup, with the entry's age at lookup time.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Fresh(CacheEntry, Duration),
    Stale(CacheEntry, Duration),
    Miss,
}

impl CacheLookup {
    /// Entry usable as a stale-if-error fallback, fresh or stale.
    pub fn into_usable(self) -> Option<(CacheEntry, Duration)> {
        match self {
            Self::Fresh(entry, age) | Self::Stale(entry, age) => Some((entry, age)),
            Self::Miss => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheRejection {
    #[error("cache is disabled")]
    Disabled,
    #[error("only GET responses are cached, got {0}")]
    NotCacheableMethod(Method),
    #[error("only 2xx responses are cached, got {0}")]
    NonSuccessStatus(StatusCode),
    #[error("body of {size} bytes exceeds the {limit} byte entry ceiling")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub capacity: NonZeroUsize,
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
    pub max_entry_bytes: usize,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN),
            fresh_ttl: Duration::from_millis(config.fresh_ttl_ms),
            stale_ttl: Duration::from_millis(config.stale_ttl_ms),
            max_entry_bytes: config.max_entry_bytes,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub rejections: u64,
}

pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    rejections: AtomicU64,
}

impl ResponseCache {
    pub fn new(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(settings.capacity)),
            settings,
            clock,
            fresh_hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a GET 2xx response, replacing any previous entry for the key.
    ///
    /// Evicts the least recently used entry when full.
    pub fn store(
        &self,
        key: CacheKey,
        method: &Method,
        response: &ForwardResponse,
    ) -> Result<(), CacheRejection> {
        if let Err(rejection) = self.admit(method, response) {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(service = key.service(), %rejection, "response not cached");
            return Err(rejection);
        }

        let mut headers = HeaderMap::new();
        for name in &RETAINED_HEADERS {
            for value in response.headers.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let entry = CacheEntry {
            status: response.status,
            headers,
            body: response.body.clone(),
            captured_at: self.clock.now(),
            service: key.service.clone(),
        };

        self.lock().put(key, entry);
        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn admit(&self, method: &Method, response: &ForwardResponse) -> Result<(), CacheRejection> {
        if !self.settings.enabled {
            return Err(CacheRejection::Disabled);
        }
        if *method != Method::GET {
            return Err(CacheRejection::NotCacheableMethod(method.clone()));
        }
        if !response.status.is_success() {
            return Err(CacheRejection::NonSuccessStatus(response.status));
        }
        if response.body.len() > self.settings.max_entry_bytes {
            return Err(CacheRejection::TooLarge {
                size: response.body.len(),
                limit: self.settings.max_entry_bytes,
            });
        }
        Ok(())
    }

    /// Classify the entry for `key` by age. A hit becomes most recently used.
    pub fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let now = self.clock.now();
        let mut entries = self.lock();

        let Some(entry) = entries.get(key) else {
            drop(entries);
            self.record_lookup("miss", &self.misses);
            return CacheLookup::Miss;
        };

        let age = entry.age(now);
        if age <= self.settings.fresh_ttl {
            let entry = entry.clone();
            drop(entries);
            self.record_lookup("fresh", &self.fresh_hits);
            CacheLookup::Fresh(entry, age)
        } else if age <= self.settings.stale_ttl {
            let entry = entry.clone();
            drop(entries);
            self.record_lookup("stale", &self.stale_hits);
            CacheLookup::Stale(entry, age)
        } else {
            entries.pop(key);
            drop(entries);
            self.record_lookup("expired", &self.misses);
            CacheLookup::Miss
        }
    }

    fn record_lookup(&self, result: &'static str, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::increment_cache_lookup(result);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.settings.capacity.get(),
            fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use hyper::header::HeaderValue;

    use super::*;
    use crate::ports::MockClock;

    fn cache_with(capacity: usize) -> (ResponseCache, Arc<MockClock>) {
        let clock = Arc::new(MockClock::new());
        let settings = CacheSettings {
            capacity: NonZeroUsize::new(capacity).unwrap(),
            ..CacheSettings::default()
        };
        (ResponseCache::new(settings, clock.clone()), clock)
    }

    fn key(path: &str) -> CacheKey {
        let uri: Uri = format!("http://admin-service:3001{path}").parse().unwrap();
        CacheKey::new("admin", &Method::GET, &uri)
    }

    fn ok(body: &'static str) -> ForwardResponse {
        let mut response = ForwardResponse::new(StatusCode::OK, body);
        response
            .headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
            .headers
            .insert(header::SET_COOKIE, HeaderValue::from_static("session=abc"));
        response
            .headers
            .insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        response
    }

    #[test]
    fn fresh_hit_returns_identical_payload() {
        let (cache, clock) = cache_with(10);
        cache
            .store(key("/hospitals"), &Method::GET, &ok(r#"[{"id":1}]"#))
            .unwrap();

        clock.advance(Duration::from_secs(59));
        match cache.lookup(&key("/hospitals")) {
            CacheLookup::Fresh(entry, age) => {
                assert_eq!(entry.status, StatusCode::OK);
                assert_eq!(entry.body, Bytes::from_static(br#"[{"id":1}]"#));
                assert_eq!(age, Duration::from_secs(59));
            }
            other => panic!("expected fresh hit, got {other:?}"),
        }
    }

    #[test]
    fn ages_from_fresh_to_stale_to_expired() {
        let (cache, clock) = cache_with(10);
        cache.store(key("/physicians"), &Method::GET, &ok("[]")).unwrap();

        clock.advance(Duration::from_secs(61));
        assert!(matches!(cache.lookup(&key("/physicians")), CacheLookup::Stale(..)));

        clock.advance(Duration::from_secs(239));
        assert!(matches!(cache.lookup(&key("/physicians")), CacheLookup::Stale(..)));

        clock.advance(Duration::from_secs(1));
        assert!(matches!(cache.lookup(&key("/physicians")), CacheLookup::Miss));
        assert!(cache.is_empty());
    }

    #[test]
    fn only_allowlisted_headers_are_kept() {
        let (cache, _) = cache_with(10);
        cache.store(key("/specialties"), &Method::GET, &ok("[]")).unwrap();

        let (entry, _) = cache.lookup(&key("/specialties")).into_usable().unwrap();
        assert_eq!(entry.headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(entry.headers.get(header::ETAG).unwrap(), "\"v1\"");
        assert!(entry.headers.get(header::SET_COOKIE).is_none());
    }

    #[test]
    fn rejects_non_get_non_2xx_and_oversized() {
        let (cache, _) = cache_with(10);
        assert_eq!(
            cache.store(key("/staff"), &Method::POST, &ok("{}")),
            Err(CacheRejection::NotCacheableMethod(Method::POST))
        );

        let not_found = ForwardResponse::new(StatusCode::NOT_FOUND, "{}");
        assert_eq!(
            cache.store(key("/staff"), &Method::GET, &not_found),
            Err(CacheRejection::NonSuccessStatus(StatusCode::NOT_FOUND))
        );

        let big = ForwardResponse::new(StatusCode::OK, vec![b'x'; 100 * 1024 + 1]);
        assert!(matches!(
            cache.store(key("/staff"), &Method::GET, &big),
            Err(CacheRejection::TooLarge { .. })
        ));

        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejections, 3);
    }

    #[test]
    fn evicts_least_recently_used() {
        let (cache, _) = cache_with(2);
        cache.store(key("/a"), &Method::GET, &ok("a")).unwrap();
        cache.store(key("/b"), &Method::GET, &ok("b")).unwrap();

        // Touch /a so /b becomes the eviction candidate
        assert!(matches!(cache.lookup(&key("/a")), CacheLookup::Fresh(..)));
        cache.store(key("/c"), &Method::GET, &ok("c")).unwrap();

        assert!(matches!(cache.lookup(&key("/b")), CacheLookup::Miss));
        assert!(matches!(cache.lookup(&key("/a")), CacheLookup::Fresh(..)));
        assert!(matches!(cache.lookup(&key("/c")), CacheLookup::Fresh(..)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn newer_store_replaces_entry() {
        let (cache, clock) = cache_with(10);
        cache.store(key("/appointments"), &Method::GET, &ok("old")).unwrap();
        clock.advance(Duration::from_secs(120));
        cache.store(key("/appointments"), &Method::GET, &ok("new")).unwrap();

        match cache.lookup(&key("/appointments")) {
            CacheLookup::Fresh(entry, age) => {
                assert_eq!(entry.body, Bytes::from_static(b"new"));
                assert_eq!(age, Duration::ZERO);
            }
            other => panic!("expected fresh hit, got {other:?}"),
        }
    }

    #[test]
    fn key_normalizes_method_and_authority_but_keeps_query() {
        let a: Uri = "http://ADMIN-service:3001/hospitals?page=1".parse().unwrap();
        let b: Uri = "http://admin-service:3001/hospitals?page=1".parse().unwrap();
        let c: Uri = "http://admin-service:3001/hospitals?page=2".parse().unwrap();

        assert_eq!(
            CacheKey::new("admin", &Method::GET, &a),
            CacheKey::new("admin", &Method::GET, &b)
        );
        assert_ne!(
            CacheKey::new("admin", &Method::GET, &b),
            CacheKey::new("admin", &Method::GET, &c)
        );
        assert_ne!(
            CacheKey::new("admin", &Method::GET, &b),
            CacheKey::new("medico", &Method::GET, &b)
        );
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let clock = Arc::new(MockClock::new());
        let settings = CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        };
        let cache = ResponseCache::new(settings, clock);
        assert_eq!(
            cache.store(key("/x"), &Method::GET, &ok("x")),
            Err(CacheRejection::Disabled)
        );
    }
}
