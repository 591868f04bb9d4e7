//! TTL cache over a [`FallbackBackend`].
//!
//! Values are stored as JSON text under `<prefix><key>`. Callers cannot tell
//! whether the remote store or the in-process fallback served them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::backend::{FallbackBackend, KvBackend};
use crate::config::{CacheConfig, CacheTtlConfig};
use crate::error::{Error, Result};

/// Named TTL classes used by request handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTtl {
    /// Widget configuration reads
    Widget,
    /// Site metadata
    Site,
    /// Rendered policy templates
    Template,
    /// Cookie taxonomy and category data
    Taxonomy,
    /// Per-visitor consent records
    Consent,
}

impl CacheTtl {
    pub const fn secs(self, ttls: &CacheTtlConfig) -> u64 {
        match self {
            Self::Widget => ttls.widget,
            Self::Site => ttls.site,
            Self::Template => ttls.template,
            Self::Taxonomy => ttls.taxonomy,
            Self::Consent => ttls.consent,
        }
    }
}

/// Cache counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Remote calls that fell back to the in-process map
    pub fallbacks: u64,
    pub remote_configured: bool,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

/// Key/value cache with per-call TTLs.
#[derive(Debug)]
pub struct CacheManager {
    backend: FallbackBackend,
    prefix: String,
    ttls: CacheTtlConfig,
    counters: Counters,
}

impl CacheManager {
    pub fn new(backend: FallbackBackend, config: &CacheConfig) -> Self {
        Self {
            backend,
            prefix: config.key_prefix.clone(),
            ttls: config.ttl,
            counters: Counters::default(),
        }
    }

    fn full_key(&self, key: &str) -> Result<String> {
        if key.trim().is_empty() {
            return Err(Error::invalid("cache key must not be empty"));
        }
        Ok(format!("{}{key}", self.prefix))
    }

    /// Read and decode `key`. An undecodable value counts as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full = self.full_key(key)?;
        let raw = self.backend.get(&full).await?;
        let decoded = raw.and_then(|text| match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "discarding undecodable cache entry");
                None
            }
        });
        let counter = if decoded.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(decoded)
    }

    /// Store `value` under `key` for `ttl_secs` seconds.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        let full = self.full_key(key)?;
        check_ttl(ttl_secs)?;
        let text = serde_json::to_string(value)?;
        self.backend
            .set(&full, &text, Duration::from_secs(ttl_secs))
            .await?;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key, ttl_secs, "cache set");
        Ok(())
    }

    /// Store with the TTL configured for `class`.
    pub async fn set_for<T: Serialize + ?Sized>(&self, key: &str, value: &T, class: CacheTtl) -> Result<()> {
        self.set(key, value, class.secs(&self.ttls)).await
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let full = self.full_key(key)?;
        let removed = self.backend.delete(&[full]).await?;
        self.counters.deletes.fetch_add(removed, Ordering::Relaxed);
        Ok(removed > 0)
    }

    /// Delete every key matching a `*` glob. Returns how many were removed.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let full = self.full_key(pattern)?;
        let keys = self.backend.keys(&full).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.backend.delete(&keys).await?;
        self.counters.deletes.fetch_add(removed, Ordering::Relaxed);
        debug!(pattern, removed, "cache pattern delete");
        Ok(removed)
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let full = self.full_key(key)?;
        Ok(self.backend.exists(&full).await?)
    }

    /// Atomically add one to the integer at `key`. When the key is created
    /// and `ttl_secs` is given, it expires after that many seconds.
    pub async fn increment(&self, key: &str, ttl_secs: Option<u64>) -> Result<i64> {
        let full = self.full_key(key)?;
        if let Some(ttl) = ttl_secs {
            check_ttl(ttl)?;
        }
        let counter = self
            .backend
            .incr(&full, ttl_secs.map(Duration::from_secs))
            .await?;
        Ok(counter.value)
    }

    /// Return the cached value, or run `compute`, cache its result and return
    /// it. A failed computation is returned as-is and nothing is cached.
    pub async fn get_or_set<T, E, F, Fut>(&self, key: &str, ttl_secs: u64, compute: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        check_ttl(ttl_secs)?;
        if let Some(hit) = self.get(key).await? {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(key, &value, ttl_secs).await?;
        Ok(value)
    }

    /// Remove expired entries from the in-process map.
    pub fn sweep_expired(&self) -> usize {
        self.backend.local().purge_expired()
    }

    pub fn ttls(&self) -> &CacheTtlConfig {
        &self.ttls
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            fallbacks: self.backend.stats().remote_failures,
            remote_configured: self.backend.has_remote(),
        }
    }
}

fn check_ttl(ttl_secs: u64) -> Result<()> {
    if ttl_secs == 0 {
        Err(Error::invalid("cache TTL must be at least one second"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::BackendError;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> (Arc<ManualClock>, CacheManager) {
        let clock = ManualClock::shared(0);
        let backend = FallbackBackend::local_only("cache", clock.clone());
        (clock, CacheManager::new(backend, &CacheConfig::default()))
    }

    #[tokio::test]
    async fn set_then_get_until_expiry() {
        let (clock, cache) = cache();
        cache.set("k", "v", 5).await.unwrap();
        assert_eq!(cache.get::<String>("k").await.unwrap().as_deref(), Some("v"));
        clock.advance(Duration::from_secs(6));
        assert_eq!(cache.get::<String>("k").await.unwrap(), None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
    }

    #[tokio::test]
    async fn structured_values_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Widget {
            site_id: u32,
            theme: String,
        }
        let (_, cache) = cache();
        let widget = Widget {
            site_id: 7,
            theme: "dark".into(),
        };
        cache.set_for("widget:7", &widget, CacheTtl::Widget).await.unwrap();
        assert_eq!(cache.get::<Widget>("widget:7").await.unwrap(), Some(widget));
    }

    #[tokio::test]
    async fn bad_input_is_rejected() {
        let (_, cache) = cache();
        assert!(matches!(cache.set("", &1, 10).await, Err(Error::InvalidInput(_))));
        assert!(matches!(cache.set("k", &1, 0).await, Err(Error::InvalidInput(_))));
        assert!(matches!(cache.get::<i32>("  ").await, Err(Error::InvalidInput(_))));
        assert!(matches!(cache.increment("n", Some(0)).await, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn undecodable_value_is_a_miss() {
        let (_, cache) = cache();
        cache.set("k", "text", 60).await.unwrap();
        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_and_exists() {
        let (_, cache) = cache();
        cache.set("k", &1, 60).await.unwrap();
        assert!(cache.exists("k").await.unwrap());
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn delete_pattern_matches_glob() {
        let (_, cache) = cache();
        for key in ["site:1:widget", "site:2:widget", "site:2:policy", "user:1"] {
            cache.set(key, &true, 60).await.unwrap();
        }
        assert_eq!(cache.delete_pattern("site:*:widget").await.unwrap(), 2);
        assert!(cache.exists("site:2:policy").await.unwrap());
        assert_eq!(cache.delete_pattern("*").await.unwrap(), 2);
        assert_eq!(cache.delete_pattern("nothing:*").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn increment_counts_from_unset() {
        let (clock, cache) = cache();
        for expected in 1..=5 {
            assert_eq!(cache.increment("views", Some(60)).await.unwrap(), expected);
        }
        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.increment("views", Some(60)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn increment_at_i64_max_fails_without_poisoning() {
        let (_, cache) = cache();
        cache.set("n", &i64::MAX, 60).await.unwrap();
        assert!(matches!(
            cache.increment("n", None).await,
            Err(Error::Backend(BackendError::Protocol(_)))
        ));
        assert_eq!(cache.get::<i64>("n").await.unwrap(), Some(i64::MAX));
        assert_eq!(cache.increment("other", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_or_set_computes_once() {
        let (_, cache) = cache();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value: Result<u32> = cache
                .get_or_set("answer", 60, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await;
            assert_eq!(value.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_or_set_never_caches_failure() {
        #[derive(Debug)]
        enum LoadError {
            Upstream,
            Cache,
        }
        impl From<Error> for LoadError {
            fn from(_: Error) -> Self {
                Self::Cache
            }
        }

        let (_, cache) = cache();
        let failed: std::result::Result<u32, LoadError> = cache
            .get_or_set("site:9", 60, || async { Err(LoadError::Upstream) })
            .await;
        assert!(matches!(failed, Err(LoadError::Upstream)));
        assert!(!cache.exists("site:9").await.unwrap());

        let ok: std::result::Result<u32, LoadError> =
            cache.get_or_set("site:9", 60, || async { Ok(9) }).await;
        assert_eq!(ok.unwrap(), 9);
    }

    #[tokio::test]
    async fn sweep_reclaims_expired() {
        let (clock, cache) = cache();
        cache.set("a", &1, 1).await.unwrap();
        cache.set("b", &1, 100).await.unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.sweep_expired(), 1);
    }

    #[test]
    fn ttl_classes_follow_config() {
        let ttls = CacheTtlConfig::default();
        assert_eq!(CacheTtl::Widget.secs(&ttls), 300);
        assert_eq!(CacheTtl::Consent.secs(&ttls), 86_400);
    }
}
