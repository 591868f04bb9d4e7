//! Remote-first backend decorator with an in-process fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use super::{BackendFuture, BackendResult, Counter, InMemoryBackend, KvBackend};
use crate::clock::SharedClock;
use crate::error::BackendError;

/// Point-in-time counters for a [`FallbackBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    /// Calls answered by the remote store.
    pub remote_ok: u64,
    /// Remote calls that failed or timed out.
    pub remote_failures: u64,
    /// Calls answered by the in-process map.
    pub local_served: u64,
}

#[derive(Debug, Default)]
struct Counters {
    remote_ok: AtomicU64,
    remote_failures: AtomicU64,
    local_served: AtomicU64,
}

/// Tries the remote store first and serves from an in-process map when the
/// remote is absent, errors, or exceeds `timeout`.
///
/// Callers see the same contract either way. Remote failures are logged at
/// warn level and counted, never returned.
pub struct FallbackBackend {
    scope: &'static str,
    remote: Option<Arc<dyn KvBackend>>,
    local: InMemoryBackend,
    timeout: Duration,
    counters: Counters,
}

impl std::fmt::Debug for FallbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackBackend")
            .field("scope", &self.scope)
            .field("remote", &self.remote.as_ref().map(|r| r.name()))
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FallbackBackend {
    /// `scope` labels log lines (`"cache"`, `"ratelimit"`).
    pub fn new(
        scope: &'static str,
        remote: Option<Arc<dyn KvBackend>>,
        clock: SharedClock,
        timeout: Duration,
    ) -> Self {
        Self {
            scope,
            remote,
            local: InMemoryBackend::new(clock),
            timeout,
            counters: Counters::default(),
        }
    }

    /// In-process only; the permanent mode when no remote is configured.
    pub fn local_only(scope: &'static str, clock: SharedClock) -> Self {
        Self::new(scope, None, clock, Duration::ZERO)
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// The in-process map used when the remote is unavailable.
    pub fn local(&self) -> &InMemoryBackend {
        &self.local
    }

    #[must_use]
    pub fn stats(&self) -> FallbackStats {
        FallbackStats {
            remote_ok: self.counters.remote_ok.load(Ordering::Relaxed),
            remote_failures: self.counters.remote_failures.load(Ordering::Relaxed),
            local_served: self.counters.local_served.load(Ordering::Relaxed),
        }
    }

    async fn with_fallback<T, L>(
        &self,
        op: &'static str,
        key: &str,
        remote: Option<BackendFuture<'_, T>>,
        local: L,
    ) -> BackendResult<T>
    where
        L: FnOnce(&InMemoryBackend) -> BackendResult<T>,
    {
        if let Some(call) = remote {
            let outcome = match tokio::time::timeout(self.timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout(self.timeout.as_millis() as u64)),
            };
            match outcome {
                Ok(value) => {
                    self.counters.remote_ok.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => {
                    self.counters.remote_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        backend = self.scope,
                        op,
                        key,
                        error = %err,
                        "remote store failed, serving from in-process map"
                    );
                }
            }
        }
        self.counters.local_served.fetch_add(1, Ordering::Relaxed);
        local(&self.local)
    }
}

impl KvBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        self.scope
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<String>> {
        let remote = self.remote.as_ref().map(|r| r.get(key));
        Box::pin(self.with_fallback("get", key, remote, move |local| Ok(local.get_now(key))))
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BackendFuture<'a, ()> {
        let remote = self.remote.as_ref().map(|r| r.set(key, value, ttl));
        Box::pin(self.with_fallback("set", key, remote, move |local| {
            local.set_now(key, value, ttl);
            Ok(())
        }))
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, u64> {
        let remote = self.remote.as_ref().map(|r| r.delete(keys));
        let label = keys.first().map_or("", String::as_str);
        Box::pin(self.with_fallback("del", label, remote, move |local| Ok(local.delete_now(keys))))
    }

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        let remote = self.remote.as_ref().map(|r| r.exists(key));
        Box::pin(self.with_fallback("exists", key, remote, move |local| Ok(local.exists_now(key))))
    }

    fn incr<'a>(
        &'a self,
        key: &'a str,
        ttl_on_create: Option<Duration>,
    ) -> BackendFuture<'a, Counter> {
        let remote = self.remote.as_ref().map(|r| r.incr(key, ttl_on_create));
        Box::pin(self.with_fallback("incr", key, remote, move |local| {
            local.incr_now(key, ttl_on_create)
        }))
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> BackendFuture<'a, Vec<String>> {
        let remote = self.remote.as_ref().map(|r| r.keys(pattern));
        Box::pin(self.with_fallback("keys", pattern, remote, move |local| local.keys_now(pattern)))
    }
}
