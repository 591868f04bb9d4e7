//! In-process backend with lazy expiry.

use std::time::Duration;

use super::{BackendFuture, BackendResult, Counter, KvBackend, glob_to_regex};
use crate::clock::SharedClock;
use crate::concurrent_map::ShardedMap;
use crate::error::BackendError;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: Option<u64>,
}

impl StoredValue {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    fn remaining(&self, now_ms: u64) -> Option<Duration> {
        self.expires_at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms)))
    }
}

/// Sharded in-process key/value store.
///
/// A read past an entry's expiry behaves as a miss and removes the entry;
/// [`InMemoryBackend::purge_expired`] reclaims everything else.
#[derive(Debug)]
pub struct InMemoryBackend {
    entries: ShardedMap<String, StoredValue>,
    clock: SharedClock,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: ShardedMap::new(),
            clock,
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn get_now(&self, key: &str) -> Option<String> {
        let now = self.now_ms();
        self.entries.upsert(key.to_string(), |slot| {
            if slot.as_ref().is_some_and(|v| v.is_expired(now)) {
                *slot = None;
            }
            slot.as_ref().map(|v| v.value.clone())
        })
    }

    pub fn set_now(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at_ms = self.now_ms().saturating_add(ttl.as_millis() as u64);
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms: Some(expires_at_ms),
            },
        );
    }

    pub fn delete_now(&self, keys: &[String]) -> u64 {
        let now = self.now_ms();
        keys.iter()
            .filter_map(|key| self.entries.remove(key.as_str()))
            .filter(|v| !v.is_expired(now))
            .count() as u64
    }

    pub fn exists_now(&self, key: &str) -> bool {
        let now = self.now_ms();
        self.entries
            .read_with(key, |v| !v.is_expired(now))
            .unwrap_or(false)
    }

    pub fn incr_now(&self, key: &str, ttl_on_create: Option<Duration>) -> BackendResult<Counter> {
        let now = self.now_ms();
        self.entries.upsert(key.to_string(), |slot| {
            let live = slot.as_ref().filter(|v| !v.is_expired(now)).cloned();
            let next = match live {
                Some(current) => {
                    let value = current.value.parse::<i64>().map_err(|_| {
                        BackendError::Protocol(format!("value at {key} is not an integer"))
                    })?;
                    let value = value.checked_add(1).ok_or_else(|| {
                        BackendError::Protocol("increment or decrement would overflow".to_string())
                    })?;
                    StoredValue {
                        value: value.to_string(),
                        expires_at_ms: current.expires_at_ms,
                    }
                }
                None => StoredValue {
                    value: "1".to_string(),
                    expires_at_ms: ttl_on_create
                        .map(|ttl| now.saturating_add(ttl.as_millis() as u64)),
                },
            };
            let counter = Counter {
                value: next.value.parse().unwrap_or(1),
                ttl: next.remaining(now),
            };
            *slot = Some(next);
            Ok(counter)
        })
    }

    pub fn keys_now(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let re = glob_to_regex(pattern)?;
        let now = self.now_ms();
        Ok(self
            .entries
            .keys_where(|k, v| !v.is_expired(now) && re.is_match(k)))
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.now_ms();
        self.entries.retain(|_, v| !v.is_expired(now))
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<String>> {
        let result = Ok(self.get_now(key));
        Box::pin(async move { result })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BackendFuture<'a, ()> {
        self.set_now(key, value, ttl);
        Box::pin(async { Ok(()) })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, u64> {
        let result = Ok(self.delete_now(keys));
        Box::pin(async move { result })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        let result = Ok(self.exists_now(key));
        Box::pin(async move { result })
    }

    fn incr<'a>(
        &'a self,
        key: &'a str,
        ttl_on_create: Option<Duration>,
    ) -> BackendFuture<'a, Counter> {
        let result = self.incr_now(key, ttl_on_create);
        Box::pin(async move { result })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> BackendFuture<'a, Vec<String>> {
        let result = self.keys_now(pattern);
        Box::pin(async move { result })
    }
}
