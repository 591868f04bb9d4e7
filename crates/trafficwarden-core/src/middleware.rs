//! Request-facing adapter over the limiter, cache, metrics and log sink.
//!
//! An HTTP layer calls [`TrafficGate::admit`] before dispatching a request
//! and [`TrafficGate::finish`] once the response status is known. Neither
//! call is tied to a particular web framework.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::cache::{CacheManager, CacheTtl};
use crate::error::{Error, Result};
use crate::log_sink::{LogFields, LogSink};
use crate::metrics::MetricStore;
use crate::rate_limit::{LimitClass, RateLimitDecision, RateLimiter};

/// Stable identifier for an anonymous client: SHA-256 over the remote
/// address and user agent, hex encoded.
pub fn client_fingerprint(addr: &str, user_agent: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(addr.as_bytes());
    hasher.update(b"\n");
    hasher.update(user_agent.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Fresh request id for callers that do not receive one upstream.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shared handles used on every request path.
#[derive(Debug, Clone)]
pub struct TrafficGate {
    limiter: Arc<RateLimiter>,
    cache: Arc<CacheManager>,
    metrics: Arc<MetricStore>,
    logs: Arc<LogSink>,
}

impl TrafficGate {
    pub fn new(
        limiter: Arc<RateLimiter>,
        cache: Arc<CacheManager>,
        metrics: Arc<MetricStore>,
        logs: Arc<LogSink>,
    ) -> Self {
        Self {
            limiter,
            cache,
            metrics,
            logs,
        }
    }

    /// Admission check. A denial is also recorded in the log sink so it
    /// shows up in recent logs next to the request that caused it.
    pub async fn admit(
        &self,
        identifier: &str,
        class: LimitClass,
        request_id: Option<&str>,
    ) -> Result<RateLimitDecision> {
        let decision = self.limiter.check(identifier, class).await?;
        if !decision.allowed {
            let mut fields = LogFields::new()
                .field("identifier", identifier)
                .field("limit_class", class.as_str())
                .field("retry_after_secs", decision.retry_after_secs.unwrap_or_default());
            if let Some(id) = request_id {
                fields = fields.request_id(id);
            }
            self.logs.warn("rate limit exceeded", fields);
        }
        Ok(decision)
    }

    /// Record a completed request. Statuses of 500 and above count as
    /// endpoint errors and are logged at error level.
    pub fn finish(&self, endpoint: &str, duration: Duration, status: u16, request_id: Option<&str>) {
        let is_error = status >= 500;
        self.metrics
            .record_endpoint_result(endpoint, duration, is_error);

        let mut fields = LogFields::new()
            .field("endpoint", endpoint)
            .field("status", status)
            .field("duration_ms", duration.as_millis() as u64);
        if let Some(id) = request_id {
            fields = fields.request_id(id);
        }
        match status {
            500.. => self.logs.error("request failed", fields),
            400..=499 => self.logs.warn("request rejected", fields),
            _ => self.logs.info("request completed", fields),
        }
    }

    /// Read-through cache lookup with the TTL configured for `class`.
    pub async fn cached<T, E, F, Fut>(
        &self,
        key: &str,
        class: CacheTtl,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let ttl = class.secs(self.cache.ttls());
        self.cache.get_or_set(key, ttl, compute).await
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }
}
