//! Per-identifier admission control.
//!
//! Each `(identifier, class)` pair owns one fixed window that opens on its
//! first request and resets wholesale when it expires. The count is an
//! atomic backend `INCR`, so two concurrent callers can never both start the
//! same window.
//!
//! Infrastructure failures fail open: if neither the remote store nor the
//! in-process fallback can answer, the request is allowed and a warning is
//! logged. Requests are denied only when a window is exhausted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Counter, FallbackBackend, KvBackend};
use crate::clock::SharedClock;
use crate::config::{LimitSpec, RateLimitsConfig};
use crate::error::{Error, Result};

/// Named limit classes. Windows of different classes are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitClass {
    /// General API traffic
    Api,
    /// Site registration
    Registration,
    /// Consent writes
    Consent,
    /// Widget script and config fetches
    Widget,
    /// Login and token exchange
    Auth,
}

impl LimitClass {
    pub const ALL: [Self; 5] = [
        Self::Api,
        Self::Registration,
        Self::Consent,
        Self::Widget,
        Self::Auth,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Registration => "registration",
            Self::Consent => "consent",
            Self::Widget => "widget",
            Self::Auth => "auth",
        }
    }

    pub const fn spec(self, limits: &RateLimitsConfig) -> LimitSpec {
        match self {
            Self::Api => limits.api,
            Self::Registration => limits.registration,
            Self::Consent => limits.consent,
            Self::Widget => limits.widget,
            Self::Auth => limits.auth,
        }
    }
}

impl std::fmt::Display for LimitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LimitClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!(
                    "unknown limit class: {s}. Expected one of: api, registration, consent, widget, auth"
                )
            })
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the current window ends (epoch milliseconds)
    pub reset_at_ms: u64,
    /// Seconds until `reset_at_ms`; only set when denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// Standard rate-limit response headers. `Retry-After` is included only
    /// for denied requests.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at_ms.div_ceil(1000).to_string()),
        ];
        if let Some(retry) = self.retry_after_secs {
            headers.push(("Retry-After", retry.to_string()));
        }
        headers
    }
}

/// Limiter counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub denied: u64,
    /// Checks allowed because no backend could answer
    pub failed_open: u64,
    /// Remote calls that fell back to the in-process map
    pub fallbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    failed_open: AtomicU64,
}

/// Fixed-window rate limiter keyed by `(identifier, class)`.
#[derive(Debug)]
pub struct RateLimiter {
    backend: FallbackBackend,
    limits: RateLimitsConfig,
    clock: SharedClock,
    counters: Counters,
}

const KEY_PREFIX: &str = "ratelimit:";

impl RateLimiter {
    pub fn new(backend: FallbackBackend, limits: RateLimitsConfig, clock: SharedClock) -> Self {
        Self {
            backend,
            limits,
            clock,
            counters: Counters::default(),
        }
    }

    pub fn limits(&self) -> &RateLimitsConfig {
        &self.limits
    }

    fn key(identifier: &str, class: LimitClass) -> Result<String> {
        if identifier.trim().is_empty() {
            return Err(Error::invalid("rate limit identifier must not be empty"));
        }
        Ok(format!("{KEY_PREFIX}{class}:{identifier}"))
    }

    /// Count one request against the window and decide whether to admit it.
    pub async fn check(&self, identifier: &str, class: LimitClass) -> Result<RateLimitDecision> {
        let key = Self::key(identifier, class)?;
        let spec = class.spec(&self.limits);
        let window = spec.window();

        let decision = match self.backend.incr(&key, Some(window)).await {
            Ok(counter) => self.decide(spec, counter),
            Err(err) => {
                warn!(
                    identifier,
                    limit_class = %class,
                    error = %err,
                    "rate limit backend failed, allowing request"
                );
                self.counters.failed_open.fetch_add(1, Ordering::Relaxed);
                RateLimitDecision {
                    allowed: true,
                    limit: spec.max_requests,
                    remaining: spec.max_requests,
                    reset_at_ms: self.clock.now_ms() + window.as_millis() as u64,
                    retry_after_secs: None,
                }
            }
        };

        if decision.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                identifier,
                limit_class = %class,
                retry_after_secs = decision.retry_after_secs,
                "rate limit exceeded"
            );
        }
        Ok(decision)
    }

    fn decide(&self, spec: LimitSpec, counter: Counter) -> RateLimitDecision {
        let count = counter.value.max(1) as u64;
        let ttl = counter.ttl.unwrap_or_else(|| spec.window());
        let max = u64::from(spec.max_requests);
        let allowed = count <= max;
        RateLimitDecision {
            allowed,
            limit: spec.max_requests,
            remaining: max.saturating_sub(count) as u32,
            reset_at_ms: self.clock.now_ms() + ttl.as_millis() as u64,
            retry_after_secs: (!allowed).then(|| retry_after(ttl)),
        }
    }

    /// Clear the window for `(identifier, class)`. Returns whether one existed.
    pub async fn reset(&self, identifier: &str, class: LimitClass) -> Result<bool> {
        let key = Self::key(identifier, class)?;
        Ok(self.backend.delete(&[key]).await? > 0)
    }

    /// Remove expired windows from the in-process map.
    pub fn sweep_expired(&self) -> usize {
        self.backend.local().purge_expired()
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            failed_open: self.counters.failed_open.load(Ordering::Relaxed),
            fallbacks: self.backend.stats().remote_failures,
        }
    }
}

/// Whole seconds until the window resets, never less than one.
fn retry_after(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn limiter(api: LimitSpec) -> (Arc<ManualClock>, RateLimiter) {
        let clock = ManualClock::shared(1_700_000_000_000);
        let backend = FallbackBackend::local_only("ratelimit", clock.clone());
        let limits = RateLimitsConfig {
            api,
            ..RateLimitsConfig::default()
        };
        (clock.clone(), RateLimiter::new(backend, limits, clock))
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let (_, limiter) = limiter(LimitSpec::new(3, 60));
        for expected in [2, 1, 0] {
            let decision = limiter.check("client-1", LimitClass::Api).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.retry_after_secs, None);
        }
        let denied = limiter.check("client-1", LimitClass::Api).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_secs, Some(60));
    }

    #[tokio::test]
    async fn window_resets_after_duration() {
        let (clock, limiter) = limiter(LimitSpec::new(2, 60));
        for _ in 0..3 {
            limiter.check("c", LimitClass::Api).await.unwrap();
        }
        clock.advance(Duration::from_secs(45));
        let denied = limiter.check("c", LimitClass::Api).await.unwrap();
        assert_eq!(denied.retry_after_secs, Some(15));

        clock.advance(Duration::from_secs(15));
        let fresh = limiter.check("c", LimitClass::Api).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
    }

    #[tokio::test]
    async fn classes_and_identifiers_are_independent() {
        let (_, limiter) = limiter(LimitSpec::new(1, 60));
        assert!(limiter.check("a", LimitClass::Api).await.unwrap().allowed);
        assert!(!limiter.check("a", LimitClass::Api).await.unwrap().allowed);
        assert!(limiter.check("b", LimitClass::Api).await.unwrap().allowed);
        let registration = limiter.check("a", LimitClass::Registration).await.unwrap();
        assert!(registration.allowed);
        assert_eq!(registration.limit, 5);
        assert_eq!(registration.remaining, 4);
    }

    #[tokio::test]
    async fn reset_reopens_window() {
        let (_, limiter) = limiter(LimitSpec::new(1, 60));
        limiter.check("a", LimitClass::Api).await.unwrap();
        assert!(!limiter.check("a", LimitClass::Api).await.unwrap().allowed);
        assert!(limiter.reset("a", LimitClass::Api).await.unwrap());
        assert!(limiter.check("a", LimitClass::Api).await.unwrap().allowed);
        let stats = limiter.stats();
        assert_eq!((stats.allowed, stats.denied), (2, 1));
    }

    #[tokio::test]
    async fn empty_identifier_is_rejected() {
        let (_, limiter) = limiter(LimitSpec::new(1, 60));
        assert!(matches!(
            limiter.check(" ", LimitClass::Api).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn headers_include_retry_after_only_when_denied() {
        let (clock, limiter) = limiter(LimitSpec::new(1, 60));
        let ok = limiter.check("h", LimitClass::Api).await.unwrap();
        let names: Vec<_> = ok.headers().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["X-RateLimit-Limit", "X-RateLimit-Remaining", "X-RateLimit-Reset"]
        );
        let denied = limiter.check("h", LimitClass::Api).await.unwrap();
        let headers = denied.headers();
        assert_eq!(headers[3], ("Retry-After", "60".to_string()));
        assert_eq!(
            headers[2].1,
            ((clock.now_ms() + 60_000) / 1000).to_string()
        );
    }

    #[test]
    fn class_parse_roundtrip() {
        for class in LimitClass::ALL {
            assert_eq!(class.as_str().parse::<LimitClass>().unwrap(), class);
        }
        assert_eq!("API".parse::<LimitClass>().unwrap(), LimitClass::Api);
        assert!("burst".parse::<LimitClass>().is_err());
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after(Duration::from_millis(1)), 1);
        assert_eq!(retry_after(Duration::from_millis(1001)), 2);
        assert_eq!(retry_after(Duration::ZERO), 1);
    }
}
