//! Composition root.
//!
//! [`TrafficRuntime`] builds every component exactly once from a
//! [`TrafficConfig`] and hands out shared handles. Request handlers take a
//! [`TrafficGate`]; the process entry point starts [`BackgroundTasks`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::alerts::{AlertManager, AlertStats, NotifierRegistry, NotifyContext};
use crate::backend::{FallbackBackend, KvBackend, RestBackend};
use crate::cache::{CacheManager, CacheStats};
use crate::clock::{SharedClock, system_clock};
use crate::config::TrafficConfig;
use crate::error::{BackendError, Error, Result};
use crate::log_sink::{LogSink, WebhookForwarder};
use crate::metrics::{MetricStore, MetricsSummary};
use crate::middleware::TrafficGate;
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::scheduler::{BackgroundTasks, TaskIntervals, TaskTargets};
use crate::telemetry::{PlatformStats, ProcessStats};

/// Point-in-time view across all components.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub remote_configured: bool,
    pub cache: CacheStats,
    pub rate_limit: RateLimitStats,
    pub metrics: MetricsSummary,
    pub buffered_logs: usize,
    pub buffered_errors: usize,
    pub alerts: AlertStats,
}

/// Overrides for the pieces [`TrafficRuntime::from_config`] would otherwise
/// derive from the environment.
#[must_use]
pub struct RuntimeBuilder {
    config: TrafficConfig,
    clock: Option<SharedClock>,
    process: Option<Arc<dyn ProcessStats>>,
    remote: Option<Arc<dyn KvBackend>>,
    notifiers: Option<NotifierRegistry>,
}

impl RuntimeBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn process_stats(mut self, process: Arc<dyn ProcessStats>) -> Self {
        self.process = Some(process);
        self
    }

    /// Use `remote` instead of a REST client built from `[remote]`.
    pub fn remote(mut self, remote: Arc<dyn KvBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn notifiers(mut self, notifiers: NotifierRegistry) -> Self {
        self.notifiers = Some(notifiers);
        self
    }

    pub fn build(self) -> Result<TrafficRuntime> {
        let config = self.config;
        config.validate()?;
        let clock = self.clock.unwrap_or_else(system_clock);
        let timeout = config.remote.timeout();
        let notify_timeout = Duration::from_millis(config.alerts.notification_timeout_ms);

        let remote = match self.remote {
            Some(remote) => Some(remote),
            None => match config.remote.credentials() {
                Some((url, token)) => {
                    let client: Arc<dyn KvBackend> = Arc::new(RestBackend::new(url, token, timeout)?);
                    Some(client)
                }
                None => None,
            },
        };
        info!(remote = remote.is_some(), "traffic runtime starting");

        let cache = Arc::new(CacheManager::new(
            FallbackBackend::new("cache", remote.clone(), clock.clone(), timeout),
            &config.cache,
        ));
        let limiter = Arc::new(RateLimiter::new(
            FallbackBackend::new("ratelimit", remote.clone(), clock.clone(), timeout),
            config.rate_limits,
            clock.clone(),
        ));
        let metrics = Arc::new(MetricStore::new(&config.metrics, clock.clone()));

        let mut sink = LogSink::new(&config.log_sink, clock.clone());
        if let Some(url) = config.log_sink.webhook_url.as_deref() {
            let forwarder = WebhookForwarder::new(url, notify_timeout)
                .map_err(BackendError::from)?;
            sink = sink.with_forwarder(Arc::new(forwarder));
        }
        let logs = Arc::new(sink);

        let notifiers = match self.notifiers {
            Some(notifiers) => notifiers,
            None => NotifierRegistry::standard(
                NotifyContext {
                    service: config.alerts.service.clone(),
                    environment: config.alerts.environment.clone(),
                },
                notify_timeout,
            )
            .map_err(|e| Error::Runtime(format!("failed to build notifiers: {e}")))?,
        };
        let process = self
            .process
            .unwrap_or_else(|| Arc::new(PlatformStats::new()));
        let alerts = Arc::new(AlertManager::new(
            &config.alerts,
            metrics.clone(),
            logs.clone(),
            process,
            notifiers,
            clock.clone(),
        ));

        Ok(TrafficRuntime {
            intervals: TaskIntervals::from_config(&config),
            remote_configured: remote.is_some(),
            config,
            clock,
            cache,
            limiter,
            metrics,
            logs,
            alerts,
        })
    }
}

/// Every component, built once and shared by handle.
#[derive(Debug)]
pub struct TrafficRuntime {
    config: TrafficConfig,
    clock: SharedClock,
    intervals: TaskIntervals,
    remote_configured: bool,
    pub cache: Arc<CacheManager>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricStore>,
    pub logs: Arc<LogSink>,
    pub alerts: Arc<AlertManager>,
}

impl TrafficRuntime {
    pub fn builder(config: TrafficConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            clock: None,
            process: None,
            remote: None,
            notifiers: None,
        }
    }

    /// Build with the system clock, platform process stats and, when
    /// `[remote]` has credentials, a REST remote.
    pub fn from_config(config: &TrafficConfig) -> Result<Self> {
        Self::builder(config.clone()).build()
    }

    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn remote_configured(&self) -> bool {
        self.remote_configured
    }

    /// Request-path adapter sharing this runtime's components.
    pub fn gate(&self) -> TrafficGate {
        TrafficGate::new(
            self.limiter.clone(),
            self.cache.clone(),
            self.metrics.clone(),
            self.logs.clone(),
        )
    }

    /// Start sweeps and alert checks. Must be called from within a tokio
    /// runtime.
    pub fn start_background(&self) -> BackgroundTasks {
        self.start_background_with(self.intervals)
    }

    pub fn start_background_with(&self, intervals: TaskIntervals) -> BackgroundTasks {
        BackgroundTasks::start(
            TaskTargets {
                cache: self.cache.clone(),
                limiter: self.limiter.clone(),
                metrics: self.metrics.clone(),
                logs: self.logs.clone(),
                alerts: self.alerts.clone(),
            },
            intervals,
        )
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            remote_configured: self.remote_configured,
            cache: self.cache.stats(),
            rate_limit: self.limiter.stats(),
            metrics: self.metrics.summary(),
            buffered_logs: self.logs.len(),
            buffered_errors: self.logs.get_error_metrics().total,
            alerts: self.alerts.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::LimitClass;
    use crate::telemetry::StaticStats;

    #[test]
    fn builds_in_process_without_credentials() {
        let runtime = TrafficRuntime::from_config(&TrafficConfig::default()).unwrap();
        assert!(!runtime.remote_configured());
        assert!(!runtime.status().cache.remote_configured);
        assert_eq!(runtime.alerts.get_rules().len(), 3);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = TrafficConfig::default();
        config.log_sink.capacity = 0;
        assert!(matches!(
            TrafficRuntime::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn credentials_enable_remote() {
        let mut config = TrafficConfig::default();
        config.remote.url = Some("https://kv.example.com".into());
        config.remote.token = Some("secret".into());
        let runtime = TrafficRuntime::from_config(&config).unwrap();
        assert!(runtime.remote_configured());
    }

    #[tokio::test]
    async fn gate_shares_runtime_components() {
        let clock = ManualClock::shared(1_700_000_000_000);
        let runtime = TrafficRuntime::builder(TrafficConfig::default())
            .clock(clock)
            .process_stats(Arc::new(StaticStats::default()))
            .notifiers(NotifierRegistry::default())
            .build()
            .unwrap();
        let gate = runtime.gate();
        gate.admit("client-1", LimitClass::Api, None).await.unwrap();
        gate.finish("/api/widget", std::time::Duration::from_millis(12), 200, None);

        let status = runtime.status();
        assert_eq!(status.rate_limit.allowed, 1);
        assert_eq!(status.metrics.total_requests, 1);
        assert_eq!(status.buffered_logs, 1);
    }
}
