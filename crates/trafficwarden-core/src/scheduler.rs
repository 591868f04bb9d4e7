//! Periodic maintenance and alert evaluation.
//!
//! Each job runs on its own tokio interval. A tick is spawned as a separate
//! task and awaited, so a panicking tick is logged and the loop carries on
//! with the next one. Shutdown stops new ticks and lets in-flight ticks run
//! to completion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alerts::AlertManager;
use crate::cache::CacheManager;
use crate::config::TrafficConfig;
use crate::log_sink::LogSink;
use crate::metrics::MetricStore;
use crate::rate_limit::RateLimiter;

/// How often each job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIntervals {
    pub cache_sweep: Duration,
    pub metric_sweep: Duration,
    pub log_sweep: Duration,
    pub alert_check: Duration,
}

impl TaskIntervals {
    pub fn from_config(config: &TrafficConfig) -> Self {
        Self {
            cache_sweep: Duration::from_secs(config.cache.sweep_interval_secs),
            metric_sweep: Duration::from_secs(config.metrics.sweep_interval_secs),
            log_sweep: Duration::from_secs(config.log_sink.sweep_interval_secs),
            alert_check: Duration::from_secs(config.alerts.check_interval_secs),
        }
    }
}

/// Components the background jobs operate on.
#[derive(Debug, Clone)]
pub struct TaskTargets {
    pub cache: Arc<CacheManager>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricStore>,
    pub logs: Arc<LogSink>,
    pub alerts: Arc<AlertManager>,
}

/// Handle to the running background jobs.
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Start every job. Must be called from within a tokio runtime.
    pub fn start(targets: TaskTargets, intervals: TaskIntervals) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let TaskTargets {
            cache,
            limiter,
            metrics,
            logs,
            alerts,
        } = targets;

        let handles = vec![
            (
                "cache_sweep",
                spawn_loop("cache_sweep", intervals.cache_sweep, rx.clone(), move || {
                    let cache = cache.clone();
                    let limiter = limiter.clone();
                    async move {
                        let cached = cache.sweep_expired();
                        let windows = limiter.sweep_expired();
                        debug!(cached, windows, "expired entries swept");
                    }
                }),
            ),
            (
                "metric_sweep",
                spawn_loop("metric_sweep", intervals.metric_sweep, rx.clone(), move || {
                    let metrics = metrics.clone();
                    async move {
                        let removed = metrics.sweep();
                        debug!(removed, "stale metrics swept");
                    }
                }),
            ),
            (
                "log_sweep",
                spawn_loop("log_sweep", intervals.log_sweep, rx.clone(), move || {
                    let logs = logs.clone();
                    async move {
                        let removed = logs.sweep();
                        debug!(removed, "stale error frequencies swept");
                    }
                }),
            ),
            (
                "alert_check",
                spawn_loop("alert_check", intervals.alert_check, rx, move || {
                    let alerts = alerts.clone();
                    async move {
                        let summary = alerts.check_alerts().await;
                        debug!(
                            evaluated = summary.evaluated,
                            triggered = summary.triggered,
                            resolved = summary.resolved,
                            "alert check complete"
                        );
                    }
                }),
            ),
        ];
        info!(jobs = handles.len(), "background tasks started");
        Self { shutdown, handles }
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Stop scheduling ticks and wait for every job to exit.
    pub async fn shutdown(self) {
        // Receivers live in the job tasks; a send error only means they are
        // all gone already.
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            if let Err(err) = handle.await {
                warn!(task = name, error = %err, "background task ended abnormally");
            }
        }
        info!("background tasks stopped");
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let _ = interval.tick().await; // consume immediate first tick

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!(task = name, "background task stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = tokio::spawn(tick()).await {
                        warn!(task = name, error = %err, "background tick panicked");
                    }
                }
            }
        }
    })
}
