//! Rule evaluation, alert lifecycle and notification fan-out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::notify::{NotifierRegistry, deliver};
use super::rules::{Alert, AlertMetric, AlertRule, ChannelKind, describe};
use crate::clock::SharedClock;
use crate::config::AlertsConfig;
use crate::error::{ConfigError, Result};
use crate::log_sink::LogSink;
use crate::metrics::MetricStore;
use crate::telemetry::{ProcessStats, bytes_to_mb};

/// Outcome of one [`AlertManager::check_alerts`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub evaluated: usize,
    pub skipped_cooldown: usize,
    /// Rules skipped for an unknown metric or an unavailable reading
    pub skipped_invalid: usize,
    pub triggered: usize,
    pub renotified: usize,
    pub resolved: usize,
    pub notifications_sent: usize,
    pub notification_failures: usize,
}

/// Counters since startup plus current sizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub rules: usize,
    pub enabled_rules: usize,
    pub active_alerts: usize,
    pub total_alerts: usize,
    pub checks: u64,
    pub triggered: u64,
    pub resolved: u64,
    pub notifications_sent: u64,
    pub notification_failures: u64,
    pub config_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    checks: AtomicU64,
    triggered: AtomicU64,
    resolved: AtomicU64,
    notifications_sent: AtomicU64,
    notification_failures: AtomicU64,
    config_errors: AtomicU64,
}

#[derive(Debug, Default)]
struct AlertState {
    rules: Vec<AlertRule>,
    alerts: VecDeque<Alert>,
}

impl AlertState {
    fn active_for_mut(&mut self, rule_id: &str) -> Option<&mut Alert> {
        self.alerts
            .iter_mut()
            .rev()
            .find(|a| a.rule_id == rule_id && !a.resolved)
    }

    fn push(&mut self, alert: Alert, max_alerts: usize) {
        while self.alerts.len() >= max_alerts {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }
}

/// A notification owed after a pass, sent once the state lock is released.
struct Dispatch {
    alert: Alert,
    channels: Vec<ChannelKind>,
}

/// Evaluates alert rules against live metrics and log state.
pub struct AlertManager {
    state: Mutex<AlertState>,
    metrics: Arc<MetricStore>,
    logs: Arc<LogSink>,
    process: Arc<dyn ProcessStats>,
    notifiers: NotifierRegistry,
    clock: SharedClock,
    max_alerts: usize,
    notification_timeout: Duration,
    counters: Counters,
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("notifiers", &self.notifiers)
            .field("max_alerts", &self.max_alerts)
            .finish_non_exhaustive()
    }
}

impl AlertManager {
    /// Build a manager seeded with the configured (or starter) rules.
    pub fn new(
        config: &AlertsConfig,
        metrics: Arc<MetricStore>,
        logs: Arc<LogSink>,
        process: Arc<dyn ProcessStats>,
        notifiers: NotifierRegistry,
        clock: SharedClock,
    ) -> Self {
        let rules = config.effective_rules();
        for rule in &rules {
            metrics.retain_samples_for(rule.window());
        }
        Self {
            state: Mutex::new(AlertState {
                rules,
                alerts: VecDeque::new(),
            }),
            metrics,
            logs,
            process,
            notifiers,
            clock,
            max_alerts: config.max_alerts.max(1),
            notification_timeout: Duration::from_millis(config.notification_timeout_ms),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a rule. Ids must be unique.
    pub fn add_rule(&self, rule: AlertRule) -> Result<()> {
        rule.validate()?;
        if rule.metric.parse::<AlertMetric>().is_err() {
            warn!(rule_id = %rule.id, metric = %rule.metric, "rule watches an unknown metric and will be skipped");
        }
        let mut state = self.lock();
        if state.rules.iter().any(|r| r.id == rule.id) {
            return Err(ConfigError::InvalidRule {
                rule_id: rule.id,
                reason: "a rule with this id already exists".to_string(),
            }
            .into());
        }
        info!(rule_id = %rule.id, metric = %rule.metric, "alert rule added");
        self.metrics.retain_samples_for(rule.window());
        state.rules.push(rule);
        Ok(())
    }

    /// Replace the rule with the same id. Returns false if there is none.
    pub fn update_rule(&self, rule: AlertRule) -> Result<bool> {
        rule.validate()?;
        let mut state = self.lock();
        let Some(slot) = state.rules.iter_mut().find(|r| r.id == rule.id) else {
            return Ok(false);
        };
        self.metrics.retain_samples_for(rule.window());
        *slot = rule;
        Ok(true)
    }

    /// Returns whether a rule was removed.
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.id != id);
        before != state.rules.len()
    }

    pub fn get_rules(&self) -> Vec<AlertRule> {
        self.lock().rules.clone()
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.lock()
            .alerts
            .iter()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Up to `limit` alerts, most recent first.
    pub fn get_all_alerts(&self, limit: usize) -> Vec<Alert> {
        self.lock()
            .alerts
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Resolve an alert by hand. Returns false if it is unknown or already
    /// resolved.
    pub fn resolve_alert(&self, alert_id: &str) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        match state
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id && !a.resolved)
        {
            Some(alert) => {
                alert.resolve(now);
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                info!(alert_id, rule_id = %alert.rule_id, "alert resolved manually");
                true
            }
            None => false,
        }
    }

    /// Current value of `metric`, or `None` when the platform cannot supply
    /// it.
    fn read_metric(&self, metric: AlertMetric, rule: &AlertRule) -> Option<f64> {
        let window = rule.window();
        let value = match metric {
            AlertMetric::ErrorRate => self.logs.error_rate(window),
            AlertMetric::ErrorCount => self.logs.error_count(window) as f64,
            AlertMetric::ResponseTimeAvg => self.metrics.average_response_time_within(window),
            AlertMetric::ResponseTimeP95 => self.metrics.p95_response_time_within(window),
            AlertMetric::QueryTimeAvg => self.metrics.average_query_time_within(window),
            AlertMetric::MemoryUsage => bytes_to_mb(self.process.resident_bytes()?),
            AlertMetric::ApiCallsPerMinute => self.metrics.api_calls_per_minute() as f64,
            AlertMetric::Uptime => self.process.uptime_secs() as f64,
        };
        Some(value)
    }

    /// Evaluate every enabled rule once and deliver the resulting
    /// notifications. Never fails: bad rules and failed deliveries are
    /// logged and counted.
    pub async fn check_alerts(&self) -> CheckSummary {
        self.counters.checks.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_ms();
        let mut summary = CheckSummary::default();

        let rules: Vec<AlertRule> = self.lock().rules.clone();
        let mut readings = Vec::with_capacity(rules.len());
        for rule in rules.iter().filter(|r| r.enabled) {
            if rule.in_cooldown(now) {
                summary.skipped_cooldown += 1;
                continue;
            }
            let metric = match rule.metric.parse::<AlertMetric>() {
                Ok(metric) => metric,
                Err(err) => {
                    warn!(rule_id = %rule.id, error = %err, "skipping alert rule");
                    self.counters.config_errors.fetch_add(1, Ordering::Relaxed);
                    summary.skipped_invalid += 1;
                    continue;
                }
            };
            let Some(value) = self.read_metric(metric, rule) else {
                debug!(rule_id = %rule.id, metric = %rule.metric, "metric unavailable on this platform");
                summary.skipped_invalid += 1;
                continue;
            };
            summary.evaluated += 1;
            readings.push((rule.id.clone(), value, rule.condition.holds(value, rule.threshold)));
        }

        let dispatches = self.apply_readings(&readings, now, &mut summary);
        self.dispatch(dispatches, &mut summary).await;
        summary
    }

    /// Update alerts and rule trigger times under one lock acquisition.
    fn apply_readings(
        &self,
        readings: &[(String, f64, bool)],
        now: u64,
        summary: &mut CheckSummary,
    ) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        let mut state = self.lock();
        for (rule_id, value, holds) in readings {
            // The rule may have been removed while metrics were read.
            let Some(rule) = state.rules.iter().find(|r| &r.id == rule_id).cloned() else {
                continue;
            };

            if *holds {
                let alert = if let Some(active) = state.active_for_mut(rule_id) {
                    active.current_value = *value;
                    active.message = describe(&rule, *value);
                    summary.renotified += 1;
                    active.clone()
                } else {
                    let alert = Alert::raise(&rule, *value, now);
                    state.push(alert.clone(), self.max_alerts);
                    summary.triggered += 1;
                    self.counters.triggered.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        alert_id = %alert.id,
                        rule_id = %rule.id,
                        severity = %alert.severity,
                        value = *value,
                        threshold = rule.threshold,
                        "alert triggered"
                    );
                    alert
                };
                if let Some(stored) = state.rules.iter_mut().find(|r| &r.id == rule_id) {
                    stored.last_triggered_at_ms = Some(now);
                }
                let channels = rule
                    .channels
                    .iter()
                    .filter(|c| c.enabled)
                    .map(|c| c.kind.clone())
                    .collect();
                dispatches.push(Dispatch { alert, channels });
            } else if let Some(active) = state.active_for_mut(rule_id) {
                active.resolve(now);
                summary.resolved += 1;
                self.counters.resolved.fetch_add(1, Ordering::Relaxed);
                info!(
                    alert_id = %active.id,
                    rule_id = %rule_id,
                    value = *value,
                    "alert resolved"
                );
            }
        }
        dispatches
    }

    async fn dispatch(&self, dispatches: Vec<Dispatch>, summary: &mut CheckSummary) {
        let mut tasks = JoinSet::new();
        for Dispatch { alert, channels } in dispatches {
            for channel in channels {
                let Some(notifier) = self.notifiers.get(channel.channel_type()) else {
                    warn!(
                        alert_id = %alert.id,
                        channel = channel.channel_type().as_str(),
                        "no notifier registered for channel"
                    );
                    summary.notification_failures += 1;
                    continue;
                };
                tasks.spawn(deliver(
                    notifier,
                    channel,
                    alert.clone(),
                    self.notification_timeout,
                ));
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => summary.notifications_sent += 1,
                Ok(Err(_)) => summary.notification_failures += 1,
                Err(err) => {
                    warn!(error = %err, "notification task panicked");
                    summary.notification_failures += 1;
                }
            }
        }
        self.counters
            .notifications_sent
            .fetch_add(summary.notifications_sent as u64, Ordering::Relaxed);
        self.counters
            .notification_failures
            .fetch_add(summary.notification_failures as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> AlertStats {
        let state = self.lock();
        AlertStats {
            rules: state.rules.len(),
            enabled_rules: state.rules.iter().filter(|r| r.enabled).count(),
            active_alerts: state.alerts.iter().filter(|a| !a.resolved).count(),
            total_alerts: state.alerts.len(),
            checks: self.counters.checks.load(Ordering::Relaxed),
            triggered: self.counters.triggered.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            notifications_sent: self.counters.notifications_sent.load(Ordering::Relaxed),
            notification_failures: self.counters.notification_failures.load(Ordering::Relaxed),
            config_errors: self.counters.config_errors.load(Ordering::Relaxed),
        }
    }
}
