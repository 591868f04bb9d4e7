//! Alert rule and alert types.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Attachment color for chat notifications.
    pub const fn color(self) -> &'static str {
        match self {
            Self::Low => "#36a64f",
            Self::Medium => "#ffcc00",
            Self::High => "#ff9900",
            Self::Critical => "#ff0000",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison between a metric reading and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    GreaterThan,
    LessThan,
    Equals,
    NotEquals,
}

impl Condition {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        const TOLERANCE: f64 = 1e-9;
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::Equals => (value - threshold).abs() < TOLERANCE,
            Self::NotEquals => (value - threshold).abs() >= TOLERANCE,
        }
    }

    pub const fn symbol(self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::Equals => "==",
            Self::NotEquals => "!=",
        }
    }
}

/// Metrics an alert rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertMetric {
    /// Percent of log entries in the rule window at error level or above
    ErrorRate,
    /// Error and fatal log entries in the rule window
    ErrorCount,
    /// Mean endpoint latency (ms)
    ResponseTimeAvg,
    /// p95 over per-endpoint average latency (ms)
    ResponseTimeP95,
    /// Mean query latency (ms)
    QueryTimeAvg,
    /// Resident memory (MB)
    MemoryUsage,
    ApiCallsPerMinute,
    /// Seconds since startup
    Uptime,
}

impl AlertMetric {
    pub const ALL: [Self; 8] = [
        Self::ErrorRate,
        Self::ErrorCount,
        Self::ResponseTimeAvg,
        Self::ResponseTimeP95,
        Self::QueryTimeAvg,
        Self::MemoryUsage,
        Self::ApiCallsPerMinute,
        Self::Uptime,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::ErrorCount => "error_count",
            Self::ResponseTimeAvg => "response_time_avg",
            Self::ResponseTimeP95 => "response_time_p95",
            Self::QueryTimeAvg => "query_time_avg",
            Self::MemoryUsage => "memory_usage",
            Self::ApiCallsPerMinute => "api_calls_per_minute",
            Self::Uptime => "uptime",
        }
    }
}

impl std::str::FromStr for AlertMetric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownMetric(s.to_string()))
    }
}

/// Where a rule's notifications go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelKind {
    /// Synchronous stderr line
    Console,
    /// JSON POST of `{alert, service, environment}`
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// Handed to the configured mail transport
    Email {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    /// Slack incoming webhook with a severity-colored attachment
    Slack { webhook_url: String },
}

/// Discriminant of [`ChannelKind`], used to look up notifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Console,
    Webhook,
    Email,
    Slack,
}

impl ChannelType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Webhook => "webhook",
            Self::Email => "email",
            Self::Slack => "slack",
        }
    }
}

impl ChannelKind {
    pub const fn channel_type(&self) -> ChannelType {
        match self {
            Self::Console => ChannelType::Console,
            Self::Webhook { .. } => ChannelType::Webhook,
            Self::Email { .. } => ChannelType::Email,
            Self::Slack { .. } => ChannelType::Slack,
        }
    }
}

/// A notification channel on a rule, with its own on/off switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: ChannelKind,
}

impl ChannelConfig {
    pub const fn console() -> Self {
        Self {
            enabled: true,
            kind: ChannelKind::Console,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_time_window() -> u64 {
    5
}

/// Declarative threshold rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    /// One of the [`AlertMetric`] names
    pub metric: String,
    pub condition: Condition,
    pub threshold: f64,
    /// Look-back window for log-derived metrics
    #[serde(default = "default_time_window")]
    pub time_window_minutes: u64,
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// Minimum time between evaluations after a trigger
    #[serde(default)]
    pub cooldown_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at_ms: Option<u64>,
}

impl AlertRule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRule {
            rule_id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !self.threshold.is_finite() {
            return Err(invalid("threshold must be a finite number"));
        }
        for channel in &self.channels {
            match &channel.kind {
                ChannelKind::Webhook { url, .. } | ChannelKind::Slack { webhook_url: url } => {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        return Err(invalid("channel URL must be http(s)"));
                    }
                }
                ChannelKind::Email { to, .. } if !to.contains('@') => {
                    return Err(invalid("email channel needs an address"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.time_window_minutes.max(1) * 60)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }

    /// Whether a previous trigger is still within the cooldown at `now_ms`.
    pub fn in_cooldown(&self, now_ms: u64) -> bool {
        self.last_triggered_at_ms.is_some_and(|at| {
            now_ms.saturating_sub(at) < self.cooldown().as_millis() as u64
        })
    }
}

/// A raised alert. Resolution is the only mutation after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp_ms: u64,
    pub metric: String,
    pub current_value: f64,
    pub threshold: f64,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<u64>,
}

impl Alert {
    pub(crate) fn raise(rule: &AlertRule, value: f64, now_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            message: describe(rule, value),
            severity: rule.severity,
            timestamp_ms: now_ms,
            metric: rule.metric.clone(),
            current_value: value,
            threshold: rule.threshold,
            resolved: false,
            resolved_at_ms: None,
        }
    }

    pub(crate) fn resolve(&mut self, now_ms: u64) {
        self.resolved = true;
        self.resolved_at_ms = Some(now_ms);
    }
}

pub(crate) fn describe(rule: &AlertRule, value: f64) -> String {
    format!(
        "{}: {} is {value:.2} ({} {})",
        rule.name,
        rule.metric,
        rule.condition.symbol(),
        rule.threshold
    )
}

/// Starter rule set used when configuration supplies none.
pub fn default_rules() -> Vec<AlertRule> {
    let rule = |id: &str,
                name: &str,
                metric: AlertMetric,
                threshold: f64,
                severity: Severity,
                cooldown: u64| {
        AlertRule {
            id: id.to_string(),
            name: name.to_string(),
            metric: metric.as_str().to_string(),
            condition: Condition::GreaterThan,
            threshold,
            time_window_minutes: 5,
            severity,
            enabled: true,
            channels: vec![ChannelConfig::console()],
            cooldown_minutes: cooldown,
            last_triggered_at_ms: None,
        }
    };
    vec![
        rule(
            "high_error_rate",
            "High error rate",
            AlertMetric::ErrorRate,
            5.0,
            Severity::High,
            15,
        ),
        rule(
            "slow_response_time",
            "Slow average response time",
            AlertMetric::ResponseTimeAvg,
            2000.0,
            Severity::Medium,
            10,
        ),
        rule(
            "high_memory_usage",
            "High memory usage",
            AlertMetric::MemoryUsage,
            800.0,
            Severity::High,
            5,
        ),
    ]
}
