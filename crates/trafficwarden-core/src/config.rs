//! Configuration management for trafficwarden
//!
//! Handles loading and validation of `trafficwarden.toml`. Every section is
//! optional; the environment overlay (`TW_REMOTE_URL`, `TW_REMOTE_TOKEN`,
//! `TW_LOG_LEVEL`) is applied after the file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::{AlertMetric, AlertRule};
use crate::error::ConfigError;
use crate::log_sink::LogLevel;
use crate::logging::LogConfig;

/// Process log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for log shippers
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Process logging
    #[serde(default)]
    pub logging: LogConfig,

    /// Remote key/value store shared by cache and rate limiter
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Per-class request limits
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Structured log buffer
    #[serde(default)]
    pub log_sink: LogSinkConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Remote store connection. Both `url` and `token` must be set to leave
/// in-process mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Upper bound for a single remote call
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_ms: 1500,
        }
    }
}

impl RemoteConfig {
    /// URL and token, when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.token.as_deref()) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => Some((url, token)),
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Cache manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub sweep_interval_secs: u64,
    pub key_prefix: String,
    pub ttl: CacheTtlConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            key_prefix: "cache:".to_string(),
            ttl: CacheTtlConfig::default(),
        }
    }
}

/// TTL, in seconds, for each cache class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    pub widget: u64,
    pub site: u64,
    pub template: u64,
    pub taxonomy: u64,
    pub consent: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            widget: 300,
            site: 600,
            template: 1800,
            taxonomy: 3600,
            consent: 86_400,
        }
    }
}

/// One limit class: at most `max_requests` per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl LimitSpec {
    #[must_use]
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Limits per class. Overriding a class requires both keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub api: LimitSpec,
    pub registration: LimitSpec,
    pub consent: LimitSpec,
    pub widget: LimitSpec,
    pub auth: LimitSpec,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            api: LimitSpec::new(100, 60),
            registration: LimitSpec::new(5, 3600),
            consent: LimitSpec::new(50, 60),
            widget: LimitSpec::new(300, 60),
            auth: LimitSpec::new(10, 900),
        }
    }
}

/// Metric store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Durations above this are logged as slow
    pub slow_request_ms: u64,
    pub retention_hours: u64,
    pub sweep_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            slow_request_ms: 1000,
            retention_hours: 24,
            sweep_interval_secs: 3600,
        }
    }
}

/// Structured log sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSinkConfig {
    /// Ring buffer size
    pub capacity: usize,
    /// Entries below this level are dropped
    pub min_level: LogLevel,
    /// Receives a copy of every error and fatal entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub error_retention_hours: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            min_level: LogLevel::Info,
            webhook_url: None,
            error_retention_hours: 24,
            sweep_interval_secs: 3600,
        }
    }
}

/// Alert manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub check_interval_secs: u64,
    /// Alert history bound; oldest alerts are evicted first
    pub max_alerts: usize,
    /// Per-channel delivery timeout
    pub notification_timeout_ms: u64,
    /// Reported in webhook payloads
    pub service: String,
    pub environment: String,
    /// Replaces the starter rule set when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<AlertRule>>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            max_alerts: 1000,
            notification_timeout_ms: 5000,
            service: "trafficwarden".to_string(),
            environment: "production".to_string(),
            rules: None,
        }
    }
}

impl AlertsConfig {
    /// Configured rules, or the starter set.
    pub fn effective_rules(&self) -> Vec<AlertRule> {
        self.rules
            .clone()
            .unwrap_or_else(crate::alerts::default_rules)
    }
}

impl TrafficConfig {
    /// Load from `path` (or defaults when `None`), apply the environment
    /// overlay, and validate.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without the environment overlay.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text).map_err(ConfigError::from)?)
    }

    pub fn to_toml_string(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self).map_err(ConfigError::from)?)
    }

    /// Apply `TW_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TW_REMOTE_URL") {
            self.remote.url = Some(url);
        }
        if let Some(token) = lookup("TW_REMOTE_TOKEN") {
            self.remote.token = Some(token);
        }
        if let Some(level) = lookup("TW_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = self.remote.url.as_deref() {
            if !url.is_empty() && !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::invalid("remote.url", "must be an http(s) URL"));
            }
        }
        positive("remote.timeout_ms", self.remote.timeout_ms)?;
        positive("cache.sweep_interval_secs", self.cache.sweep_interval_secs)?;
        let ttl = &self.cache.ttl;
        for (field, value) in [
            ("cache.ttl.widget", ttl.widget),
            ("cache.ttl.site", ttl.site),
            ("cache.ttl.template", ttl.template),
            ("cache.ttl.taxonomy", ttl.taxonomy),
            ("cache.ttl.consent", ttl.consent),
        ] {
            positive(field, value)?;
        }

        let limits = &self.rate_limits;
        for (class, spec) in [
            ("api", limits.api),
            ("registration", limits.registration),
            ("consent", limits.consent),
            ("widget", limits.widget),
            ("auth", limits.auth),
        ] {
            positive(&format!("rate_limits.{class}.max_requests"), u64::from(spec.max_requests))?;
            positive(&format!("rate_limits.{class}.window_secs"), spec.window_secs)?;
        }

        positive("metrics.retention_hours", self.metrics.retention_hours)?;
        positive("metrics.sweep_interval_secs", self.metrics.sweep_interval_secs)?;
        positive("log_sink.capacity", self.log_sink.capacity as u64)?;
        positive("log_sink.error_retention_hours", self.log_sink.error_retention_hours)?;
        positive("log_sink.sweep_interval_secs", self.log_sink.sweep_interval_secs)?;
        positive("alerts.check_interval_secs", self.alerts.check_interval_secs)?;
        positive("alerts.max_alerts", self.alerts.max_alerts as u64)?;
        positive("alerts.notification_timeout_ms", self.alerts.notification_timeout_ms)?;

        if let Some(rules) = &self.alerts.rules {
            for rule in rules {
                rule.validate()?;
                if rule.metric.parse::<AlertMetric>().is_err() {
                    return Err(ConfigError::UnknownMetric(rule.metric.clone()));
                }
            }
        }
        Ok(())
    }
}

fn positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = TrafficConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rate_limits.api, LimitSpec::new(100, 60));
        assert_eq!(config.cache.ttl.consent, 86_400);
        assert_eq!(config.alerts.check_interval_secs, 60);
        assert!(config.remote.credentials().is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = TrafficConfig::from_toml_str(
            r#"
            [rate_limits.api]
            max_requests = 3
            window_secs = 60

            [log_sink]
            capacity = 50
            min_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.rate_limits.api, LimitSpec::new(3, 60));
        assert_eq!(config.rate_limits.auth, LimitSpec::new(10, 900));
        assert_eq!(config.log_sink.capacity, 50);
        assert_eq!(config.log_sink.min_level, LogLevel::Debug);
        assert_eq!(config.metrics.slow_request_ms, 1000);
    }

    #[test]
    fn env_overlay_sets_remote() {
        let vars: HashMap<&str, &str> = [
            ("TW_REMOTE_URL", "https://kv.example.com"),
            ("TW_REMOTE_TOKEN", "secret"),
        ]
        .into_iter()
        .collect();
        let mut config = TrafficConfig::default();
        config.apply_env_from(|name| vars.get(name).map(|v| (*v).to_string()));
        assert_eq!(
            config.remote.credentials(),
            Some(("https://kv.example.com", "secret"))
        );
    }

    #[test]
    fn url_without_token_stays_in_process() {
        let mut config = TrafficConfig::default();
        config.remote.url = Some("https://kv.example.com".into());
        assert!(config.remote.credentials().is_none());
    }

    #[test]
    fn zero_limit_is_rejected() {
        let config = TrafficConfig::from_toml_str(
            "[rate_limits.auth]\nmax_requests = 0\nwindow_secs = 60\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("rate_limits.auth.max_requests"));
    }

    #[test]
    fn unknown_rule_metric_is_rejected() {
        let config = TrafficConfig::from_toml_str(
            r#"
            [[alerts.rules]]
            id = "disk"
            name = "Disk IO"
            metric = "disk_io"
            condition = "greater_than"
            threshold = 10.0
            severity = "low"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownMetric(m)) if m == "disk_io"
        ));
    }

    #[test]
    fn configured_rules_replace_starter_set() {
        let config = TrafficConfig::from_toml_str(
            r#"
            [[alerts.rules]]
            id = "p95"
            name = "Tail latency"
            metric = "response_time_p95"
            condition = "greater_than"
            threshold = 1500.0
            severity = "medium"
            cooldown_minutes = 10

            [[alerts.rules.channels]]
            type = "webhook"
            url = "https://hooks.example.com/alerts"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        let rules = config.alerts.effective_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].channels.len(), 1);
        assert!(rules[0].channels[0].enabled);
        assert_eq!(TrafficConfig::default().alerts.effective_rules().len(), 3);
    }

    #[test]
    fn toml_roundtrip_preserves_limits() {
        let mut config = TrafficConfig::default();
        config.rate_limits.widget = LimitSpec::new(42, 30);
        let text = config.to_toml_string().unwrap();
        let parsed = TrafficConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.rate_limits, config.rate_limits);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = TrafficConfig::load_from(Path::new("/nonexistent/tw.toml")).unwrap_err();
        assert!(matches!(err, crate::Error::Config(ConfigError::Read { .. })));
    }

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::Pretty.to_string(), "pretty");
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
