//! Structured log sink.
//!
//! A bounded, in-process buffer of leveled entries that request handlers
//! write to and the alert manager reads from. Every accepted entry is also
//! mirrored to `tracing`; `fatal` entries are additionally written straight
//! to stderr so they are never only buffered.
//!
//! Error and fatal entries feed an error-frequency table keyed by message and
//! error type, and may be forwarded to an HTTP webhook. A forwarding failure
//! is recorded as a warn entry in the local buffer and goes no further.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::SharedClock;
use crate::config::LogSinkConfig;

/// Number of entries returned in `recent` and `top_errors`.
const ERROR_SUMMARY_LEN: usize = 10;

/// Severity of a [`LogEntry`], ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Error and fatal.
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::Fatal)
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: debug, info, warn, error, fatal"
            )),
        }
    }
}

/// Error attached to a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub type_name: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Capture an error value, naming it by its Rust type.
    pub fn of<E: std::error::Error>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let short = full.rsplit("::").next().unwrap_or(full);
        Self::new(short, err.to_string())
    }
}

/// One buffered log line. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl LogEntry {
    /// The `endpoint` context value, when it is a string.
    pub fn endpoint(&self) -> Option<&str> {
        self.context.get("endpoint").and_then(Value::as_str)
    }
}

/// Optional parts of a log call.
#[derive(Debug, Clone, Default)]
pub struct LogFields {
    context: BTreeMap<String, Value>,
    error: Option<ErrorInfo>,
    request_id: Option<String>,
}

impl LogFields {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// How often one error has been seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorFrequency {
    pub key: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub count: u64,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

/// Aggregate view over the buffer and the frequency table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorMetrics {
    /// Error and fatal entries currently buffered
    pub total: usize,
    pub by_level: BTreeMap<LogLevel, usize>,
    /// Error and fatal entries grouped by their `endpoint` context value
    pub by_endpoint: BTreeMap<String, usize>,
    /// Latest error and fatal entries, most recent first
    pub recent: Vec<LogEntry>,
    /// Highest-count error keys, most frequent first
    pub top_errors: Vec<ErrorFrequency>,
}

pub type ForwardFuture<'a> = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>>;

/// External destination for error and fatal entries.
pub trait LogForwarder: Send + Sync {
    fn name(&self) -> &'static str;

    fn forward<'a>(&'a self, entry: &'a LogEntry) -> ForwardFuture<'a>;
}

/// POSTs each entry as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookForwarder {
    client: reqwest::Client,
    url: String,
}

impl WebhookForwarder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl LogForwarder for WebhookForwarder {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn forward<'a>(&'a self, entry: &'a LogEntry) -> ForwardFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(entry)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(format!("webhook returned {}", response.status()))
            }
        })
    }
}

#[derive(Debug, Default)]
struct SinkState {
    entries: VecDeque<LogEntry>,
    frequencies: HashMap<String, ErrorFrequency>,
}

impl SinkState {
    fn push(&mut self, entry: LogEntry, capacity: usize) {
        while self.entries.len() >= capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

/// Bounded structured log buffer with error-frequency tracking.
pub struct LogSink {
    state: Arc<Mutex<SinkState>>,
    capacity: usize,
    min_level: LogLevel,
    retention: Duration,
    clock: SharedClock,
    forwarder: Option<Arc<dyn LogForwarder>>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("capacity", &self.capacity)
            .field("min_level", &self.min_level)
            .field("forwarder", &self.forwarder.as_ref().map(|fw| fw.name()))
            .finish_non_exhaustive()
    }
}

impl LogSink {
    pub fn new(config: &LogSinkConfig, clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState::default())),
            capacity: config.capacity.max(1),
            min_level: config.min_level,
            retention: Duration::from_secs(config.error_retention_hours * 3600),
            clock,
            forwarder: None,
        }
    }

    #[must_use]
    pub fn with_forwarder(mut self, forwarder: Arc<dyn LogForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn debug(&self, message: impl Into<String>, fields: LogFields) {
        self.log(LogLevel::Debug, message, fields);
    }

    pub fn info(&self, message: impl Into<String>, fields: LogFields) {
        self.log(LogLevel::Info, message, fields);
    }

    pub fn warn(&self, message: impl Into<String>, fields: LogFields) {
        self.log(LogLevel::Warn, message, fields);
    }

    pub fn error(&self, message: impl Into<String>, fields: LogFields) {
        self.log(LogLevel::Error, message, fields);
    }

    pub fn fatal(&self, message: impl Into<String>, fields: LogFields) {
        self.log(LogLevel::Fatal, message, fields);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, fields: LogFields) {
        let entry = LogEntry {
            timestamp_ms: self.clock.now_ms(),
            level,
            message: message.into(),
            context: fields.context,
            error: fields.error,
            request_id: fields.request_id,
        };

        if level == LogLevel::Fatal {
            eprintln!("[FATAL] {}", render_line(&entry));
        }
        // Frequencies count every error call, buffered or not.
        if level.is_error() {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            record_frequency(&mut state.frequencies, &entry);
        }
        if level < self.min_level && level != LogLevel::Fatal {
            return;
        }
        mirror_to_tracing(&entry);

        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone(), self.capacity);

        if level.is_error() {
            self.forward(entry);
        }
    }

    fn forward(&self, entry: LogEntry) {
        let Some(forwarder) = self.forwarder.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            let warning = forward_failure(
                self.clock.now_ms(),
                forwarder.name(),
                "no async runtime on the logging thread".to_string(),
                &entry,
            );
            self.state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(warning, self.capacity);
            return;
        };
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let capacity = self.capacity;
        handle.spawn(async move {
            if let Err(reason) = forwarder.forward(&entry).await {
                let warning = forward_failure(clock.now_ms(), forwarder.name(), reason, &entry);
                state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(warning, capacity);
            }
        });
    }

    /// Up to `limit` entries at or above `min_level`, most recent first.
    pub fn get_recent_logs(&self, limit: usize, min_level: Option<LogLevel>) -> Vec<LogEntry> {
        let floor = min_level.unwrap_or(LogLevel::Debug);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .rev()
            .filter(|e| e.level >= floor)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_error_metrics(&self) -> ErrorMetrics {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut metrics = ErrorMetrics::default();
        for entry in &state.entries {
            *metrics.by_level.entry(entry.level).or_insert(0) += 1;
            if entry.level.is_error() {
                metrics.total += 1;
                if let Some(endpoint) = entry.endpoint() {
                    *metrics.by_endpoint.entry(endpoint.to_string()).or_insert(0) += 1;
                }
            }
        }
        metrics.recent = state
            .entries
            .iter()
            .rev()
            .filter(|e| e.level.is_error())
            .take(ERROR_SUMMARY_LEN)
            .cloned()
            .collect();

        let mut top: Vec<ErrorFrequency> = state.frequencies.values().cloned().collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        top.truncate(ERROR_SUMMARY_LEN);
        metrics.top_errors = top;
        metrics
    }

    /// Percentage of buffered entries within `window` that are error or fatal.
    pub fn error_rate(&self, window: Duration) -> f64 {
        let (errors, total) = self.window_counts(window);
        if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64 * 100.0
        }
    }

    /// Error and fatal entries within `window`.
    pub fn error_count(&self, window: Duration) -> usize {
        self.window_counts(window).0
    }

    fn window_counts(&self, window: Duration) -> (usize, usize) {
        let since = self
            .clock
            .now_ms()
            .saturating_sub(window.as_millis() as u64);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .filter(|e| e.timestamp_ms >= since)
            .fold((0, 0), |(errors, total), e| {
                (errors + usize::from(e.level.is_error()), total + 1)
            })
    }

    /// Drop frequency entries not seen within the retention period.
    /// Returns the number removed.
    pub fn sweep(&self) -> usize {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.retention.as_millis() as u64);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.frequencies.len();
        state.frequencies.retain(|_, f| f.last_seen_ms >= cutoff);
        before - state.frequencies.len()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Empty the buffer and the frequency table.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.clear();
        state.frequencies.clear();
    }
}

fn record_frequency(table: &mut HashMap<String, ErrorFrequency>, entry: &LogEntry) {
    let error_type = entry.error.as_ref().map(|e| e.type_name.clone());
    let key = match &error_type {
        Some(ty) => format!("{}:{ty}", entry.message),
        None => entry.message.clone(),
    };
    table
        .entry(key.clone())
        .and_modify(|f| {
            f.count += 1;
            f.last_seen_ms = entry.timestamp_ms;
        })
        .or_insert_with(|| ErrorFrequency {
            key,
            message: entry.message.clone(),
            error_type,
            count: 1,
            first_seen_ms: entry.timestamp_ms,
            last_seen_ms: entry.timestamp_ms,
        });
}

fn render_line(entry: &LogEntry) -> String {
    let mut line = entry.message.clone();
    if let Some(err) = &entry.error {
        line.push_str(&format!(" ({}: {})", err.type_name, err.message));
    }
    if let Some(id) = &entry.request_id {
        line.push_str(&format!(" request_id={id}"));
    }
    if !entry.context.is_empty() {
        line.push(' ');
        line.push_str(&serde_json::to_string(&entry.context).unwrap_or_default());
    }
    line
}

/// Local warning recorded when an entry could not be forwarded.
fn forward_failure(now_ms: u64, sink: &str, reason: String, entry: &LogEntry) -> LogEntry {
    let warning = LogEntry {
        timestamp_ms: now_ms,
        level: LogLevel::Warn,
        message: "failed to forward log entry".to_string(),
        context: BTreeMap::from([
            ("sink".to_string(), Value::from(sink)),
            ("reason".to_string(), Value::from(reason)),
        ]),
        error: None,
        request_id: entry.request_id.clone(),
    };
    mirror_to_tracing(&warning);
    warning
}

fn mirror_to_tracing(entry: &LogEntry) {
    let request_id = entry.request_id.as_deref().unwrap_or("");
    let context = if entry.context.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&entry.context).unwrap_or_default()
    };
    let error = entry
        .error
        .as_ref()
        .map(|e| format!("{}: {}", e.type_name, e.message))
        .unwrap_or_default();
    match entry.level {
        LogLevel::Debug => {
            tracing::debug!(target: "log_sink", request_id, %context, "{}", entry.message);
        }
        LogLevel::Info => {
            tracing::info!(target: "log_sink", request_id, %context, "{}", entry.message);
        }
        LogLevel::Warn => {
            tracing::warn!(target: "log_sink", request_id, %context, "{}", entry.message);
        }
        LogLevel::Error | LogLevel::Fatal => {
            tracing::error!(
                target: "log_sink",
                level_name = entry.level.as_str(),
                request_id,
                %context,
                %error,
                "{}",
                entry.message
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sink_with(capacity: usize) -> (Arc<ManualClock>, LogSink) {
        let clock = ManualClock::shared(1_000_000);
        let config = LogSinkConfig {
            capacity,
            min_level: LogLevel::Debug,
            ..LogSinkConfig::default()
        };
        (clock.clone(), LogSink::new(&config, clock))
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let (_, sink) = sink_with(3);
        for i in 0..5 {
            sink.info(format!("entry {i}"), LogFields::new());
        }
        let recent = sink.get_recent_logs(10, None);
        let messages: Vec<_> = recent.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["entry 4", "entry 3", "entry 2"]);
    }

    #[test]
    fn recent_logs_filter_by_level() {
        let (_, sink) = sink_with(100);
        sink.debug("d", LogFields::new());
        sink.warn("w", LogFields::new());
        sink.error("e", LogFields::new());
        let recent = sink.get_recent_logs(10, Some(LogLevel::Warn));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "e");
        assert_eq!(sink.get_recent_logs(1, None).len(), 1);
    }

    #[test]
    fn entries_below_min_level_are_dropped() {
        let clock = ManualClock::shared(0);
        let sink = LogSink::new(&LogSinkConfig::default(), clock);
        sink.debug("noise", LogFields::new());
        sink.info("kept", LogFields::new());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn error_frequency_keys_on_message_and_type() {
        let (_, sink) = sink_with(100);
        let timeout = ErrorInfo::new("TimeoutError", "upstream");
        for _ in 0..3 {
            sink.error("db failed", LogFields::new().error(timeout.clone()));
        }
        sink.error("db failed", LogFields::new());
        sink.fatal("out of memory", LogFields::new());

        let metrics = sink.get_error_metrics();
        assert_eq!(metrics.total, 5);
        assert_eq!(metrics.top_errors[0].key, "db failed:TimeoutError");
        assert_eq!(metrics.top_errors[0].count, 3);
        assert_eq!(metrics.top_errors.len(), 3);
        assert_eq!(metrics.by_level.get(&LogLevel::Fatal), Some(&1));
        assert_eq!(metrics.recent[0].message, "out of memory");
    }

    #[test]
    fn errors_grouped_by_endpoint() {
        let (_, sink) = sink_with(100);
        sink.error("boom", LogFields::new().field("endpoint", "/api/consent"));
        sink.error("boom", LogFields::new().field("endpoint", "/api/consent"));
        sink.error("bang", LogFields::new().field("endpoint", "/api/sites"));
        sink.info("ok", LogFields::new().field("endpoint", "/api/sites"));
        let metrics = sink.get_error_metrics();
        assert_eq!(metrics.by_endpoint.get("/api/consent"), Some(&2));
        assert_eq!(metrics.by_endpoint.get("/api/sites"), Some(&1));
    }

    #[test]
    fn error_rate_over_window() {
        let (clock, sink) = sink_with(1000);
        sink.error("stale", LogFields::new());
        clock.advance(Duration::from_secs(600));
        for i in 0..100 {
            if i % 10 == 0 {
                sink.error("request failed", LogFields::new());
            } else {
                sink.info("request ok", LogFields::new());
            }
        }
        let rate = sink.error_rate(Duration::from_secs(300));
        assert!((rate - 10.0).abs() < f64::EPSILON);
        assert_eq!(sink.error_count(Duration::from_secs(300)), 10);
    }

    #[test]
    fn error_rate_empty_is_zero() {
        let (_, sink) = sink_with(10);
        assert!(sink.error_rate(Duration::from_secs(60)).abs() < f64::EPSILON);
    }

    #[test]
    fn sweep_purges_stale_frequencies() {
        let (clock, sink) = sink_with(100);
        sink.error("old", LogFields::new());
        clock.advance(Duration::from_secs(25 * 3600));
        sink.error("new", LogFields::new());
        assert_eq!(sink.sweep(), 1);
        let metrics = sink.get_error_metrics();
        assert_eq!(metrics.top_errors.len(), 1);
        assert_eq!(metrics.top_errors[0].message, "new");
    }

    #[test]
    fn error_info_uses_short_type_name() {
        let err = std::io::Error::other("disk");
        let info = ErrorInfo::of(&err);
        assert_eq!(info.type_name, "Error");
        assert_eq!(info.message, "disk");
    }

    struct FailingForwarder {
        calls: AtomicUsize,
    }

    impl LogForwarder for FailingForwarder {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn forward<'a>(&'a self, _entry: &'a LogEntry) -> ForwardFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err("connection refused".to_string()) })
        }
    }

    #[tokio::test]
    async fn forwarding_failure_becomes_local_warning() {
        let forwarder = Arc::new(FailingForwarder {
            calls: AtomicUsize::new(0),
        });
        let (_, sink) = sink_with(100);
        let sink = sink.with_forwarder(forwarder.clone());

        sink.info("not forwarded", LogFields::new());
        sink.error("forward me", LogFields::new().request_id("req-1"));

        for _ in 0..20 {
            if sink.len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 1);
        let recent = sink.get_recent_logs(1, None);
        assert_eq!(recent[0].level, LogLevel::Warn);
        assert_eq!(recent[0].request_id.as_deref(), Some("req-1"));
        // The warning itself is not forwarded.
        assert_eq!(sink.get_error_metrics().total, 1);
    }

    #[test]
    fn forwarding_outside_a_runtime_leaves_local_warning() {
        let forwarder = Arc::new(FailingForwarder {
            calls: AtomicUsize::new(0),
        });
        let (_, sink) = sink_with(100);
        let sink = Arc::new(sink.with_forwarder(forwarder.clone()));

        let worker = Arc::clone(&sink);
        std::thread::spawn(move || {
            worker.error("worker crashed", LogFields::new().request_id("req-7"));
        })
        .join()
        .unwrap();

        assert_eq!(forwarder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.len(), 2);
        let warning = &sink.get_recent_logs(1, None)[0];
        assert_eq!(warning.level, LogLevel::Warn);
        assert_eq!(warning.message, "failed to forward log entry");
        assert_eq!(warning.context.get("sink"), Some(&Value::from("failing")));
        assert_eq!(warning.request_id.as_deref(), Some("req-7"));
    }

    #[test]
    fn error_frequency_counts_entries_below_min_level() {
        let clock = ManualClock::shared(0);
        let config = LogSinkConfig {
            min_level: LogLevel::Fatal,
            ..LogSinkConfig::default()
        };
        let sink = LogSink::new(&config, clock);
        sink.error("db failed", LogFields::new());
        sink.error("db failed", LogFields::new());
        sink.fatal("out of memory", LogFields::new());

        assert_eq!(sink.len(), 1);
        let metrics = sink.get_error_metrics();
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.top_errors[0].key, "db failed");
        assert_eq!(metrics.top_errors[0].count, 2);
        assert_eq!(metrics.top_errors.len(), 2);
    }
}
