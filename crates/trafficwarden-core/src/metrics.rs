//! Endpoint and query latency aggregation.
//!
//! Buckets accumulate count, total, min, max and error count; averages and
//! error rates are derived on read. Queries are normalized first so the same
//! statement with different literals lands in one bucket.
//!
//! Alongside the lifetime buckets the store keeps a short log of individual
//! samples, so rate and latency readings can be taken over a recent window.
//! The log covers the last minute unless a consumer asks for more with
//! [`MetricStore::retain_samples_for`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::clock::SharedClock;
use crate::concurrent_map::ShardedMap;
use crate::config::MetricsConfig;

/// Shortest sample span; `api_calls_per_minute` reads this much.
const MIN_SAMPLE_SPAN_MS: u64 = 60_000;

static POSITIONAL_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\d+").expect("static regex"));
static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^'\\]|\\.)*'").expect("static regex"));
static INTEGER_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+\b").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Replace parameters and literals with `?` and collapse whitespace.
pub fn normalize_query(raw: &str) -> String {
    let text = POSITIONAL_PARAM.replace_all(raw, "?");
    let text = STRING_LITERAL.replace_all(&text, "?");
    let text = INTEGER_LITERAL.replace_all(&text, "?");
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Accumulated latency for one endpoint or normalized query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyMetric {
    /// Endpoint name or normalized query text
    pub key: String,
    pub count: u64,
    pub total_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub error_count: u64,
    pub last_updated_ms: u64,
}

pub type EndpointMetric = LatencyMetric;
pub type QueryMetric = LatencyMetric;

impl LatencyMetric {
    fn first(key: String, duration_ms: f64, is_error: bool, now_ms: u64) -> Self {
        Self {
            key,
            count: 1,
            total_time_ms: duration_ms,
            min_time_ms: duration_ms,
            max_time_ms: duration_ms,
            error_count: u64::from(is_error),
            last_updated_ms: now_ms,
        }
    }

    fn observe(&mut self, duration_ms: f64, is_error: bool, now_ms: u64) {
        self.count += 1;
        self.total_time_ms += duration_ms;
        self.min_time_ms = self.min_time_ms.min(duration_ms);
        self.max_time_ms = self.max_time_ms.max(duration_ms);
        self.error_count += u64::from(is_error);
        self.last_updated_ms = now_ms;
    }

    pub fn average_time_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_time_ms / self.count as f64
        }
    }

    /// Fraction of observations that were errors, in `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.count as f64
        }
    }
}

/// Point-in-time totals across all buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub endpoints: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub queries: usize,
    pub avg_query_ms: f64,
    pub api_calls_per_minute: usize,
}

/// One observation in the recent-sample log.
#[derive(Debug, Clone)]
struct Sample {
    at_ms: u64,
    key: String,
    duration_ms: f64,
}

#[derive(Debug, Default)]
struct SampleLog {
    requests: VecDeque<Sample>,
    queries: VecDeque<Sample>,
}

impl SampleLog {
    fn prune(&mut self, cutoff: u64) {
        for log in [&mut self.requests, &mut self.queries] {
            while log.front().is_some_and(|s| s.at_ms < cutoff) {
                log.pop_front();
            }
        }
    }
}

/// In-process latency metrics for endpoints and database queries.
#[derive(Debug)]
pub struct MetricStore {
    endpoints: ShardedMap<String, LatencyMetric>,
    queries: ShardedMap<String, LatencyMetric>,
    samples: Mutex<SampleLog>,
    sample_span_ms: AtomicU64,
    slow_threshold_ms: f64,
    retention: Duration,
    clock: SharedClock,
}

impl MetricStore {
    pub fn new(config: &MetricsConfig, clock: SharedClock) -> Self {
        Self {
            endpoints: ShardedMap::new(),
            queries: ShardedMap::new(),
            samples: Mutex::new(SampleLog::default()),
            sample_span_ms: AtomicU64::new(MIN_SAMPLE_SPAN_MS),
            slow_threshold_ms: config.slow_request_ms as f64,
            retention: Duration::from_secs(config.retention_hours * 3600),
            clock,
        }
    }

    fn samples(&self) -> std::sync::MutexGuard<'_, SampleLog> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keep individual samples for at least `window`, so the windowed
    /// readings below can cover it. The span only grows.
    pub fn retain_samples_for(&self, window: Duration) {
        let ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.sample_span_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// How far back individual samples are kept.
    pub fn sample_span(&self) -> Duration {
        Duration::from_millis(self.sample_span_ms.load(Ordering::Relaxed))
    }

    fn sample_cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.sample_span_ms.load(Ordering::Relaxed))
    }

    /// Record a successful request.
    pub fn record_endpoint(&self, name: &str, duration: Duration) {
        self.record_endpoint_result(name, duration, false);
    }

    pub fn record_endpoint_result(&self, name: &str, duration: Duration, is_error: bool) {
        let now = self.clock.now_ms();
        let ms = duration_ms(duration);
        if ms > self.slow_threshold_ms {
            warn!(endpoint = name, duration_ms = ms, "slow request");
        }
        record(&self.endpoints, name.to_string(), ms, is_error, now);

        let mut samples = self.samples();
        samples.requests.push_back(Sample {
            at_ms: now,
            key: name.to_string(),
            duration_ms: ms,
        });
        samples.prune(self.sample_cutoff(now));
    }

    pub fn record_query(&self, raw_query: &str, duration: Duration, is_error: bool) {
        let now = self.clock.now_ms();
        let ms = duration_ms(duration);
        let normalized = normalize_query(raw_query);
        if ms > self.slow_threshold_ms {
            warn!(query = %normalized, duration_ms = ms, "slow query");
        }
        record(&self.queries, normalized.clone(), ms, is_error, now);

        let mut samples = self.samples();
        samples.queries.push_back(Sample {
            at_ms: now,
            key: normalized,
            duration_ms: ms,
        });
        samples.prune(self.sample_cutoff(now));
    }

    pub fn get_endpoint_metrics(&self, name: &str) -> Option<EndpointMetric> {
        self.endpoints.get(name)
    }

    /// All endpoint buckets, busiest first.
    pub fn get_all_metrics(&self) -> Vec<EndpointMetric> {
        let mut all = self.endpoints.values();
        all.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        all
    }

    /// All query buckets, slowest average first.
    pub fn get_query_metrics(&self) -> Vec<QueryMetric> {
        let mut all = self.queries.values();
        all.sort_by(|a, b| {
            b.average_time_ms()
                .total_cmp(&a.average_time_ms())
                .then_with(|| a.key.cmp(&b.key))
        });
        all
    }

    /// 95th percentile of per-endpoint average times; 0 with no data.
    pub fn p95_response_time(&self) -> f64 {
        p95(self
            .endpoints
            .values()
            .iter()
            .map(LatencyMetric::average_time_ms)
            .collect())
    }

    /// Like [`Self::p95_response_time`], but each endpoint's average only
    /// covers requests from the last `window`.
    pub fn p95_response_time_within(&self, window: Duration) -> f64 {
        let samples = self.samples();
        let mut per_endpoint: HashMap<&str, (f64, u64)> = HashMap::new();
        for sample in recent(&samples.requests, self.window_start(window)) {
            let (total, count) = per_endpoint.entry(sample.key.as_str()).or_default();
            *total += sample.duration_ms;
            *count += 1;
        }
        p95(per_endpoint
            .into_values()
            .map(|(total, count)| total / count as f64)
            .collect())
    }

    /// Mean over every recorded request.
    pub fn average_response_time(&self) -> f64 {
        weighted_average(&self.endpoints.values())
    }

    pub fn average_query_time(&self) -> f64 {
        weighted_average(&self.queries.values())
    }

    /// Mean over requests recorded during the last `window`; 0 with none.
    pub fn average_response_time_within(&self, window: Duration) -> f64 {
        sample_average(&self.samples().requests, self.window_start(window))
    }

    pub fn average_query_time_within(&self, window: Duration) -> f64 {
        sample_average(&self.samples().queries, self.window_start(window))
    }

    /// Requests recorded during the last 60 seconds.
    pub fn api_calls_per_minute(&self) -> usize {
        let since = self.window_start(Duration::from_millis(MIN_SAMPLE_SPAN_MS));
        recent(&self.samples().requests, since).count()
    }

    fn window_start(&self, window: Duration) -> u64 {
        let ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.clock.now_ms().saturating_sub(ms)
    }

    pub fn summary(&self) -> MetricsSummary {
        let endpoints = self.endpoints.values();
        MetricsSummary {
            endpoints: endpoints.len(),
            total_requests: endpoints.iter().map(|m| m.count).sum(),
            total_errors: endpoints.iter().map(|m| m.error_count).sum(),
            avg_response_ms: weighted_average(&endpoints),
            p95_response_ms: self.p95_response_time(),
            queries: self.queries.len(),
            avg_query_ms: self.average_query_time(),
            api_calls_per_minute: self.api_calls_per_minute(),
        }
    }

    /// Drop buckets not updated within the retention period.
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.retention.as_millis() as u64);
        let removed = self.endpoints.retain(|_, m| m.last_updated_ms >= cutoff)
            + self.queries.retain(|_, m| m.last_updated_ms >= cutoff);
        let sample_cutoff = self.sample_cutoff(now);
        self.samples().prune(sample_cutoff);
        removed
    }

    pub fn reset(&self) {
        self.endpoints.clear();
        self.queries.clear();
        let mut samples = self.samples();
        samples.requests.clear();
        samples.queries.clear();
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn record(
    map: &ShardedMap<String, LatencyMetric>,
    key: String,
    ms: f64,
    is_error: bool,
    now: u64,
) {
    let first_key = key.clone();
    map.upsert(key, |slot| {
        if let Some(metric) = slot.as_mut() {
            metric.observe(ms, is_error, now);
        } else {
            *slot = Some(LatencyMetric::first(first_key, ms, is_error, now));
        }
    });
}

/// Samples at or after `since`, newest first.
fn recent(log: &VecDeque<Sample>, since: u64) -> impl Iterator<Item = &Sample> {
    log.iter().rev().take_while(move |s| s.at_ms >= since)
}

fn sample_average(log: &VecDeque<Sample>, since: u64) -> f64 {
    let (total, count) = recent(log, since).fold((0.0, 0u64), |(total, count), s| {
        (total + s.duration_ms, count + 1)
    });
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// `floor(n * 0.95)`-th smallest value; 0 for an empty set.
fn p95(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let idx = ((values.len() as f64) * 0.95).floor() as usize;
    values[idx.min(values.len() - 1)]
}

fn weighted_average(metrics: &[LatencyMetric]) -> f64 {
    let count: u64 = metrics.iter().map(|m| m.count).sum();
    if count == 0 {
        return 0.0;
    }
    metrics.iter().map(|m| m.total_time_ms).sum::<f64>() / count as f64
}
