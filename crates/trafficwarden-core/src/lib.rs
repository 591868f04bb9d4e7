//! trafficwarden-core: traffic control and observability for consent APIs
//!
//! Every request path of the consent-management API runs through this crate:
//! admission control, read-through caching, latency metrics, a structured log
//! buffer, and threshold alerting over all of it.
//!
//! # Architecture
//!
//! ```text
//! inbound request → TrafficGate ─→ RateLimiter ─┐
//!                       │                       ├→ FallbackBackend (remote → in-process)
//!                       ├────────→ CacheManager ┘
//!                       ├────────→ MetricStore
//!                       └────────→ LogSink
//!                                      ↑
//!          BackgroundTasks → AlertManager (reads metrics + logs) → notifiers
//! ```
//!
//! # Modules
//!
//! - `backend`: key/value backend trait with in-process, REST and fallback implementations
//! - `cache`: TTL cache with read-through `get_or_set`
//! - `rate_limit`: per-identifier fixed-window admission control
//! - `metrics`: endpoint and normalized-query latency aggregation
//! - `log_sink`: bounded structured log buffer and error frequency table
//! - `alerts`: declarative rules, alert lifecycle and notification fan-out
//! - `telemetry`: process resource observation (resident memory, uptime)
//! - `middleware`: request-facing adapter composing the components above
//! - `scheduler`: periodic sweeps and alert checks with graceful shutdown
//! - `runtime`: composition root built from `config`
//! - `logging`: global `tracing` subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod backend;
pub mod cache;
pub mod clock;
pub mod concurrent_map;
pub mod config;
pub mod error;
pub mod log_sink;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod runtime;
pub mod scheduler;
#[cfg(test)]
mod scripted_http;
pub mod telemetry;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
