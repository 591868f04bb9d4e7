//! Key/value backends shared by the cache and the rate limiter.
//!
//! The command set mirrors the Redis subset both consumers need:
//! `GET`, `SET .. EX`, `DEL`, `EXISTS`, `INCR` (+ expiry on creation) and
//! `KEYS <glob>`. Values are opaque strings (JSON text in practice).
//!
//! - [`InMemoryBackend`]: sharded in-process map with lazy expiry
//! - [`RestBackend`]: Redis-compatible REST endpoint over HTTPS
//! - [`FallbackBackend`]: tries the remote, serves from its own in-process
//!   map when the remote fails or times out

mod fallback;
mod memory;
mod rest;

pub use fallback::{FallbackBackend, FallbackStats};
pub use memory::InMemoryBackend;
pub use rest::RestBackend;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use regex::Regex;

use crate::error::BackendError;

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Boxed future returned by backend calls.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + Send + 'a>>;

/// Counter value after an `INCR`, plus the time left before it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    pub value: i64,
    /// Remaining lifetime; `None` when the key has no expiry.
    pub ttl: Option<Duration>,
}

/// Async key/value backend interface.
pub trait KvBackend: Send + Sync {
    /// Backend identifier used in logs.
    fn name(&self) -> &'static str;

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<String>>;

    /// Store `value` under `key`, expiring after `ttl`.
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BackendFuture<'a, ()>;

    /// Delete keys, returning how many existed.
    fn delete<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, u64>;

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool>;

    /// Atomically increment `key`. When the increment creates the counter and
    /// `ttl_on_create` is set, the key expires after that duration.
    fn incr<'a>(&'a self, key: &'a str, ttl_on_create: Option<Duration>)
    -> BackendFuture<'a, Counter>;

    /// List keys matching a glob where `*` matches any run of characters.
    fn keys<'a>(&'a self, pattern: &'a str) -> BackendFuture<'a, Vec<String>>;
}

/// Translate a `*` glob into an anchored regex; everything else is literal.
pub fn glob_to_regex(pattern: &str) -> BackendResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).map_err(|e| BackendError::Protocol(e.to_string()))
}

/// Rewrite a `*` glob for Redis `KEYS`, where `?`, `[`, `]` and `\` are also
/// special. Escaping them keeps remote and in-process matching identical.
pub fn to_redis_glob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
