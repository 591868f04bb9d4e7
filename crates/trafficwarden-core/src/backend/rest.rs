//! Redis-compatible REST backend.
//!
//! Each command is POSTed to the endpoint root as a JSON array
//! (`["SET", "k", "v", "EX", "300"]`) with a bearer token. Replies are
//! `{"result": ...}` on success and `{"error": "..."}` on failure.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::{BackendFuture, BackendResult, Counter, KvBackend, to_redis_glob};
use crate::error::BackendError;

/// HTTP client for a Redis-compatible REST endpoint.
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl RestBackend {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn command(&self, args: Vec<String>) -> BackendResult<Value> {
        debug!(command = %args.first().map_or("", String::as_str), "remote store command");
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() && body.get("error").is_none() {
            return Err(BackendError::Http(format!("status {status}")));
        }
        parse_reply(body)
    }
}

/// Unwrap a `{"result": ...}` / `{"error": ...}` reply.
pub(crate) fn parse_reply(body: Value) -> BackendResult<Value> {
    match body {
        Value::Object(mut map) => {
            if let Some(err) = map.remove("error") {
                let message = err.as_str().map_or_else(|| err.to_string(), str::to_string);
                return Err(BackendError::Protocol(message));
            }
            map.remove("result")
                .ok_or_else(|| BackendError::Protocol("reply has no result field".to_string()))
        }
        other => Err(BackendError::Protocol(format!("unexpected reply: {other}"))),
    }
}

fn as_int(value: &Value) -> BackendResult<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| BackendError::Protocol(format!("not an integer: {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| BackendError::Protocol(format!("not an integer: {s}"))),
        other => Err(BackendError::Protocol(format!("not an integer: {other}"))),
    }
}

/// Map a `PTTL` reply to a remaining lifetime (negative means no expiry).
fn pttl_to_duration(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

impl KvBackend for RestBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move {
            match self.command(vec!["GET".into(), key.into()]).await? {
                Value::Null => Ok(None),
                Value::String(s) => Ok(Some(s)),
                other => Ok(Some(other.to_string())),
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let secs = ttl.as_secs().max(1);
            self.command(vec![
                "SET".into(),
                key.into(),
                value.into(),
                "EX".into(),
                secs.to_string(),
            ])
            .await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, keys: &'a [String]) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut args = Vec::with_capacity(keys.len() + 1);
            args.push("DEL".to_string());
            args.extend(keys.iter().cloned());
            let removed = as_int(&self.command(args).await?)?;
            Ok(removed.max(0) as u64)
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let count = as_int(&self.command(vec!["EXISTS".into(), key.into()]).await?)?;
            Ok(count > 0)
        })
    }

    fn incr<'a>(
        &'a self,
        key: &'a str,
        ttl_on_create: Option<Duration>,
    ) -> BackendFuture<'a, Counter> {
        Box::pin(async move {
            let value = as_int(&self.command(vec!["INCR".into(), key.into()]).await?)?;
            let pttl = as_int(&self.command(vec!["PTTL".into(), key.into()]).await?)?;
            let mut ttl = pttl_to_duration(pttl);
            // A fresh counter has no expiry yet; the same applies to one whose
            // PEXPIRE was lost, which would otherwise never reset.
            if let (None, Some(window)) = (ttl, ttl_on_create) {
                self.command(vec![
                    "PEXPIRE".into(),
                    key.into(),
                    window.as_millis().to_string(),
                ])
                .await?;
                ttl = Some(window);
            }
            Ok(Counter { value, ttl })
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            match self.command(vec!["KEYS".into(), to_redis_glob(pattern)]).await? {
                Value::Array(items) => Ok(items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()),
                Value::Null => Ok(Vec::new()),
                other => Err(BackendError::Protocol(format!("KEYS returned {other}"))),
            }
        })
    }
}
