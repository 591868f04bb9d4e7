//! Error types for trafficwarden-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for trafficwarden-core
///
/// Only [`Error::InvalidInput`] is expected to reach request handlers: backend
/// failures are absorbed by the fallback layer and configuration problems are
/// reported at startup or logged by the loop that hit them.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller-supplied input rejected at the API boundary
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Remote key/value backend errors
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, shutdown races)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidInput`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// One-line hint for resolving the error, used by the CLI.
    #[must_use]
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::InvalidInput(_) => Some("Check the key, TTL or identifier passed by the caller."),
            Self::Config(err) => Some(err.remediation()),
            Self::Backend(_) => {
                Some("Verify TW_REMOTE_URL / TW_REMOTE_TOKEN or unset them to run in-process.")
            }
            Self::Io(_) => Some("Check filesystem permissions and paths, then retry."),
            Self::Json(_) => Some("Validate the JSON input and retry."),
            Self::Runtime(_) => None,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("unknown alert metric: {0}")]
    UnknownMetric(String),

    #[error("invalid alert rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Read { .. } => "Check that the config path exists and is readable.",
            Self::Parse(_) | Self::Serialize(_) => "Fix the TOML syntax reported above.",
            Self::InvalidValue { .. } => "Use a positive value for limits, windows and capacities.",
            Self::UnknownMetric(_) => {
                "Use one of: error_rate, error_count, response_time_avg, response_time_p95, \
                 query_time_avg, memory_usage, api_calls_per_minute, uptime."
            }
            Self::InvalidRule { .. } => "Give the rule a non-empty id and a finite threshold.",
        }
    }
}

/// Errors raised by a key/value backend
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("backend call timed out after {0}ms")]
    Timeout(u64),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(0)
        } else {
            Self::Http(err.to_string())
        }
    }
}
