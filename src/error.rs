use std::time::Duration;

use thiserror::Error;

/// Errors raised by user workload code (setup, iterations, teardown).
pub type WorkloadError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid threshold `{expr}` on `{selector}`: {reason}")]
    Threshold {
        selector: String,
        expr: String,
        reason: String,
    },

    #[error("metric `{name}` is already registered as a {existing}, cannot redefine it as a {requested}")]
    MetricKind {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("setup failed: {0}")]
    Setup(WorkloadError),

    #[error("setup timed out after {0:?}")]
    SetupTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn threshold(
        selector: impl Into<String>,
        expr: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Threshold {
            selector: selector.into(),
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors are the ones that happen before any virtual user is started.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Setup(_) | Self::SetupTimeout(_) | Self::Config(_) | Self::Threshold { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HttpError::Timeout
        } else if err.is_connect() {
            HttpError::Connect(err.to_string())
        } else if err.is_builder() {
            HttpError::InvalidRequest(err.to_string())
        } else {
            HttpError::Other(err.to_string())
        }
    }
}
