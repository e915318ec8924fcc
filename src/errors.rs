//! Error types shared across the pipeline.
//!
//! Only [`PipelineError`] aborts a run. Everything else is recorded on the
//! cell, evaluator or summary it came from.

use std::time::Duration;
use thiserror::Error;

/// Failure of a single model invocation, as seen by the scheduler.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The call did not finish within its timeout.
    #[error("call to {model} timed out after {timeout:?}")]
    Timeout { model: String, timeout: Duration },

    /// The provider returned an error.
    #[error("{model} provider error: {message}")]
    Provider {
        model: String,
        message: String,
        retryable: bool,
    },

    /// The provider reported success but the payload was empty.
    #[error("{model} returned an empty response")]
    EmptyResponse { model: String },

    /// The breaker for this model is open; no call was made.
    #[error("circuit breaker open for {model}: skipped after {failures} consecutive failures")]
    CircuitOpen { model: String, failures: u32 },

    /// Missing credentials or invalid request construction.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CallError {
    pub fn provider(model: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            model: model.to_string(),
            message: message.into(),
            retryable,
        }
    }

    /// Whether a retry inside the caller may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::EmptyResponse { .. } => false,
            Self::CircuitOpen { .. } => false,
            Self::Config(_) => false,
        }
    }

    /// Synthetic skips are recorded like failures but never counted by the breaker.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Short code for structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Provider { .. } => "provider_error",
            Self::EmptyResponse { .. } => "empty_response",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Config(_) => "config_error",
        }
    }
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("run config is missing its {0}; the result could not be addressed")]
    MissingRunIdentity(&'static str),
}

/// Errors from a [`crate::store::ResultStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
