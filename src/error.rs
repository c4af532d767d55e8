//! Conclave error types

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Category tag carried by every failure result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Duplicate,
    Overloaded,
    Execution,
    Degraded,
    Config,
}

/// Errors that can occur in the orchestration core
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Malformed input (out-of-range reward, bad feature vector, depth overflow)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Orchestrator or component not registered
    #[error("Not found: {0}")]
    NotFound(String),

    /// Orchestrator name already registered
    #[error("Duplicate orchestrator: {0}")]
    Duplicate(String),

    /// Admission rejected by backpressure
    #[error("Overloaded ({level}): retry after {retry_after:?}")]
    Overloaded {
        level: String,
        retry_after: Duration,
    },

    /// Failure raised by a dispatched orchestrator
    #[error("Execution error in '{orchestrator}': {message}")]
    Execution {
        orchestrator: String,
        message: String,
    },

    /// A lazily-initialized dependency is unavailable
    #[error("Degraded dependency '{dependency}': {reason}")]
    DegradedDependency {
        dependency: String,
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error while loading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConclaveError {
    /// Wrap a failure raised by an orchestrator
    pub fn execution(orchestrator: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Execution {
            orchestrator: orchestrator.into(),
            message: err.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Category tag for structured failure results
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Duplicate(_) => ErrorCategory::Duplicate,
            Self::Overloaded { .. } => ErrorCategory::Overloaded,
            Self::Execution { .. } => ErrorCategory::Execution,
            Self::DegradedDependency { .. } => ErrorCategory::Degraded,
            Self::Config(_) | Self::Io(_) => ErrorCategory::Config,
        }
    }

    /// Overload rejections should be retried with backoff, not immediately
    pub fn is_overloaded(&self) -> bool {
        matches!(self, Self::Overloaded { .. })
    }

    /// Suggested backoff for overload rejections
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Overloaded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConclaveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("malformed payload: {err}"))
    }
}

impl From<toml::de::Error> for ConclaveError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConclaveError>;
