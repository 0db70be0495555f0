//! Error taxonomy shared by jobs, the retrying executor and the orchestrator.
//!
//! Job-local failures are always captured into an `ExecutionResult`; only
//! [`OrchestratorError`] escapes `TaskOrchestrator::run_all`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a job failure, stored on every failed or skipped result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Timeout,
    RateLimited,
    Auth,
    Validation,
    Config,
    Persistence,
    DependencyFailed,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether the retrying executor may run another attempt after this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::RateLimited
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::Config => "config",
            ErrorKind::Persistence => "persistence",
            ErrorKind::DependencyFailed => "dependency_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// Errors raised by an upstream data source for a single batch call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpstreamError {
    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("rate limited by upstream{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

/// Errors raised by a persistence gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("row is missing primary key column '{column}' for table '{table}'")]
    MissingKeyColumn { table: String, column: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("stored value is invalid: {0}")]
    Corrupt(String),
}

/// A failure of one job attempt.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("dependency '{0}' did not succeed")]
    DependencyFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Transient(_) => ErrorKind::Transient,
            JobError::Timeout(_) => ErrorKind::Timeout,
            JobError::RateLimited { .. } => ErrorKind::RateLimited,
            JobError::Auth(_) => ErrorKind::Auth,
            JobError::Validation(_) => ErrorKind::Validation,
            JobError::Config(_) => ErrorKind::Config,
            JobError::Persistence(_) => ErrorKind::Persistence,
            JobError::DependencyFailed(_) => ErrorKind::DependencyFailed,
            JobError::Cancelled => ErrorKind::Cancelled,
            JobError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<UpstreamError> for JobError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Transient(msg) => JobError::Transient(msg),
            UpstreamError::RateLimited { retry_after } => JobError::RateLimited {
                message: "upstream signalled rate limit".to_string(),
                retry_after,
            },
            UpstreamError::Auth(msg) => JobError::Auth(msg),
            UpstreamError::Malformed(msg) => JobError::Validation(msg),
        }
    }
}

// Persistence failures are not retried within a run.
impl From<GatewayError> for JobError {
    fn from(err: GatewayError) -> Self {
        JobError::Persistence(err.to_string())
    }
}

/// Setup errors that abort a whole orchestrator run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("dependency cycle detected involving: {0}")]
    DependencyCycle(String),

    #[error("duplicate job name '{0}'")]
    DuplicateJob(String),

    #[error("concurrency limit must be at least 1")]
    InvalidConcurrency,

    #[error("concurrency limiter closed unexpectedly")]
    LimiterClosed,
}
