//! Error types shared across the retrieval pipeline.
//!
//! - [`ServiceError`] is a failure of an outbound dependency (messaging
//!   platform, embedding service, chat completion, storage), tagged with a
//!   [`FailureKind`] that the resilience layer uses to decide whether to
//!   retry or count it toward a circuit breaker.
//! - [`Error`] is what library callers branch on.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::resilience::RetryError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification of an outbound failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// HTTP 429 or a platform-level `rate_limited` error.
    RateLimited,
    /// The request did not complete within the client timeout.
    Timeout,
    /// The connection could not be established or was dropped.
    Connection,
    /// The remote service reported a transient server-side failure (5xx).
    Api,
    /// Credentials are missing, invalid, or lack the required scope.
    Unauthorized,
    /// The request was rejected as malformed (4xx other than 429).
    InvalidRequest,
    /// The response could not be parsed or had the wrong shape.
    InvalidResponse,
    /// Local storage I/O failed.
    Io,
    /// A circuit breaker rejected the call without invoking the service.
    CircuitOpen,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::Api => "api",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::Io => "io",
            FailureKind::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to an external dependency.
#[derive(Debug, thiserror::Error)]
#[error("{service} {kind}: {message}")]
pub struct ServiceError {
    pub service: &'static str,
    pub kind: FailureKind,
    pub message: String,
    /// Minimum wait requested by the service before the next attempt.
    pub retry_after: Option<Duration>,
}

impl ServiceError {
    pub fn new(service: &'static str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            service,
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn circuit_open(service: &'static str) -> Self {
        Self::new(
            service,
            FailureKind::CircuitOpen,
            "circuit breaker is open, service unavailable",
        )
    }

    pub fn io(service: &'static str, err: std::io::Error) -> Self {
        Self::new(service, FailureKind::Io, err.to_string())
    }

    /// Classify a transport-level `reqwest` failure.
    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if err.is_connect() || err.is_request() {
            FailureKind::Connection
        } else if err.is_decode() {
            FailureKind::InvalidResponse
        } else if let Some(status) = err.status() {
            Self::kind_for_status(status)
        } else {
            FailureKind::Connection
        };
        Self::new(service, kind, err.to_string())
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(service: &'static str, status: reqwest::StatusCode, body: &str) -> Self {
        let kind = Self::kind_for_status(status);
        Self::new(service, kind, format!("HTTP {}: {}", status, truncate(body, 200)))
    }

    fn kind_for_status(status: reqwest::StatusCode) -> FailureKind {
        match status.as_u16() {
            429 => FailureKind::RateLimited,
            401 | 403 => FailureKind::Unauthorized,
            408 => FailureKind::Timeout,
            s if s >= 500 => FailureKind::Api,
            _ => FailureKind::InvalidRequest,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Errors surfaced by the library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot build an index from zero chunks")]
    EmptyInput,

    #[error("query is empty")]
    EmptyQuery,

    #[error("index has not been built or restored")]
    IndexNotBuilt,

    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("index not found at {}", path.display())]
    IndexNotFound { path: PathBuf },

    #[error("index at {} is corrupt: {message}", path.display())]
    CorruptIndex { path: PathBuf, message: String },

    #[error("invalid message file {}: {message}", path.display())]
    InvalidMessageFile { path: PathBuf, message: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("{last} (gave up after {attempts} attempts)")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: ServiceError,
    },

    #[error("failed to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The outbound failure behind this error, if there is one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Error::Service(err) => Some(err.kind),
            Error::RetriesExhausted { last, .. } => Some(last.kind),
            _ => None,
        }
    }
}

impl From<RetryError<ServiceError>> for Error {
    fn from(err: RetryError<ServiceError>) -> Self {
        match err {
            RetryError::Aborted(inner) => Error::Service(inner),
            RetryError::Exhausted { attempts, last } => Error::RetriesExhausted { attempts, last },
        }
    }
}
