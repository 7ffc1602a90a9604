//! Resilience layer for outbound calls.
//!
//! Two primitives, composed per dependency:
//!
//! | Primitive | Module | Purpose |
//! |-----------|--------|---------|
//! | [`RetryPolicy`] | `retry` | Exponential backoff with jitter over an allow-list of failure kinds |
//! | [`CircuitBreaker`] | `circuit` | Fail fast while a dependency keeps failing |
//!
//! A [`Guard`] wraps each attempt in the breaker and retries the whole
//! thing, so an open circuit surfaces as a non-retryable
//! [`FailureKind::CircuitOpen`] without consuming the retry budget.
//!
//! Each dependency owns its own guard; nothing here is process-global, so
//! two orchestrators built side by side (as in tests) never share counters.

mod circuit;
mod retry;

use std::future::Future;
use std::sync::Arc;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{Classify, RetryConfig, RetryError, RetryObserver, RetryPolicy};

use crate::error::{FailureKind, ServiceError};

/// Failure kinds retried for the messaging platform.
pub const SLACK_RETRYABLE: &[FailureKind] = &[
    FailureKind::RateLimited,
    FailureKind::Api,
    FailureKind::Timeout,
    FailureKind::Connection,
];

/// Failure kinds retried for the embedding service.
pub const EMBEDDING_RETRYABLE: &[FailureKind] = &[
    FailureKind::RateLimited,
    FailureKind::Api,
    FailureKind::Timeout,
    FailureKind::Connection,
];

/// Failure kinds retried for chat completion.
pub const LLM_RETRYABLE: &[FailureKind] = &[
    FailureKind::RateLimited,
    FailureKind::Api,
    FailureKind::Timeout,
    FailureKind::Connection,
];

/// Failure kinds retried for local index storage.
pub const STORAGE_RETRYABLE: &[FailureKind] = &[FailureKind::Io];

/// Retry policy plus circuit breaker for one protected dependency.
#[derive(Debug, Clone)]
pub struct Guard {
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl Guard {
    /// Build a guard whose breaker monitors the same kinds the policy retries.
    pub fn new(
        name: &'static str,
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
        retry_on: &[FailureKind],
    ) -> Self {
        Self {
            retry: RetryPolicy::new(name, retry, retry_on),
            breaker: Arc::new(CircuitBreaker::new(name, breaker, retry_on)),
        }
    }

    /// Share an existing breaker, e.g. one breaker for every Slack endpoint.
    pub fn with_breaker(retry: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { retry, breaker }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, RetryError<ServiceError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.call_observed(op, None).await
    }

    /// Like [`call`](Self::call), with an observer fired before each retry sleep.
    pub async fn call_observed<T, F, Fut>(
        &self,
        mut op: F,
        observer: Option<&RetryObserver<'_, ServiceError>>,
    ) -> Result<T, RetryError<ServiceError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let breaker: &CircuitBreaker = &self.breaker;
        self.retry
            .run_observed(
                move || {
                    let attempt = op();
                    breaker.call(move || attempt)
                },
                observer,
            )
            .await
    }
}
