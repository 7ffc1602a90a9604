//! Retry with exponential backoff.
//!
//! The delay before retry `n` (0-indexed, counting failed attempts) is
//! `min(initial_delay × base^n, max_delay)`, scaled by a uniform factor in
//! `[0.5, 1.5)` when jitter is on. Only failures whose [`FailureKind`] is on
//! the policy's allow-list are retried; anything else is returned on first
//! occurrence as [`RetryError::Aborted`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use crate::error::{FailureKind, ServiceError};

/// Backoff parameters for one dependency.
///
/// Fields left out of a TOML table fall back to the generic defaults
/// (3 attempts, 1s initial, 60s cap, base 2, jitter on).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    60.0
}
fn default_exponential_base() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Messaging platform: short delays.
    pub fn slack() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 1.0,
            max_delay_secs: 30.0,
            ..Self::default()
        }
    }

    /// Embedding service: very short delays.
    pub fn embedding() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 0.5,
            max_delay_secs: 5.0,
            ..Self::default()
        }
    }

    /// Local index storage: very short delays, fewer attempts.
    pub fn storage() -> Self {
        Self {
            max_attempts: 2,
            initial_delay_secs: 0.5,
            max_delay_secs: 5.0,
            ..Self::default()
        }
    }

    /// Chat completion: long initial delay for strict upstream rate limits.
    pub fn llm() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 10.0,
            max_delay_secs: 120.0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry `attempt` (0-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay_secs * exp).min(self.max_delay_secs);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay before retry `attempt`, with jitter applied when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            base.mul_f64(rand::rng().random_range(0.5..1.5))
        } else {
            base
        }
    }
}

/// Something the retry loop and circuit breaker can classify.
pub trait Classify {
    fn failure_kind(&self) -> Option<FailureKind>;

    /// A server-provided minimum wait before retrying.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Classify for ServiceError {
    fn failure_kind(&self) -> Option<FailureKind> {
        Some(self.kind)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Outcome of a call that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The failure was not retryable and was returned on first occurrence.
    Aborted(E),
    /// Every attempt failed with a retryable error; `last` is the final one.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Aborted(err) => err,
            RetryError::Exhausted { last, .. } => last,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            RetryError::Aborted(err) => err,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Aborted(err) => write!(f, "{}", err),
            RetryError::Exhausted { attempts, last } => {
                write!(f, "{} (gave up after {} attempts)", last, attempts)
            }
        }
    }
}

/// Callback invoked before each backoff sleep with the failure and the
/// 0-indexed attempt that produced it.
pub type RetryObserver<'a, E> = dyn Fn(&E, u32) + Send + Sync + 'a;

/// A retry configuration bound to an allow-list of retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    label: &'static str,
    config: RetryConfig,
    retry_on: Vec<FailureKind>,
}

impl RetryPolicy {
    pub fn new(label: &'static str, config: RetryConfig, retry_on: &[FailureKind]) -> Self {
        Self {
            label,
            config,
            retry_on: retry_on.to_vec(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.run_observed(op, None).await
    }

    /// Like [`run`](Self::run), notifying `observer` before every sleep.
    pub async fn run_observed<T, E, F, Fut>(
        &self,
        mut op: F,
        observer: Option<&RetryObserver<'_, E>>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retryable = err
                .failure_kind()
                .is_some_and(|kind| self.is_retryable(kind));
            if !retryable {
                return Err(RetryError::Aborted(err));
            }

            if attempt + 1 >= max_attempts {
                tracing::error!(
                    dependency = self.label,
                    attempts = max_attempts,
                    error = %err,
                    "giving up after exhausting retries"
                );
                return Err(RetryError::Exhausted {
                    attempts: max_attempts,
                    last: err,
                });
            }

            let mut delay = self.config.delay_for(attempt);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }

            tracing::warn!(
                dependency = self.label,
                attempt = attempt + 1,
                max_attempts,
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "call failed, retrying"
            );

            if let Some(observer) = observer {
                observer(&err, attempt);
            }

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
