//! Circuit breaker.
//!
//! ```text
//!   Closed ──(threshold reached)──▶ Open ──(recovery timeout)──▶ HalfOpen
//!   HalfOpen ──(trial succeeded)──▶ Closed
//!   HalfOpen ──(trial failed)─────▶ Open
//! ```
//!
//! Only failures whose [`FailureKind`] is monitored count toward the
//! threshold. A success while closed resets the counter, so the threshold
//! is a run of consecutive monitored failures.
//!
//! Half-open admits exactly one trial call; concurrent callers are rejected
//! as if the breaker were still open. If the trial future is dropped before
//! it completes (e.g. a caller-side timeout), the slot is released without
//! recording a failure.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use super::retry::Classify;
use crate::error::{FailureKind, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: f64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> f64 {
    60.0
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs.max(0.0))
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Failure isolation for one protected dependency.
///
/// Shared by reference (usually behind an `Arc`) across every call to that
/// dependency; all bookkeeping sits behind a mutex that is never held across
/// an `.await`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    monitored: Vec<FailureKind>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig, monitored: &[FailureKind]) -> Self {
        Self {
            name,
            config,
            monitored: monitored.to_vec(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current state, without advancing Open to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Invoke `op` unless the breaker is open.
    ///
    /// A rejected call never runs `op` and fails with a
    /// [`FailureKind::CircuitOpen`] service error.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<ServiceError>,
    {
        let is_trial = self.admit().map_err(E::from)?;
        let mut slot = TrialSlot {
            breaker: self,
            held: is_trial,
        };

        let result = op().await;
        slot.held = false;

        match &result {
            Ok(_) => self.record_success(is_trial),
            Err(err) => self.record_failure(err.failure_kind(), is_trial),
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide whether a call may proceed. `Ok(true)` means it is the
    /// half-open trial.
    fn admit(&self) -> Result<bool, ServiceError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let ready = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout());
                if ready {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(breaker = self.name, "circuit half-open, allowing trial call");
                    Ok(true)
                } else {
                    Err(ServiceError::circuit_open(self.name))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(ServiceError::circuit_open(self.name))
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Only the half-open trial may close the breaker. A call admitted
    /// before the breaker opened and finishing afterwards changes nothing.
    fn record_success(&self, is_trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if is_trial => {
                tracing::info!(breaker = self.name, "circuit closed after successful trial");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.trial_in_flight = false;
            }
            _ => {}
        }
    }

    fn record_failure(&self, kind: Option<FailureKind>, is_trial: bool) {
        let mut inner = self.lock();
        let monitored = kind.is_some_and(|k| self.monitored.contains(&k));
        if !monitored {
            if is_trial {
                inner.trial_in_flight = false;
            }
            return;
        }

        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen if is_trial => {
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
                tracing::warn!(breaker = self.name, "trial call failed, circuit re-opened");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::error!(
                    breaker = self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Frees the half-open trial slot if the call future is dropped mid-flight.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MONITORED: &[FailureKind] = &[FailureKind::Api, FailureKind::Timeout];

    fn breaker(threshold: u32, recovery_secs: f64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout_secs: recovery_secs,
            },
            MONITORED,
        )
    }

    async fn fail(b: &CircuitBreaker, kind: FailureKind) -> Result<(), ServiceError> {
        b.call(|| async move { Err(ServiceError::new("test", kind, "boom")) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), ServiceError> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker(3, 60.0);
        for _ in 0..3 {
            let _ = fail(&b, FailureKind::Api).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), ServiceError> = b
            .call(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::CircuitOpen);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_count() {
        let b = breaker(3, 60.0);
        let _ = fail(&b, FailureKind::Api).await;
        let _ = fail(&b, FailureKind::Api).await;
        succeed(&b).await.unwrap();
        let _ = fail(&b, FailureKind::Api).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unmonitored_failures_do_not_count() {
        let b = breaker(2, 60.0);
        for _ in 0..5 {
            let _ = fail(&b, FailureKind::Unauthorized).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_success_closes() {
        let b = breaker(1, 30.0);
        let _ = fail(&b, FailureKind::Timeout).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(succeed(&b).await.unwrap_err().kind, FailureKind::CircuitOpen);

        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens_and_restarts_timer() {
        let b = breaker(1, 30.0);
        let _ = fail(&b, FailureKind::Api).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let _ = fail(&b, FailureKind::Api).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(succeed(&b).await.unwrap_err().kind, FailureKind::CircuitOpen);

        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_in_half_open() {
        let b = breaker(1, 10.0);
        let _ = fail(&b, FailureKind::Api).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = b.call(|| async move {
            let _ = release_rx.await;
            Ok::<_, ServiceError>(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let rejected = succeed(&b).await;
            let _ = release_tx.send(());
            rejected
        };

        let (trial_result, second_result) = tokio::join!(trial, second);
        trial_result.unwrap();
        assert_eq!(second_result.unwrap_err().kind, FailureKind::CircuitOpen);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_releases_the_slot() {
        let b = breaker(1, 10.0);
        let _ = fail(&b, FailureKind::Api).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let hung = b.call(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, ServiceError>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), hung).await;
        assert!(timed_out.is_err());

        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.failure_count(), 1);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_success_leaves_open_breaker_open() {
        let b = breaker(1, 60.0);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = b.call(|| async move {
            let _ = release_rx.await;
            Ok::<_, ServiceError>(())
        });
        let opener = async {
            tokio::task::yield_now().await;
            let _ = fail(&b, FailureKind::Api).await;
            tokio::time::advance(Duration::from_secs(5)).await;
            let _ = release_tx.send(());
        };

        let (slow_result, ()) = tokio::join!(slow, opener);
        slow_result.unwrap();
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 1);
        assert_eq!(succeed(&b).await.unwrap_err().kind, FailureKind::CircuitOpen);
    }
}
