//! Circuit breaker for cascading failure prevention
//!
//! Closed -> Open after `failure_threshold` consecutive failures.
//! Open -> HalfOpen once `timeout_ms` has elapsed since the last failure.
//! HalfOpen -> Closed after `success_threshold` successes, or back to Open on
//! any failure.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use huddle_protocol::Clock;
use huddle_protocol::Timestamp;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::classifier::RequestError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cool-down before a trial call is let through.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Trial successes required to close again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_success_threshold() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_ms: default_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub last_failure_time: Option<Timestamp>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_time: Option<Timestamp>,
}

impl BreakerInner {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure_time: None,
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.lock().state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner::closed()),
        }
    }

    /// Run `operation` if the breaker admits it and record the outcome.
    ///
    /// While open (and before the cool-down elapses) the operation is never
    /// invoked and a `CircuitOpen` error is returned instead.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, RequestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        self.try_acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(err),
        }
        result
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
            last_failure_time: inner.last_failure_time,
        }
    }

    /// Force the breaker closed and forget all counters.
    pub fn reset(&self) {
        *self.lock() = BreakerInner::closed();
        debug!("circuit breaker reset");
    }

    fn try_acquire(&self) -> Result<(), RequestError> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        let now = self.clock.now_ms();
        let since_failure = inner
            .last_failure_time
            .map_or(u64::MAX, |at| u64::try_from(now.saturating_sub(at)).unwrap_or(0));
        if since_failure >= self.config.timeout_ms {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            info!("circuit breaker half-open, admitting trial request");
            Ok(())
        } else {
            let remaining = Duration::from_millis(self.config.timeout_ms - since_failure);
            Err(RequestError::circuit_open(remaining))
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    *inner = BreakerInner::closed();
                    info!("circuit breaker closed after successful trials");
                }
            }
            // A call admitted before another task opened the circuit.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, err: &RequestError) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        inner.last_failure_time = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        failures = inner.consecutive_failures,
                        error = %err,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                warn!(error = %err, "trial request failed, circuit breaker re-opened");
            }
            CircuitState::Open => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorKind;
    use huddle_protocol::ManualClock;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default(), clock.clone());
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), RequestError> {
        breaker
            .execute(|| async { Err::<(), _>(RequestError::http(503, "unavailable")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), RequestError> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fast_fails() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(30_000);
        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        let err = result.expect_err("open circuit must reject");
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(err.retry_after, Some(Duration::from_millis(30_000)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let (breaker, _clock) = breaker();
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        succeed(&breaker).await.expect("closed breaker admits calls");
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 4);
    }

    #[tokio::test]
    async fn half_open_closes_after_three_successes() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(60_000);

        succeed(&breaker).await.expect("trial admitted");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.expect("trial admitted");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.expect("trial admitted");

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.half_open_successes, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(60_001);
        succeed(&breaker).await.expect("trial admitted");
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = succeed(&breaker).await.expect_err("re-opened circuit rejects");
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let (breaker, _clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.expect("reset breaker admits calls");
    }
}
