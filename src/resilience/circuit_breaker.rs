//! Circuit breaker state machine
//!
//! Isolates a failing dependency: `closed` counts consecutive failures and
//! opens at the threshold; `open` fails fast until the recovery timeout
//! elapses; `half-open` admits trial calls and closes again after enough
//! consecutive successes. Any failure while half-open reopens the circuit.

use crate::error::ServiceError;
use serde::Serialize;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker thresholds and recovery window
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting trial calls
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Point-in-time breaker counters
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub total_calls: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

/// Failure-isolating wrapper around a fallible dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            success_threshold = config.success_threshold,
            "circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Whether a call should be admitted right now. Transitions open →
    /// half-open when the recovery timeout has elapsed.
    pub fn should_allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened) = inner.opened_at
            && opened.elapsed() >= self.config.recovery_timeout
        {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            info!(component = %self.name, "circuit breaker half-open, admitting trial calls");
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    info!(component = %self.name, "circuit breaker closed (recovered)");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => self.open(&mut inner),
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        warn!(
            component = %self.name,
            consecutive_failures = inner.consecutive_failures,
            recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
            "circuit breaker opened, failing fast"
        );
    }

    /// Run `op` under breaker protection. While open, fails immediately
    /// with a `CIRCUIT_OPEN` error and does not invoke `op`.
    pub async fn call<F, Fut, T>(&self, operation: &str, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        if !self.should_allow() {
            return Err(ServiceError::circuit_open(
                operation,
                self.config.recovery_timeout,
            ));
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failures: u32, recovery_ms: u64, successes: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            recovery_timeout: Duration::from_millis(recovery_ms),
            success_threshold: successes,
        }
    }

    async fn failing(cb: &CircuitBreaker) -> Result<(), ServiceError> {
        cb.call("op", || async {
            Err::<(), _>(ServiceError::connection_failed("op", "down"))
        })
        .await
        .map(|_| ())
    }

    #[tokio::test]
    async fn test_starts_closed_and_passes_through() {
        let cb = CircuitBreaker::new("test", config(3, 100, 1));
        assert_eq!(cb.state(), CircuitState::Closed);
        let result = cb.call("op", || async { Ok::<_, ServiceError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = CircuitBreaker::new("test", config(3, 60_000, 1));
        for _ in 0..3 {
            let _ = failing(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Fourth call rejected without invoking the operation
        let mut invoked = false;
        let result = cb
            .call("op", || {
                invoked = true;
                async { Ok::<_, ServiceError>(()) }
            })
            .await;
        assert!(!invoked);
        assert_eq!(result.unwrap_err().code, crate::error::ErrorCode::CircuitOpen);
        assert_eq!(cb.snapshot().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_recovers_through_half_open() {
        let cb = CircuitBreaker::new("test", config(3, 30, 1));
        for _ in 0..3 {
            let _ = failing(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // One successful trial call closes the circuit
        cb.call("op", || async { Ok::<_, ServiceError>(()) })
            .await
            .unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", config(1, 20, 2));
        let _ = failing(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = failing(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_threshold_requires_consecutive_successes() {
        let cb = CircuitBreaker::new("test", config(1, 20, 2));
        let _ = failing(&cb).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        cb.call("op", || async { Ok::<_, ServiceError>(()) })
            .await
            .unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.call("op", || async { Ok::<_, ServiceError>(()) })
            .await
            .unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
