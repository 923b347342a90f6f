//! Circuit breaker guarding calls to a flaky dependency.
//!
//! `CLOSED → OPEN` after `failure_threshold` consecutive failures. While
//! OPEN, calls fail fast without invoking the inner function until
//! `recovery_timeout` elapses, at which point the breaker goes HALF_OPEN and
//! admits trial calls. `success_threshold` consecutive successes close it
//! again; any HALF_OPEN failure reopens it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without invoking the inner function.
    #[error("circuit breaker is open")]
    Open,
    /// The inner function ran and failed.
    #[error("{0}")]
    Inner(E),
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
            failure_threshold,
            recovery_timeout,
            success_threshold,
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.admit(&mut inner);
        inner.state
    }

    /// Run `f` through the breaker. The lock is not held across the call.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !self.admit(&mut inner) {
                return Err(BreakerError::Open);
            }
        }

        match f() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Transition OPEN→HALF_OPEN once the recovery timeout has elapsed.
    /// Returns whether a call may proceed.
    fn admit(&self, inner: &mut BreakerInner) -> bool {
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure_time
                .map(|t| t.elapsed() >= self.recovery_timeout)
                .unwrap_or(true);
            if elapsed {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
            }
        }
        inner.state != CircuitState::Open
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker reopened after half-open failure");
                inner.state = CircuitState::Open;
                inner.success_count = 0;
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing_call(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(|| Err::<(), _>("boom"))
    }

    #[test]
    fn opens_after_threshold_and_rejects_without_invoking() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60), 1);
        assert!(failing_call(&breaker).is_err());
        assert!(failing_call(&breaker).is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = breaker.call(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, &str>(())
        });
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn success_resets_consecutive_failure_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60), 1);
        assert!(failing_call(&breaker).is_err());
        assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
        assert!(failing_call(&breaker).is_err());
        // Failures were not consecutive, so still closed
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn recovers_through_half_open_to_closed() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20), 2);
        assert!(failing_call(&breaker).is_err());
        assert!(failing_call(&breaker).is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);

        // Calls pass through normally again
        assert!(breaker.call(|| Ok::<_, &str>(())).is_ok());
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10), 1);
        assert!(failing_call(&breaker).is_err());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(failing_call(&breaker).is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.call(|| Ok::<_, &str>(())),
            Err(BreakerError::Open)
        ));
    }
}
