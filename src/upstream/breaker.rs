//! Per-server circuit breaker.
//!
//! Counters roll over a fixed window. From closed, the breaker trips when
//! the window saw at least `min_requests` and the failure ratio reached
//! `failure_ratio`. It stays open for `open_timeout`, then admits up to
//! `half_open_max` trial requests: all succeed and it closes, any failure
//! reopens it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::config::BreakerConfig;
use crate::error::BreakerError;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    window_start: Instant,
    requests: u64,
    failures: u64,
    opened_at: Option<Instant>,
    half_open_admitted: u64,
    half_open_successes: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            window_start: Instant::now(),
            requests: 0,
            failures: 0,
            opened_at: None,
            half_open_admitted: 0,
            half_open_successes: 0,
        }
    }

    fn reset_window_if_elapsed(&mut self, config: &BreakerConfig) {
        if self.window_start.elapsed() >= config.window {
            self.window_start = Instant::now();
            self.requests = 0;
            self.failures = 0;
        }
    }
}

/// Failure gate for one upstream server.
pub struct CircuitBreaker {
    server: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(server: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            server: server.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Run `f` under the breaker.
    ///
    /// The outer `Result` carries breaker rejections; the inner one is the
    /// wrapped call's own outcome, which is recorded but passed through.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<Result<T, E>, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        let outcome = f().await;
        self.record(outcome.is_ok());
        Ok(outcome)
    }

    /// Admission check; may move open → half-open once the open timeout
    /// has elapsed.
    fn admit(&self) -> Result<(), BreakerError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.open_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return Err(BreakerError::Open {
                        server: self.server.clone(),
                    });
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.half_open_admitted = 1;
                inner.half_open_successes = 0;
                Ok(())
            }
            BreakerState::HalfOpen => {
                if inner.half_open_admitted >= self.config.half_open_max {
                    return Err(BreakerError::TooManyRequests {
                        server: self.server.clone(),
                    });
                }
                inner.half_open_admitted += 1;
                Ok(())
            }
        }
    }

    fn record(&self, success: bool) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.reset_window_if_elapsed(&self.config);
                inner.requests += 1;
                if !success {
                    inner.failures += 1;
                }
                let ratio = inner.failures as f64 / inner.requests as f64;
                if inner.requests >= self.config.min_requests
                    && ratio >= self.config.failure_ratio
                {
                    self.transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max {
                        self.transition(&mut inner, BreakerState::Closed);
                        inner.window_start = Instant::now();
                        inner.requests = 0;
                        inner.failures = 0;
                    }
                } else {
                    self.transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            // A late completion after the breaker reopened; nothing to record.
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        if inner.state != to {
            tracing::warn!(
                server = %self.server,
                from = %inner.state,
                to = %to,
                "circuit breaker state change"
            );
            inner.state = to;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-server breakers, created lazily under a double-checked lock.
pub struct BreakerManager {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
}

impl BreakerManager {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn get_or_create(&self, server: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(breaker) = breakers.get(server) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        if let Some(breaker) = breakers.get(server) {
            return Arc::clone(breaker);
        }
        let breaker = Arc::new(CircuitBreaker::new(server, self.config.clone()));
        breakers.insert(server.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Current state of every known breaker.
    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
        breakers
            .iter()
            .map(|(server, breaker)| (server.clone(), breaker.state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_secs(10),
            min_requests: 5,
            failure_ratio: 0.6,
            open_timeout: Duration::from_millis(50),
            half_open_max: 3,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>("boom") })
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        let _ = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
    }

    #[tokio::test]
    async fn trips_after_failure_threshold() {
        let breaker = CircuitBreaker::new("http://u", fast_config());

        for _ in 0..10 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        // Open: the wrapped function must not run.
        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            result.unwrap_err().to_string(),
            "circuit breaker open for http://u"
        );
    }

    #[tokio::test]
    async fn does_not_trip_below_min_requests() {
        let breaker = CircuitBreaker::new("http://u", fast_config());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_recovers_after_successes() {
        let breaker = CircuitBreaker::new("http://u", fast_config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        for _ in 0..3 {
            succeed(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("http://u", fast_config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn manager_reuses_breakers() {
        let manager = BreakerManager::new(fast_config());
        let a = manager.get_or_create("http://u");
        let b = manager.get_or_create("http://u");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
