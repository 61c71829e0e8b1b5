//! Per-target circuit breaker
//!
//! CLOSED counts consecutive failures and trips to OPEN at the threshold.
//! OPEN rejects every call until the recovery timeout has elapsed, then the
//! next call moves the breaker to HALF_OPEN. HALF_OPEN admits at most
//! `half_open_max_calls` trial calls: any failure reopens, and that many
//! successes close the breaker again.
//!
//! Every transition starts a new window. An outcome only counts toward the
//! window its call was admitted in, and a trial dropped before it finishes
//! counts as a failure.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use courier_core::config::CircuitBreakerSettings;
use courier_core::metrics::rpc::CIRCUIT_BREAKER_STATE;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }

    const fn gauge_value(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            recovery_timeout: Duration::from_millis(settings.recovery_timeout_ms),
            half_open_max_calls: settings.half_open_max_calls.max(1),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Consecutive failures while CLOSED
    failure_count: u32,
    /// Successes in the current HALF_OPEN window
    success_count: u32,
    /// Trial calls admitted in the current HALF_OPEN window
    half_open_calls: u32,
    /// Bumped on every transition
    window: u64,
    next_attempt_at: Option<Instant>,
    next_attempt_time: Option<DateTime<Utc>>,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            window: 0,
            next_attempt_at: None,
            next_attempt_time: None,
            last_failure_time: None,
            last_success_time: None,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        };
        breaker.publish_state(CircuitState::Closed);
        breaker
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` if the breaker admits it and record the outcome.
    ///
    /// Rejected calls fail with [`Error::CircuitOpen`] without invoking the
    /// operation.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        permit.settle(result.is_ok());
        result
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut s = self.state.lock();

        if s.state == CircuitState::Open {
            let ready = s.next_attempt_at.is_some_and(|at| Instant::now() >= at);
            if !ready {
                s.rejected_calls += 1;
                return Err(self.rejection(CircuitState::Open));
            }
            self.transition(&mut s, CircuitState::HalfOpen);
        }

        if s.state == CircuitState::HalfOpen {
            if s.half_open_calls >= self.config.half_open_max_calls {
                s.rejected_calls += 1;
                return Err(self.rejection(CircuitState::HalfOpen));
            }
            s.half_open_calls += 1;
        }

        s.total_calls += 1;
        Ok(Permit {
            breaker: self,
            window: s.window,
            settled: false,
        })
    }

    fn on_success(&self, window: u64) {
        let mut s = self.state.lock();
        s.total_successes += 1;
        s.last_success_time = Some(Utc::now());

        if s.window != window {
            debug!(circuit = %self.name, "Ignoring success from an earlier breaker window");
            return;
        }
        match s.state {
            CircuitState::Closed => s.failure_count = 0,
            CircuitState::HalfOpen => {
                s.success_count += 1;
                if s.success_count >= self.config.half_open_max_calls {
                    self.transition(&mut s, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, window: u64) {
        let mut s = self.state.lock();
        s.total_failures += 1;
        s.last_failure_time = Some(Utc::now());

        if s.window != window {
            debug!(circuit = %self.name, "Ignoring failure from an earlier breaker window");
            return;
        }
        match s.state {
            CircuitState::Closed => {
                s.failure_count += 1;
                if s.failure_count >= self.config.failure_threshold {
                    self.transition(&mut s, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut s, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    /// The caller dropped an admitted call before it finished
    fn on_abandoned(&self, window: u64) {
        let mut s = self.state.lock();
        if s.window != window || s.state != CircuitState::HalfOpen {
            return;
        }
        s.total_failures += 1;
        s.last_failure_time = Some(Utc::now());
        warn!(circuit = %self.name, "Half-open trial abandoned before completion");
        self.transition(&mut s, CircuitState::Open);
    }

    fn transition(&self, s: &mut BreakerState, to: CircuitState) {
        let from = s.state;
        s.state = to;
        s.window += 1;
        s.success_count = 0;
        s.half_open_calls = 0;

        match to {
            CircuitState::Open => {
                s.next_attempt_at = Some(Instant::now() + self.config.recovery_timeout);
                s.next_attempt_time = chrono::Duration::from_std(self.config.recovery_timeout)
                    .ok()
                    .map(|timeout| Utc::now() + timeout);
                warn!(
                    circuit = %self.name,
                    from = %from,
                    failures = s.failure_count,
                    retry_after_ms = self.config.recovery_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(circuit = %self.name, "Circuit breaker half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                s.failure_count = 0;
                s.next_attempt_at = None;
                s.next_attempt_time = None;
                info!(circuit = %self.name, from = %from, "Circuit breaker closed");
            }
        }

        self.publish_state(to);
    }

    fn rejection(&self, state: CircuitState) -> Error {
        debug!(circuit = %self.name, state = %state, "Circuit breaker rejected call");
        Error::CircuitOpen {
            target: self.name.clone(),
            state,
        }
    }

    fn publish_state(&self, state: CircuitState) {
        CIRCUIT_BREAKER_STATE
            .with_label_values(&[self.name.as_str()])
            .set(state.gauge_value());
    }

    #[must_use]
    pub fn get_state(&self) -> CircuitState {
        self.state.lock().state
    }

    #[must_use]
    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let s = self.state.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            half_open_calls: s.half_open_calls,
            total_calls: s.total_calls,
            total_successes: s.total_successes,
            total_failures: s.total_failures,
            rejected_calls: s.rejected_calls,
            last_failure_time: s.last_failure_time,
            last_success_time: s.last_success_time,
            next_attempt_time: s.next_attempt_time,
        }
    }

    /// Operator override; forcing OPEN restarts the recovery timer
    pub fn force_state(&self, state: CircuitState) {
        let mut s = self.state.lock();
        info!(circuit = %self.name, state = %state, "Circuit breaker state forced");
        self.transition(&mut s, state);
    }

    /// Back to CLOSED with every counter cleared
    pub fn reset(&self) {
        let mut s = self.state.lock();
        let window = s.window + 1;
        *s = BreakerState::new();
        s.window = window;
        self.publish_state(CircuitState::Closed);
        info!(circuit = %self.name, "Circuit breaker reset");
    }
}

/// Admission of one call; records its outcome against the window it was admitted in
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    window: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, ok: bool) {
        self.settled = true;
        if ok {
            self.breaker.on_success(self.window);
        } else {
            self.breaker.on_failure(self.window);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.window);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.get_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorCode;

    fn breaker(threshold: u32, recovery: Duration, half_open: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "orders",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                half_open_max_calls: half_open,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.execute(|| async {
            Err::<(), _>(Error::transport(TransportErrorCode::ConnectionRefused, "refused"))
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.execute(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_opens_only_on_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60), 1);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_state(), CircuitState::Closed);

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let cb = breaker(1, Duration::from_secs(60), 1);
        fail(&cb).await.unwrap_err();

        let mut invoked = false;
        let err = cb
            .execute(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert!(!invoked);
        assert!(matches!(
            err,
            Error::CircuitOpen {
                state: CircuitState::Open,
                ..
            }
        ));
        assert_eq!(cb.get_metrics().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery_closes_after_trial_successes() {
        let cb = breaker(1, Duration::from_secs(60), 2);
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(59)).await;
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_state(), CircuitState::Open);
        assert_eq!(cb.get_metrics().rejected_calls, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.get_state(), CircuitState::Closed);
        assert_eq!(cb.get_metrics().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_secs(10), 3);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_state(), CircuitState::Open);

        // Recovery timer restarted at the reopen
        let err = succeed(&cb).await.unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_trials() {
        let cb = std::sync::Arc::new(breaker(1, Duration::from_secs(1), 1));
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);

        let err = succeed(&cb).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CircuitOpen {
                state: CircuitState::HalfOpen,
                ..
            }
        ));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_half_open_trial_reopens() {
        let cb = breaker(1, Duration::from_secs(1), 1);
        fail(&cb).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(2)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.execute(|| std::future::pending::<Result<()>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.get_state(), CircuitState::Open);
        assert_eq!(cb.get_metrics().half_open_calls, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_from_earlier_window_is_ignored() {
        let cb = std::sync::Arc::new(breaker(1, Duration::from_secs(1), 1));

        let slow = |cb: std::sync::Arc<CircuitBreaker>, release: tokio::sync::oneshot::Receiver<()>| {
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = release.await;
                    Ok(())
                })
                .await
            })
        };

        // Admitted while CLOSED, finishes after the breaker went half-open
        let (stale_tx, stale_rx) = tokio::sync::oneshot::channel::<()>();
        let stale = slow(cb.clone(), stale_rx);
        tokio::task::yield_now().await;

        fail(&cb).await.unwrap_err();
        assert_eq!(cb.get_state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;

        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = slow(cb.clone(), trial_rx);
        tokio::task::yield_now().await;
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);

        stale_tx.send(()).unwrap();
        stale.await.unwrap().unwrap();
        assert_eq!(cb.get_state(), CircuitState::HalfOpen);
        assert_eq!(cb.get_metrics().success_count, 0);

        trial_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.get_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_state_and_reset() {
        let cb = breaker(5, Duration::from_secs(60), 1);
        cb.force_state(CircuitState::Open);
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
        assert!(cb.get_metrics().next_attempt_time.is_some());

        cb.reset();
        let metrics = cb.get_metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.rejected_calls, 0);
        assert_eq!(succeed(&cb).await.unwrap(), 7);
    }

    #[test]
    fn test_config_from_settings() {
        let config = CircuitBreakerConfig::from(&CircuitBreakerSettings {
            failure_threshold: 2,
            recovery_timeout_ms: 1500,
            half_open_max_calls: 0,
        });
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.recovery_timeout, Duration::from_millis(1500));
        assert_eq!(config.half_open_max_calls, 1);
    }
}
