//! # Circuit Breaker
//!
//! Failure isolation for one class of fallible operation (connecting to the
//! source, reading telemetry).
//!
//! ## State Transitions
//!
//! ```text
//! Closed   -> Open:     failure_count >= failure_threshold
//! Open     -> HalfOpen: first call after reset_timeout has elapsed
//! HalfOpen -> Closed:   trial call succeeds
//! HalfOpen -> Open:     trial call fails
//! ```
//!
//! The Open -> HalfOpen transition is lazy: it happens inside [`CircuitBreaker::call`],
//! never on a timer. While a breaker is open the wrapped operation is not
//! invoked at all.
//!
//! Breakers are grouped in an explicit [`BreakerRegistry`] owned by the
//! composition root.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::clock::unix_timestamp;
use crate::error::{RelayError, Result};

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the reset timeout elapses
    Open,
    /// A single trial call is allowed through
    HalfOpen,
}

/// Point-in-time view of a breaker for health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerState {
    pub name: String,
    pub state: BreakerStatus,
    pub failure_count: u32,
    pub failure_threshold: u32,
    /// Unix seconds of the most recent failure
    pub last_failure_time: Option<f64>,
    /// Reset timeout in seconds
    pub timeout: f64,
}

#[derive(Debug)]
struct Inner {
    status: BreakerStatus,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<f64>,
    trial_in_flight: bool,
}

impl Inner {
    fn closed() -> Self {
        Self {
            status: BreakerStatus::Closed,
            failure_count: 0,
            last_failure: None,
            last_failure_time: None,
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker guarding one operation class
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Marks an admitted HalfOpen trial; reopens the breaker if the trial future
/// is dropped before it settles.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("{}: trial call abandoned, reopening", self.breaker.name);
            self.breaker.on_failure();
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    ///
    /// A zero threshold is treated as 1.
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` under breaker protection
    ///
    /// # Errors
    ///
    /// - [`RelayError::BreakerOpen`] if the breaker rejected the call; `op`
    ///   was not invoked
    /// - the operation's own error otherwise (recorded as a failure)
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use telemetry_relay::resilience::CircuitBreaker;
    ///
    /// # tokio_test::block_on(async {
    /// let breaker = CircuitBreaker::new("telemetry_read", 5, Duration::from_secs(15));
    /// let value = breaker.call(|| async { Ok::<_, telemetry_relay::error::RelayError>(42) }).await?;
    /// assert_eq!(value, 42);
    /// # Ok::<(), telemetry_relay::error::RelayError>(())
    /// # });
    /// ```
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let is_trial = self.admit()?;
        let mut guard = is_trial.then(|| TrialGuard { breaker: self, settled: false });

        let result = op().await;
        if let Some(guard) = guard.as_mut() {
            guard.settled = true;
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    /// Decide whether a call may proceed; `Ok(true)` marks a HalfOpen trial
    fn admit(&self) -> Result<bool> {
        let mut inner = self.lock();
        match inner.status {
            BreakerStatus::Closed => Ok(false),
            BreakerStatus::Open => {
                let eligible = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if !eligible {
                    return Err(self.open_error());
                }
                inner.status = BreakerStatus::HalfOpen;
                inner.trial_in_flight = true;
                info!("{}: Moving to HALF_OPEN state", self.name);
                Ok(true)
            }
            BreakerStatus::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn open_error(&self) -> RelayError {
        RelayError::BreakerOpen { name: self.name.clone() }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        if inner.status == BreakerStatus::HalfOpen {
            info!("{}: Service recovered, moving to CLOSED state", self.name);
        }
        *inner = Inner::closed();
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(unix_timestamp());
        inner.trial_in_flight = false;

        let reopen = inner.status == BreakerStatus::HalfOpen;
        if reopen || (inner.status == BreakerStatus::Closed && inner.failure_count >= self.failure_threshold) {
            warn!(
                "{}: Failure threshold reached ({}), opening circuit breaker",
                self.name, inner.failure_count
            );
            inner.status = BreakerStatus::Open;
        }
    }

    /// Current breaker state
    pub fn get_state(&self) -> BreakerState {
        let inner = self.lock();
        BreakerState {
            name: self.name.clone(),
            state: inner.status,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            last_failure_time: inner.last_failure_time,
            timeout: self.reset_timeout.as_secs_f64(),
        }
    }

    pub fn status(&self) -> BreakerStatus {
        self.lock().status
    }

    /// Force the breaker closed (manual operator intervention)
    pub fn reset(&self) {
        info!("{}: Manually resetting circuit breaker", self.name);
        *self.lock() = Inner::closed();
    }
}

/// Named set of breakers, enumerable and resettable together
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the breaker called `name`, creating it with the given limits if absent
    pub fn register(&self, name: &str, failure_threshold: u32, reset_timeout: Duration) -> Arc<CircuitBreaker> {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, failure_threshold, reset_timeout)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    /// States of every registered breaker, keyed by name
    pub fn states(&self) -> BTreeMap<String, BreakerState> {
        self.lock()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.get_state()))
            .collect()
    }

    pub fn reset_all(&self) {
        for breaker in self.lock().values() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker.call(|| async { Err::<(), _>(RelayError::Source("boom".to_string())) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_opens_exactly_at_threshold() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));

        for _ in 0..2 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.status(), BreakerStatus::Closed, "t-1 failures must not open");
        assert_eq!(breaker.get_state().failure_count, 2);

        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.status(), BreakerStatus::Open);
        assert!(breaker.get_state().last_failure_time.is_some());
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", 3, Duration::from_secs(30));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
        assert_eq!(breaker.get_state().failure_count, 1);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("drone_connection", 1, Duration::from_secs(30));
        fail(&breaker).await.unwrap_err();

        let calls = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        match result {
            Err(RelayError::BreakerOpen { name }) => assert_eq!(name, "drone_connection"),
            other => panic!("Expected BreakerOpen, got: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_half_open_trial_success_closes() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_millis(50));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.status(), BreakerStatus::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        let state = breaker.get_state();
        assert_eq!(state.state, BreakerStatus::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(state.last_failure_time.is_none());
    }

    #[tokio::test]
    async fn test_half_open_trial_failure_reopens() {
        let breaker = CircuitBreaker::new("test", 2, Duration::from_millis(50));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();

        tokio::time::sleep(Duration::from_millis(80)).await;

        fail(&breaker).await.unwrap_err();
        let state = breaker.get_state();
        assert_eq!(state.state, BreakerStatus::Open);
        assert_eq!(state.failure_count, 3);

        // Fresh failure restarts the reset window
        assert!(matches!(succeed(&breaker).await, Err(RelayError::BreakerOpen { .. })));
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let breaker = Arc::new(CircuitBreaker::new("test", 1, Duration::from_millis(20)));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });

        // Let the trial get admitted
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.status(), BreakerStatus::HalfOpen);
        assert!(matches!(succeed(&breaker).await, Err(RelayError::BreakerOpen { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.status(), BreakerStatus::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_trial_reopens() {
        let breaker = Arc::new(CircuitBreaker::new("test", 1, Duration::from_millis(20)));
        fail(&breaker).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let hung = breaker.call(|| std::future::pending::<Result<()>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(20), hung).await;
        assert!(timed_out.is_err());

        assert_eq!(breaker.status(), BreakerStatus::Open);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let breaker = CircuitBreaker::new("test", 1, Duration::from_secs(60));
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.status(), BreakerStatus::Open);

        breaker.reset();
        let state = breaker.get_state();
        assert_eq!(state.state, BreakerStatus::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(state.last_failure_time.is_none());
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }

    #[test]
    fn test_state_reports_configuration() {
        let breaker = CircuitBreaker::new("telemetry_read", 5, Duration::from_secs(15));
        let state = breaker.get_state();
        assert_eq!(state.name, "telemetry_read");
        assert_eq!(state.failure_threshold, 5);
        assert_eq!(state.timeout, 15.0);
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        assert_eq!(serde_json::to_string(&BreakerStatus::HalfOpen).unwrap(), "\"HALF_OPEN\"");
        assert_eq!(serde_json::to_string(&BreakerStatus::Open).unwrap(), "\"OPEN\"");
    }

    #[test]
    fn test_registry_get_or_create() {
        let registry = BreakerRegistry::new();
        let first = registry.register("drone_connection", 3, Duration::from_secs(30));
        let second = registry.register("drone_connection", 9, Duration::from_secs(1));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get_state().failure_threshold, 3);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_registry_reset_all() {
        let registry = BreakerRegistry::new();
        let connection = registry.register("drone_connection", 1, Duration::from_secs(30));
        let telemetry = registry.register("telemetry_read", 1, Duration::from_secs(15));
        fail(&connection).await.unwrap_err();
        fail(&telemetry).await.unwrap_err();

        let states = registry.states();
        assert!(states.values().all(|s| s.state == BreakerStatus::Open));

        registry.reset_all();
        assert!(registry.states().values().all(|s| s.state == BreakerStatus::Closed));
    }
}
