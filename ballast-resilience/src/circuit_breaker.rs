//! Three-state circuit breaker around a single remote dependency.
//!
//! ```text
//!   Closed --(failure_threshold consecutive failures)--> Open
//!   Open   --(recovery_timeout elapsed, next call)-----> HalfOpen (one trial)
//!   HalfOpen --trial ok--> Closed      HalfOpen --trial fails--> Open
//! ```
//!
//! State lives behind one mutex that is only held for the admission decision
//! and for recording the outcome, never across the wrapped call.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ballast_core::constants::{
    DEFAULT_CIRCUIT_CALL_TIMEOUT_MS, DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
    DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS,
};
use ballast_core::{lock_unpoisoned, system_clock, CircuitState, Dependency, RemoteError, SharedClock};
use serde::Serialize;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial call
    pub recovery_timeout: Duration,
    /// Upper bound on each wrapped call
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            recovery_timeout: Duration::from_secs(DEFAULT_CIRCUIT_RECOVERY_TIMEOUT_SECS),
            call_timeout: Duration::from_millis(DEFAULT_CIRCUIT_CALL_TIMEOUT_MS),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create CircuitBreakerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `BALLAST_CIRCUIT_FAILURE_THRESHOLD`: Failures before opening (default: 5)
    /// - `BALLAST_CIRCUIT_RECOVERY_TIMEOUT_SECS`: How long circuit stays open (default: 30)
    /// - `BALLAST_CIRCUIT_CALL_TIMEOUT_MS`: Per-call timeout (default: 10000)
    pub fn from_env() -> Self {
        Self::from_env_with_prefix("BALLAST_CIRCUIT", &Self::default())
    }

    /// Configuration for one dependency.
    ///
    /// Reads `BALLAST_CIRCUIT_<DEP>_*` (e.g. `BALLAST_CIRCUIT_PAYMENTS_CALL_TIMEOUT_MS`),
    /// falling back to the shared `BALLAST_CIRCUIT_*` values.
    pub fn for_dependency(dependency: Dependency) -> Self {
        let shared = Self::from_env();
        let prefix = format!("BALLAST_CIRCUIT_{}", dependency.env_suffix());
        Self::from_env_with_prefix(&prefix, &shared)
    }

    fn from_env_with_prefix(prefix: &str, fallback: &Self) -> Self {
        let failure_threshold = std::env::var(format!("{}_FAILURE_THRESHOLD", prefix))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(fallback.failure_threshold);

        let recovery_timeout = std::env::var(format!("{}_RECOVERY_TIMEOUT_SECS", prefix))
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(fallback.recovery_timeout);

        let call_timeout = std::env::var(format!("{}_CALL_TIMEOUT_MS", prefix))
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(fallback.call_timeout);

        Self {
            failure_threshold,
            recovery_timeout,
            call_timeout,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

// ============================================================================
// BREAKER
// ============================================================================

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
    Rejected,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub success_calls: u64,
    pub failure_calls: u64,
}

/// Circuit breaker for one remote dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: SharedClock,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
    success_calls: AtomicU64,
    failure_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            clock,
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            success_calls: AtomicU64::new(0),
            failure_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        lock_unpoisoned(&self.inner).state
    }

    pub fn failure_count(&self) -> u32 {
        lock_unpoisoned(&self.inner).failure_count
    }

    /// Run `primary` through the breaker.
    ///
    /// Returns `RemoteError::CircuitOpen` without invoking `primary` while the
    /// circuit is open, `RemoteError::Timeout` if the call exceeds
    /// `call_timeout`, or the call's own error. Timeouts and errors both count
    /// as failures.
    pub async fn execute<T, E, F, Fut>(&self, primary: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RemoteError>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let admission = self.admit();
        if admission == Admission::Rejected {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(E::from(RemoteError::CircuitOpen {
                dependency: self.name.clone(),
            }));
        }

        let mut trial = TrialGuard::new(self, admission);
        let outcome = tokio::time::timeout(self.config.call_timeout, primary()).await;
        trial.complete();

        match outcome {
            Ok(Ok(value)) => {
                self.on_success(admission);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure(admission);
                Err(err)
            }
            Err(_) => {
                self.on_failure(admission);
                tracing::warn!(
                    dependency = %self.name,
                    timeout_ms = self.config.call_timeout.as_millis() as u64,
                    "Remote call timed out"
                );
                Err(E::from(RemoteError::Timeout {
                    dependency: self.name.clone(),
                    timeout_ms: self.config.call_timeout.as_millis() as u64,
                }))
            }
        }
    }

    /// Run `primary` through the breaker, answering with `fallback` instead
    /// of an error when the circuit rejects the call or the call fails.
    pub async fn execute_or<T, E, F, Fut, G, GFut>(&self, primary: F, fallback: G) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RemoteError> + std::fmt::Display,
        G: FnOnce() -> GFut,
        GFut: Future<Output = T>,
    {
        match self.execute(primary).await {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(dependency = %self.name, error = %err, "Serving fallback");
                fallback().await
            }
        }
    }

    /// Force the breaker closed (operator override).
    pub fn reset(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
        tracing::info!(dependency = %self.name, "Circuit breaker reset");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let (state, failure_count) = {
            let inner = lock_unpoisoned(&self.inner);
            (inner.state, inner.failure_count)
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            success_calls: self.success_calls.load(Ordering::Relaxed),
            failure_calls: self.failure_calls.load(Ordering::Relaxed),
        }
    }

    fn admit(&self) -> Admission {
        let now = self.clock.now();
        let mut inner = lock_unpoisoned(&self.inner);

        match inner.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at) >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(dependency = %self.name, "Circuit half-open, allowing trial call");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        self.success_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = lock_unpoisoned(&self.inner);
        inner.failure_count = 0;

        if admission == Admission::Trial && inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.last_failure = None;
            inner.trial_in_flight = false;
            tracing::info!(dependency = %self.name, "Circuit closed after successful trial");
        }
    }

    fn on_failure(&self, admission: Admission) {
        self.failure_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut inner = lock_unpoisoned(&self.inner);

        match (admission, inner.state) {
            (Admission::Trial, CircuitState::HalfOpen) => {
                inner.state = CircuitState::Open;
                inner.last_failure = Some(now);
                inner.trial_in_flight = false;
                tracing::warn!(dependency = %self.name, "Trial call failed, circuit re-opened");
            }
            (_, CircuitState::Closed) => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure = Some(now);
                    tracing::warn!(
                        dependency = %self.name,
                        failure_count = inner.failure_count,
                        recovery_timeout_secs = self.config.recovery_timeout.as_secs(),
                        "Circuit opened"
                    );
                }
            }
            // Late failure of a call admitted before the circuit opened
            _ => {
                inner.failure_count = inner.failure_count.saturating_add(1);
            }
        }
    }

    /// Release a trial slot whose call never reported an outcome.
    fn abandon_trial(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock_unpoisoned(&self.inner);
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}

/// Frees the half-open trial slot if the calling future is dropped while the
/// trial call is still pending.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> TrialGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, admission: Admission) -> Self {
        Self {
            breaker,
            armed: admission == Admission::Trial,
        }
    }

    fn complete(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
