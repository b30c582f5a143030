//! Circuit breaker: fail-fast protection for calls to an unreliable
//! dependency, with automatic recovery probing.
//!
//! States: `Closed` (normal operation) -> `Open` (failing fast) ->
//! `HalfOpen` (probing recovery) -> back to `Closed` or `Open`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{SharedClock, system_clock};
use crate::error::{Error, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Failing fast; calls are rejected without being attempted.
    Open,
    /// Testing whether the dependency has recovered.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures (while closed) before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes (while half-open) before the circuit closes.
    pub success_threshold: u32,
    /// Seconds spent open before a half-open probe is allowed.
    pub timeout_seconds: f64,
    /// Alternative trip condition: failure rate within the rolling window.
    pub failure_rate_threshold: f64,
    /// Size of the rolling outcome window used for the rate check.
    pub window_size: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_seconds: 30.0,
            failure_rate_threshold: 0.5,
            window_size: 10,
        }
    }
}

/// Point-in-time metrics for a circuit breaker.
#[derive(Debug, Clone, Default)]
pub struct CircuitMetrics {
    /// Total calls observed (successes + failures).
    pub total_calls: u64,
    /// Calls that completed successfully.
    pub successful_calls: u64,
    /// Calls that failed.
    pub failed_calls: u64,
    /// Calls rejected without being attempted, because the circuit was open.
    pub rejected_calls: u64,
    /// Number of state transitions since creation.
    pub state_changes: u64,
    /// Timestamp of the last recorded failure.
    pub last_failure_time: Option<f64>,
    /// Timestamp of the last recorded success.
    pub last_success_time: Option<f64>,
    /// Cumulative seconds spent in the open state.
    pub time_in_open: f64,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    open_time: Option<f64>,
    results: VecDeque<bool>,
    metrics: CircuitMetrics,
}

/// A callback invoked whenever the circuit transitions between states.
pub type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

/// A predicate identifying errors that should not affect circuit health
/// (e.g. caller-side validation failures that say nothing about the
/// dependency's availability). Errors it accepts never touch the failure
/// counter or the rolling outcome window.
pub type ExclusionPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Circuit breaker guarding calls to a single named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    clock: SharedClock,
    on_state_change: Option<StateChangeCallback>,
    excluded: Option<ExclusionPredicate>,
}

impl CircuitBreaker {
    /// Create a circuit breaker with the given name and config, using the
    /// system clock.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    /// Create a circuit breaker using an explicit clock, for deterministic tests.
    pub fn with_clock(name: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        let window_size = config.window_size;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                open_time: None,
                results: VecDeque::with_capacity(window_size),
                metrics: CircuitMetrics::default(),
            }),
            clock,
            on_state_change: None,
            excluded: None,
        }
    }

    /// Attach a callback fired on every state transition.
    pub fn on_state_change(mut self, callback: StateChangeCallback) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    /// Exclude errors matching `predicate` from circuit accounting: they are
    /// still returned to the caller, but never increment the failure counter
    /// or enter the rolling outcome window, and never trip the circuit.
    pub fn excluding_errors(mut self, predicate: ExclusionPredicate) -> Self {
        self.excluded = Some(predicate);
        self
    }

    fn is_excluded(&self, err: &Error) -> bool {
        self.excluded.as_ref().is_some_and(|predicate| predicate(err))
    }

    /// Circuit name, for logging and registry lookups.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, after applying any pending open-to-half-open timeout.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);
        inner.state
    }

    /// Snapshot of current metrics.
    pub fn metrics(&self) -> CircuitMetrics {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);
        inner.metrics.clone()
    }

    fn check_state_transition(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(open_time) = inner.open_time {
                if self.clock.now() - open_time >= self.config.timeout_seconds {
                    self.transition_to(inner, CircuitState::HalfOpen);
                }
            }
        }
    }

    fn transition_to(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }

        inner.state = new_state;
        inner.metrics.state_changes += 1;

        match new_state {
            CircuitState::Open => {
                inner.open_time = Some(self.clock.now());
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                if let Some(open_time) = inner.open_time {
                    inner.metrics.time_in_open += self.clock.now() - open_time;
                }
                inner.open_time = None;
            }
            CircuitState::HalfOpen => {
                inner.success_count = 0;
            }
        }

        tracing::info!(circuit = %self.name, from = ?old_state, to = ?new_state, "circuit state change");

        if let Some(callback) = &self.on_state_change {
            callback(old_state, new_state);
        }
    }

    /// Whether a call may currently be attempted. `Closed` and `HalfOpen`
    /// (to allow the recovery probe) both permit execution; `Open` does not.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                inner.metrics.rejected_calls += 1;
                false
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        inner.metrics.total_calls += 1;
        inner.metrics.successful_calls += 1;
        inner.metrics.last_success_time = Some(now);
        inner.results.push_back(true);
        if inner.results.len() > self.config.window_size {
            inner.results.pop_front();
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition_to(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        inner.metrics.total_calls += 1;
        inner.metrics.failed_calls += 1;
        inner.metrics.last_failure_time = Some(now);
        inner.results.push_back(false);
        if inner.results.len() > self.config.window_size {
            inner.results.pop_front();
        }

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition_to(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition_to(&mut inner, CircuitState::Open);
                } else if inner.results.len() >= self.config.window_size {
                    let failures = inner.results.iter().filter(|r| !**r).count();
                    let rate = failures as f64 / inner.results.len() as f64;
                    if rate >= self.config.failure_rate_threshold {
                        self.transition_to(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Reset the circuit to closed, clearing all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.open_time = None;
        inner.results.clear();
    }

    /// Run `f` protected by this circuit: reject immediately if open,
    /// otherwise execute and record the outcome.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.can_execute() {
            return Err(Error::circuit_open(self.name.clone()));
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if !self.is_excluded(&err) {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }
}

/// Registry of named circuit breakers, created lazily on first use.
pub struct CircuitBreakerRegistry {
    default_config: CircuitConfig,
    circuits: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    clock: SharedClock,
}

impl CircuitBreakerRegistry {
    /// Create a registry using `default_config` for circuits created without
    /// an explicit override.
    pub fn new(default_config: CircuitConfig) -> Self {
        Self {
            default_config,
            circuits: Mutex::new(HashMap::new()),
            clock: system_clock(),
        }
    }

    /// Create a registry using an explicit clock, for deterministic tests.
    pub fn with_clock(default_config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            default_config,
            circuits: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Get the named circuit, creating it with the default config if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Get the named circuit, creating it with `config` if absent.
    pub fn get_or_create_with(&self, name: &str, config: CircuitConfig) -> Arc<CircuitBreaker> {
        let mut circuits = self.circuits.lock();
        circuits
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_clock(name, config, self.clock.clone())))
            .clone()
    }

    /// Look up an existing circuit without creating one.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuits.lock().get(name).cloned()
    }

    /// Names of all circuits currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        self.circuits
            .lock()
            .values()
            .filter(|c| c.state() == CircuitState::Open)
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Reset every registered circuit to closed.
    pub fn reset_all(&self) {
        for circuit in self.circuits.lock().values() {
            circuit.reset();
        }
    }

    /// Remove a circuit from the registry.
    pub fn remove(&self, name: &str) {
        self.circuits.lock().remove(name);
    }
}

/// Preset configurations for common dependency shapes.
pub struct CircuitPresets;

impl CircuitPresets {
    /// Preset for a model-serving dependency: generous timeout, tolerant of
    /// occasional slow cold starts.
    pub fn model_serving() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_seconds: 60.0,
            failure_rate_threshold: 0.5,
            window_size: 10,
        }
    }

    /// Preset for a generic external API dependency.
    pub fn external_api() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_seconds: 30.0,
            failure_rate_threshold: 0.5,
            window_size: 10,
        }
    }

    /// Preset for a database dependency: trips fast, probes sooner.
    pub fn database() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 5,
            success_threshold: 3,
            timeout_seconds: 10.0,
            failure_rate_threshold: 0.5,
            window_size: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn breaker(config: CircuitConfig) -> (CircuitBreaker, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(0.0));
        let breaker = CircuitBreaker::with_clock("test", config, clock.clone());
        (breaker, clock)
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let (breaker, _clock) = breaker(CircuitConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        for _ in 0..2 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_half_open_after_timeout() {
        let (breaker, clock) = breaker(CircuitConfig {
            failure_threshold: 1,
            timeout_seconds: 30.0,
            ..Default::default()
        });

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(31.0);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let (breaker, clock) = breaker(CircuitConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout_seconds: 10.0,
            ..Default::default()
        });

        breaker.record_failure();
        clock.advance(11.0);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_trips_back_to_open() {
        let (breaker, clock) = breaker(CircuitConfig {
            failure_threshold: 1,
            timeout_seconds: 10.0,
            ..Default::default()
        });

        breaker.record_failure();
        clock.advance(11.0);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_failure_rate_trips_circuit_before_threshold() {
        let (breaker, _clock) = breaker(CircuitConfig {
            failure_threshold: 100,
            failure_rate_threshold: 0.5,
            window_size: 4,
            ..Default::default()
        });

        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failure_count_while_closed() {
        let (breaker, _clock) = breaker(CircuitConfig {
            failure_threshold: 3,
            ..Default::default()
        });

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_rejects_when_open() {
        let (breaker, _clock) = breaker(CircuitConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        breaker.record_failure();

        let result: Result<()> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_call_records_outcome() {
        let (breaker, _clock) = breaker(CircuitConfig::default());

        let ok: Result<i32> = breaker.call(|| async { Ok(42) }).await;
        assert_eq!(ok.unwrap(), 42);
        assert_eq!(breaker.metrics().successful_calls, 1);

        let err: Result<i32> = breaker.call(|| async { Err(Error::other("boom")) }).await;
        assert!(err.is_err());
        assert_eq!(breaker.metrics().failed_calls, 1);
    }

    #[tokio::test]
    async fn test_excluded_errors_do_not_trip_circuit() {
        let clock = Arc::new(FixedClock::new(0.0));
        let breaker = CircuitBreaker::with_clock(
            "test",
            CircuitConfig {
                failure_threshold: 2,
                ..Default::default()
            },
            clock,
        )
        .excluding_errors(Arc::new(|err| matches!(err, Error::ValidationFailed(_))));

        for _ in 0..5 {
            let result: Result<()> = breaker.call(|| async { Err(Error::validation_failed("bad input")) }).await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failed_calls, 0);
        assert_eq!(breaker.metrics().total_calls, 0);

        let result: Result<()> = breaker.call(|| async { Err(Error::other("dependency down")) }).await;
        assert!(result.is_err());
        let result: Result<()> = breaker.call(|| async { Err(Error::other("dependency down")) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_get_or_create_returns_same_instance() {
        let registry = CircuitBreakerRegistry::new(CircuitConfig::default());
        let a = registry.get_or_create("svc");
        let b = registry.get_or_create("svc");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_registry_open_circuits_lists_only_open() {
        let registry = CircuitBreakerRegistry::new(CircuitConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        let a = registry.get_or_create("a");
        registry.get_or_create("b");
        a.record_failure();

        assert_eq!(registry.open_circuits(), vec!["a".to_string()]);
    }

    #[test]
    fn test_registry_reset_all_closes_every_circuit() {
        let registry = CircuitBreakerRegistry::new(CircuitConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        let a = registry.get_or_create("a");
        a.record_failure();
        assert_eq!(a.state(), CircuitState::Open);

        registry.reset_all();
        assert_eq!(a.state(), CircuitState::Closed);
    }
}
