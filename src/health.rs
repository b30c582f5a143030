//! Kubernetes-style health checking: pluggable components aggregated into
//! liveness, readiness, and startup probes.
//!
//! Route registration against a particular HTTP framework is left to the
//! caller; this module owns only the aggregation logic and result shape an
//! HTTP handler would serialize.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Coarse health classification for a component or the whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
    Unknown,
}

/// Health of a single registered component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub latency_ms: Option<f64>,
    pub metadata: HashMap<String, Value>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self { name: name.into(), status, message: None, latency_ms: None, metadata: HashMap::new() }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Aggregated result of running every registered [`HealthCheckComponent`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub components: HashMap<String, ComponentHealth>,
    pub version: Option<String>,
}

/// A single pluggable health probe (a database ping, a downstream API
/// check, anything with a pass/fail/degraded verdict).
#[async_trait]
pub trait HealthCheckComponent: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ComponentHealth;
}

/// Wraps an async closure as a [`HealthCheckComponent`], timing it and
/// converting a timeout into an unhealthy verdict rather than propagating
/// an error — a health check that errors out is itself a health signal.
pub struct FunctionHealthCheck<F> {
    name: String,
    timeout: Duration,
    check_fn: F,
}

impl<F, Fut> FunctionHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), String>> + Send,
{
    pub fn new(name: impl Into<String>, timeout: Duration, check_fn: F) -> Self {
        Self { name: name.into(), timeout, check_fn }
    }
}

#[async_trait]
impl<F, Fut> HealthCheckComponent for FunctionHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), String>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> ComponentHealth {
        let start = std::time::Instant::now();
        match tokio::time::timeout(self.timeout, (self.check_fn)()).await {
            Ok(Ok(())) => ComponentHealth::new(&self.name, HealthStatus::Healthy)
                .with_message("check passed")
                .with_latency_ms(start.elapsed().as_secs_f64() * 1000.0),
            Ok(Err(message)) => ComponentHealth::new(&self.name, HealthStatus::Unhealthy).with_message(message),
            Err(_) => ComponentHealth::new(&self.name, HealthStatus::Unhealthy)
                .with_message(format!("timed out after {:.1}s", self.timeout.as_secs_f64())),
        }
    }
}

/// Pings a remote TTL-cache/session backend to verify connectivity,
/// wrapping [`crate::cache::CacheBackend::exists`] with a probe key.
pub struct CacheHealthCheck {
    name: String,
    backend: Arc<dyn crate::cache::CacheBackend>,
    timeout: Duration,
}

impl CacheHealthCheck {
    pub fn new(name: impl Into<String>, backend: Arc<dyn crate::cache::CacheBackend>, timeout: Duration) -> Self {
        Self { name: name.into(), backend, timeout }
    }
}

#[async_trait]
impl HealthCheckComponent for CacheHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> ComponentHealth {
        let start = std::time::Instant::now();
        match tokio::time::timeout(self.timeout, self.backend.exists("__healthcheck__")).await {
            Ok(Ok(_)) => ComponentHealth::new(&self.name, HealthStatus::Healthy)
                .with_message("responding")
                .with_latency_ms(start.elapsed().as_secs_f64() * 1000.0),
            Ok(Err(err)) => ComponentHealth::new(&self.name, HealthStatus::Unhealthy).with_message(err.to_string()),
            Err(_) => ComponentHealth::new(&self.name, HealthStatus::Unhealthy)
                .with_message(format!("timed out after {:.1}s", self.timeout.as_secs_f64())),
        }
    }
}

struct StartupState {
    complete: bool,
}

/// Owns the registered component set and the startup-complete flag, and
/// aggregates per-component verdicts into liveness/readiness/startup
/// probe results.
pub struct HealthChecker {
    version: Option<String>,
    fail_on_degraded: bool,
    components: Vec<Arc<dyn HealthCheckComponent>>,
    startup: Mutex<StartupState>,
}

impl HealthChecker {
    pub fn new(version: Option<String>, fail_on_degraded: bool) -> Self {
        Self {
            version,
            fail_on_degraded,
            components: Vec::new(),
            startup: Mutex::new(StartupState { complete: false }),
        }
    }

    pub fn add_component(&mut self, component: Arc<dyn HealthCheckComponent>) {
        self.components.push(component);
    }

    pub fn mark_startup_complete(&self) {
        self.startup.lock().complete = true;
    }

    pub async fn check_health(&self) -> HealthCheckResult {
        let mut components = HashMap::new();
        let results = futures::future::join_all(self.components.iter().map(|c| c.check())).await;
        for result in results {
            components.insert(result.name.clone(), result);
        }

        let statuses: Vec<HealthStatus> = components.values().map(|c| c.status).collect();
        let overall = if statuses.is_empty() {
            HealthStatus::Healthy
        } else if statuses.contains(&HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if statuses.contains(&HealthStatus::Degraded) {
            if self.fail_on_degraded {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            }
        } else {
            HealthStatus::Healthy
        };

        HealthCheckResult { status: overall, components, version: self.version.clone() }
    }

    /// Liveness should be instant and never reach out to a dependency —
    /// Kubernetes restarts the container if it fails.
    pub async fn check_liveness(&self) -> bool {
        true
    }

    pub async fn check_readiness(&self) -> HealthCheckResult {
        self.check_health().await
    }

    pub async fn check_startup(&self) -> bool {
        self.startup.lock().complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCheck {
        name: &'static str,
        status: HealthStatus,
    }

    #[async_trait]
    impl HealthCheckComponent for FixedCheck {
        fn name(&self) -> &str {
            self.name
        }
        async fn check(&self) -> ComponentHealth {
            ComponentHealth::new(self.name, self.status)
        }
    }

    #[tokio::test]
    async fn test_no_components_reports_healthy() {
        let checker = HealthChecker::new(None, false);
        let result = checker.check_health().await;
        assert_eq!(result.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_one_unhealthy_component_fails_overall() {
        let mut checker = HealthChecker::new(None, false);
        checker.add_component(Arc::new(FixedCheck { name: "db", status: HealthStatus::Healthy }));
        checker.add_component(Arc::new(FixedCheck { name: "cache", status: HealthStatus::Unhealthy }));
        let result = checker.check_health().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_degraded_without_fail_flag_stays_degraded() {
        let mut checker = HealthChecker::new(None, false);
        checker.add_component(Arc::new(FixedCheck { name: "cache", status: HealthStatus::Degraded }));
        let result = checker.check_health().await;
        assert_eq!(result.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_degraded_with_fail_flag_becomes_unhealthy() {
        let mut checker = HealthChecker::new(None, true);
        checker.add_component(Arc::new(FixedCheck { name: "cache", status: HealthStatus::Degraded }));
        let result = checker.check_health().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_liveness_always_true() {
        let checker = HealthChecker::new(None, false);
        assert!(checker.check_liveness().await);
    }

    #[tokio::test]
    async fn test_startup_false_until_marked_complete() {
        let checker = HealthChecker::new(None, false);
        assert!(!checker.check_startup().await);
        checker.mark_startup_complete();
        assert!(checker.check_startup().await);
    }

    #[tokio::test]
    async fn test_function_health_check_times_out_as_unhealthy() {
        let check = FunctionHealthCheck::new("slow", Duration::from_millis(1), || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let result = check.check().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_function_health_check_reports_failure_message() {
        let check = FunctionHealthCheck::new("db", Duration::from_secs(1), || async { Err("connection refused".to_string()) });
        let result = check.check().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.message.as_deref(), Some("connection refused"));
    }
}
