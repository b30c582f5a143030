//! Graceful degradation: priority-ordered fallback chains that take over
//! when a primary call fails, times out, or its guarding circuit is open.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::{Error, Result};

/// Why a fallback chain fell through to its fallback providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    PrimaryFailed,
    PrimaryTimeout,
    CircuitOpen,
    Explicit,
}

/// Outcome of one [`DegradationManager::execute`] call.
#[derive(Debug, Clone)]
pub struct FallbackResult<T> {
    pub value: T,
    pub used_fallback: bool,
    /// `0` means the primary answered; `1..` is how many providers down
    /// the fallback list the winning one sat.
    pub fallback_level: usize,
    pub fallback_reason: Option<FallbackReason>,
    pub provider_name: String,
    pub latency_ms: f64,
}

/// A source of last-resort answers, tried in order after the primary call
/// fails. `execute` takes the primary's input so a fallback can reuse it
/// (a cache-backed fallback needs the request to build its lookup key).
#[async_trait]
pub trait FallbackProvider<In: Send + Sync, Out: Send + Sync>: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, input: &In) -> Result<Out>;
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Always returns the same precomputed value.
pub struct StaticFallbackProvider<Out> {
    name: String,
    value: Out,
}

impl<Out: Clone> StaticFallbackProvider<Out> {
    pub fn new(name: impl Into<String>, value: Out) -> Self {
        Self { name: name.into(), value }
    }
}

#[async_trait]
impl<In: Send + Sync, Out: Clone + Send + Sync> FallbackProvider<In, Out> for StaticFallbackProvider<Out> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _input: &In) -> Result<Out> {
        Ok(self.value.clone())
    }
}

/// Serves a previously cached value for the request, falling back to a
/// default when nothing is cached.
pub struct CacheFallbackProvider<In, Out> {
    name: String,
    cache: crate::cache::Cache,
    key_builder: Box<dyn Fn(&In) -> String + Send + Sync>,
    default_value: Option<Out>,
}

impl<In, Out> CacheFallbackProvider<In, Out> {
    pub fn new(
        name: impl Into<String>,
        cache: crate::cache::Cache,
        key_builder: impl Fn(&In) -> String + Send + Sync + 'static,
        default_value: Option<Out>,
    ) -> Self {
        Self { name: name.into(), cache, key_builder: Box::new(key_builder), default_value }
    }
}

#[async_trait]
impl<In: Send + Sync, Out> FallbackProvider<In, Out> for CacheFallbackProvider<In, Out>
where
    Out: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: &In) -> Result<Out> {
        let key = (self.key_builder)(input);
        if let Some(cached) = self.cache.get::<Out>(&key).await? {
            return Ok(cached);
        }
        self.default_value.clone().ok_or_else(|| Error::other("no cached value available"))
    }
}

type AsyncFn<In, Out> = Box<dyn Fn(&In) -> Pin<Box<dyn Future<Output = Result<Out>> + Send>> + Send + Sync>;

/// Wraps an arbitrary async closure as a fallback provider, the escape
/// hatch for any logic that doesn't fit the cache/static shapes.
pub struct FunctionFallbackProvider<In, Out> {
    name: String,
    func: AsyncFn<In, Out>,
}

impl<In, Out> FunctionFallbackProvider<In, Out> {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out>> + Send + 'static,
    {
        Self { name: name.into(), func: Box::new(move |input| Box::pin(func(input))) }
    }
}

#[async_trait]
impl<In: Send + Sync, Out: Send + Sync> FallbackProvider<In, Out> for FunctionFallbackProvider<In, Out> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: &In) -> Result<Out> {
        (self.func)(input).await
    }
}

/// Calls an alternative backend (e.g. a cheaper model) through a pluggable
/// async callback, covering any out-of-process alternative rather than
/// hard-coding a specific LLM fallback.
pub struct AlternativeBackendProvider<In, Out> {
    name: String,
    func: AsyncFn<In, Out>,
}

impl<In, Out> AlternativeBackendProvider<In, Out> {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out>> + Send + 'static,
    {
        Self { name: name.into(), func: Box::new(move |input| Box::pin(func(input))) }
    }
}

#[async_trait]
impl<In: Send + Sync, Out: Send + Sync> FallbackProvider<In, Out> for AlternativeBackendProvider<In, Out> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: &In) -> Result<Out> {
        (self.func)(input).await.map_err(|e| {
            tracing::error!(provider = %self.name, error = %e, "alternative backend fallback failed");
            e
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChainMetrics {
    pub primary_success: u64,
    pub primary_failure: u64,
    pub fallback_used: u64,
}

type PrimaryFn<In, Out> = Box<dyn Fn(&In) -> Pin<Box<dyn Future<Output = Result<Out>> + Send>> + Send + Sync>;

struct Chain<In, Out> {
    primary: PrimaryFn<In, Out>,
    fallbacks: Vec<Arc<dyn FallbackProvider<In, Out>>>,
    timeout: Duration,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
}

/// Owns one fallback chain: a primary async call guarded by an optional
/// circuit breaker and timeout, backstopped by an ordered list of
/// [`FallbackProvider`]s.
///
/// Unlike the rest of the crate's primitives, a chain is generic over its
/// own input/output types rather than erased behind `Value`, so each
/// `DegradationManager` instance handles exactly one request/response shape;
/// a host registering chains by name closes each one over its own call
/// signature.
pub struct DegradationManager<In, Out> {
    chain: Chain<In, Out>,
    metrics: Mutex<ChainMetrics>,
}

impl<In: Send + Sync, Out: Send + Sync> DegradationManager<In, Out> {
    pub fn new<F, Fut>(primary: F, timeout: Duration, circuit_breaker: Option<Arc<CircuitBreaker>>) -> Self
    where
        F: Fn(&In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out>> + Send + 'static,
    {
        Self {
            chain: Chain {
                primary: Box::new(move |input| Box::pin(primary(input))),
                fallbacks: Vec::new(),
                timeout,
                circuit_breaker,
            },
            metrics: Mutex::new(ChainMetrics::default()),
        }
    }

    pub fn add_fallback(mut self, provider: Arc<dyn FallbackProvider<In, Out>>) -> Self {
        self.chain.fallbacks.push(provider);
        self
    }

    pub fn metrics(&self) -> ChainMetrics {
        *self.metrics.lock()
    }

    pub async fn execute(&self, input: In) -> Result<FallbackResult<Out>> {
        self.execute_inner(input, false).await
    }

    pub async fn execute_forcing_fallback(&self, input: In) -> Result<FallbackResult<Out>> {
        self.execute_inner(input, true).await
    }

    async fn execute_inner(&self, input: In, force_fallback: bool) -> Result<FallbackResult<Out>> {
        let start = std::time::Instant::now();

        if !force_fallback {
            if let Some(cb) = &self.chain.circuit_breaker {
                if cb.state() == CircuitState::Open {
                    return self.execute_fallbacks(&input, start, FallbackReason::CircuitOpen, None).await;
                }
            }
        }

        if force_fallback {
            return self.execute_fallbacks(&input, start, FallbackReason::Explicit, None).await;
        }

        match tokio::time::timeout(self.chain.timeout, (self.chain.primary)(&input)).await {
            Ok(Ok(value)) => {
                self.metrics.lock().primary_success += 1;
                Ok(FallbackResult {
                    value,
                    used_fallback: false,
                    fallback_level: 0,
                    fallback_reason: None,
                    provider_name: "primary".into(),
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                })
            }
            Ok(Err(err)) => {
                self.metrics.lock().primary_failure += 1;
                tracing::warn!(error = %err, "primary execution failed");
                self.execute_fallbacks(&input, start, FallbackReason::PrimaryFailed, Some(err)).await
            }
            Err(_) => {
                self.metrics.lock().primary_failure += 1;
                self.execute_fallbacks(&input, start, FallbackReason::PrimaryTimeout, None).await
            }
        }
    }

    async fn execute_fallbacks(
        &self,
        input: &In,
        start: std::time::Instant,
        reason: FallbackReason,
        original_error: Option<Error>,
    ) -> Result<FallbackResult<Out>> {
        for (i, provider) in self.chain.fallbacks.iter().enumerate() {
            if !provider.is_healthy().await {
                tracing::debug!(provider = provider.name(), "fallback unhealthy, skipping");
                continue;
            }
            match provider.execute(input).await {
                Ok(value) => {
                    self.metrics.lock().fallback_used += 1;
                    return Ok(FallbackResult {
                        value,
                        used_fallback: true,
                        fallback_level: i + 1,
                        fallback_reason: Some(reason),
                        provider_name: provider.name().to_string(),
                        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    });
                }
                Err(err) => {
                    tracing::warn!(provider = provider.name(), error = %err, "fallback failed");
                    continue;
                }
            }
        }
        Err(Error::fallbacks_exhausted(
            original_error.unwrap_or_else(|| Error::other("no original error")),
        ))
    }
}

/// Builds a standard degraded-response payload for surfacing to an agent
/// caller, independent of whatever `DegradationManager` produced it.
pub struct DegradedResponse;

impl DegradedResponse {
    pub fn for_agent(message: &str, available_functions: &[&str], unavailable_functions: &[&str]) -> Value {
        serde_json::json!({
            "status": "degraded",
            "message": message,
            "available_functions": available_functions,
            "unavailable_functions": unavailable_functions,
        })
    }

    pub fn for_api(error: &str, retry_after: Option<u64>, fallback_used: bool) -> Value {
        let mut response = serde_json::json!({
            "status": "degraded",
            "error": error,
            "fallback_used": fallback_used,
        });
        if let Some(retry_after) = retry_after {
            response["retry_after"] = Value::from(retry_after);
        }
        response
    }
}
