//! Retry executor: configurable backoff strategies for transient failures.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{Error, Result};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay every time.
    Constant,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay grows exponentially by `backoff_multiplier` per attempt.
    Exponential,
    /// Delay follows the Fibonacci sequence.
    Fibonacci,
}

/// Outcome of a retry execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The function succeeded within the configured attempts.
    Success,
    /// All attempts were used without success.
    Exhausted,
    /// The total timeout elapsed before another attempt could start.
    Timeout,
    /// A non-retryable error was observed; retrying stopped immediately.
    Aborted,
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt (and the basis for later delays).
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff shape.
    pub backoff_strategy: BackoffStrategy,
    /// Multiplier used by `Exponential` and `Linear`.
    pub backoff_multiplier: f64,
    /// Whether to randomize each delay within `jitter_range`.
    pub jitter: bool,
    /// Multiplicative jitter range, applied when `jitter` is set.
    pub jitter_range: (f64, f64),
    /// Overall wall-clock budget across all attempts, if any.
    pub total_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_range: (0.8, 1.2),
            total_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Start from the defaults and override `max_attempts`.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Override the max delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Override the backoff strategy.
    pub fn with_backoff_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Override the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disable jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Set an overall timeout across all attempts.
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let raw = match self.backoff_strategy {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => base * self.backoff_multiplier.powi(attempt as i32 - 1),
            BackoffStrategy::Fibonacci => base * fibonacci(attempt) as f64,
        };

        let capped = raw.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter {
            let (lo, hi) = self.jitter_range;
            let factor = rand::thread_rng().gen_range(lo..=hi);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Detailed result of a retry execution.
#[derive(Debug)]
pub struct RetryResult<T> {
    /// How the execution ended.
    pub outcome: RetryOutcome,
    /// The successful value, present only when `outcome == Success`.
    pub value: Option<T>,
    /// The last observed error. Present for `Aborted`, `Timeout`, and an
    /// `Exhausted` outcome that ended on a failing attempt; `None` for an
    /// `Exhausted` outcome that ended on a result the result-based retry
    /// predicate kept rejecting.
    pub error: Option<Error>,
    /// Number of attempts actually made.
    pub attempts: u32,
    /// Total wall-clock time spent, including delays.
    pub total_time: Duration,
    /// The delay that preceded each retry (not the first attempt).
    pub delays: Vec<Duration>,
}

/// A predicate deciding whether an error should trigger another attempt.
/// The default classifier treats every error as retryable except
/// [`Error::is_rejection`] errors (pre-execution refusals, not transient
/// failures) and config/usage errors that retrying cannot fix.
pub fn default_is_retryable(err: &Error) -> bool {
    !err.is_rejection() && !matches!(err, Error::InvalidInput(_) | Error::Config(_))
}

/// Executes an async operation with retry, backoff, and an overall timeout.
pub struct RetryExecutor {
    config: RetryConfig,
    is_retryable: Box<dyn Fn(&Error) -> bool + Send + Sync>,
}

impl RetryExecutor {
    /// Build an executor from `config`, retrying on every error that
    /// [`default_is_retryable`] accepts.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            is_retryable: Box::new(default_is_retryable),
        }
    }

    /// Override which errors are considered retryable; fully replaces the
    /// default classifier.
    pub fn retryable_if(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Box::new(predicate);
        self
    }

    /// Run `f`, retrying according to the configured strategy, and return
    /// the full [`RetryResult`] rather than collapsing it to a plain `Result`.
    ///
    /// Every `Ok` value is accepted as a final success. Use
    /// [`execute_with_result_retry`](Self::execute_with_result_retry) when a
    /// successful-but-unsatisfactory result (e.g. a 200 response carrying an
    /// error payload) should itself trigger another attempt.
    pub async fn execute<F, Fut, T>(&self, f: F) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with_result_retry(f, |_| false).await
    }

    /// Run `f`, retrying according to the configured strategy, and also
    /// retrying a successful result when `retry_on_result` returns `true`
    /// for it (a result-based retry predicate, distinct from the
    /// error-based [`retryable_if`](Self::retryable_if) classifier). A
    /// result flagged on the final attempt is still returned as `Exhausted`
    /// rather than `Success`, since it never passed the predicate.
    pub async fn execute_with_result_retry<F, Fut, T, P>(&self, mut f: F, retry_on_result: P) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
        P: Fn(&T) -> bool,
    {
        let start = Instant::now();
        let mut delays = Vec::new();
        let mut last_error: Option<Error> = None;

        for attempt in 1..=self.config.max_attempts {
            if let Some(total_timeout) = self.config.total_timeout {
                if start.elapsed() >= total_timeout {
                    return RetryResult {
                        outcome: RetryOutcome::Timeout,
                        value: None,
                        error: last_error,
                        attempts: attempt - 1,
                        total_time: start.elapsed(),
                        delays,
                    };
                }
            }

            match f().await {
                Ok(value) => {
                    if !retry_on_result(&value) {
                        return RetryResult {
                            outcome: RetryOutcome::Success,
                            value: Some(value),
                            error: None,
                            attempts: attempt,
                            total_time: start.elapsed(),
                            delays,
                        };
                    }

                    last_error = None;

                    if attempt < self.config.max_attempts {
                        let delay = self.config.delay_for_attempt(attempt);
                        delays.push(delay);
                        tracing::warn!(attempt, max_attempts = self.config.max_attempts, delay = ?delay, "retrying on unsatisfactory result");
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => {
                    if !(self.is_retryable)(&err) {
                        return RetryResult {
                            outcome: RetryOutcome::Aborted,
                            value: None,
                            error: Some(err),
                            attempts: attempt,
                            total_time: start.elapsed(),
                            delays,
                        };
                    }

                    last_error = Some(err);

                    if attempt < self.config.max_attempts {
                        let delay = self.config.delay_for_attempt(attempt);
                        delays.push(delay);
                        tracing::warn!(attempt, max_attempts = self.config.max_attempts, delay = ?delay, "retrying after error");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        RetryResult {
            outcome: RetryOutcome::Exhausted,
            value: None,
            error: last_error,
            attempts: self.config.max_attempts,
            total_time: start.elapsed(),
            delays,
        }
    }

    /// Run `f`, collapsing the outcome to a plain [`Result`]: `Exhausted`
    /// becomes [`Error::RetryExhausted`], `Aborted` becomes
    /// [`Error::RetryAborted`], `Timeout` becomes [`Error::TimedOut`].
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.collapse(self.execute(f).await)
    }

    /// Like [`run`](Self::run), but also retries a successful result when
    /// `retry_on_result` returns `true` for it.
    pub async fn run_with_result_retry<F, Fut, T, P>(&self, f: F, retry_on_result: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
        P: Fn(&T) -> bool,
    {
        self.collapse(self.execute_with_result_retry(f, retry_on_result).await)
    }

    fn collapse<T>(&self, result: RetryResult<T>) -> Result<T> {
        match result.outcome {
            RetryOutcome::Success => Ok(result.value.expect("Success outcome always carries a value")),
            RetryOutcome::Exhausted => Err(Error::retry_exhausted(
                result.attempts,
                result
                    .error
                    .unwrap_or_else(|| Error::other("exhausted retrying on an unsatisfactory result")),
            )),
            RetryOutcome::Aborted => Err(Error::retry_aborted(result.error.unwrap_or(Error::TimedOut))),
            RetryOutcome::Timeout => Err(Error::TimedOut),
        }
    }
}

/// Preset retry executors for common dependency shapes.
pub struct RetryPresets;

impl RetryPresets {
    /// Preset for model-serving API calls (rate limits, cold starts).
    pub fn model_serving_api() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60))
                .with_total_timeout(Duration::from_secs(300)),
        )
    }

    /// Preset for generic HTTP API calls.
    pub fn http_api() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(10)),
        )
    }

    /// Preset for database operations: tight delays, short total budget.
    pub fn database() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(2))
                .with_total_timeout(Duration::from_secs(10)),
        )
    }

    /// Preset for message queue operations: Fibonacci backoff.
    pub fn message_queue() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(30))
                .with_backoff_strategy(BackoffStrategy::Fibonacci),
        )
    }

    /// Preset for idempotent operations: many attempts, gentler multiplier.
    pub fn idempotent_operation() -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(10)
                .with_base_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(30))
                .with_backoff_multiplier(1.5)
                .with_total_timeout(Duration::from_secs(120)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_on_first_attempt() {
        let executor = RetryExecutor::new(RetryConfig::default().without_jitter());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .run(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Error>(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_millis(1))
                .without_jitter(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .run(move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::api("transient"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .without_jitter(),
        );

        let result: Result<()> = executor.run(|| async { Err(Error::api("down")) }).await;
        match result {
            Err(Error::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_aborts_immediately_on_non_retryable_error() {
        let executor = RetryExecutor::new(RetryConfig::default().with_max_attempts(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<()> = executor
            .run(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::validation_failed("bad input"))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::RetryAborted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_retryable_predicate_overrides_default() {
        let executor = RetryExecutor::new(RetryConfig::default().with_max_attempts(2))
            .retryable_if(|err| matches!(err, Error::ValidationFailed(_)));

        let result: Result<()> = executor.run(|| async { Err(Error::validation_failed("x")) }).await;
        assert!(matches!(result, Err(Error::RetryExhausted { .. })));
    }

    #[tokio::test]
    async fn test_result_based_predicate_retries_unsatisfactory_success() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .without_jitter(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = executor
            .execute_with_result_retry(
                move || {
                    let calls = calls_clone.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Error>(n)
                    }
                },
                |status_code| *status_code < 2,
            )
            .await;

        assert_eq!(result.outcome, RetryOutcome::Success);
        assert_eq!(result.value, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_result_based_predicate_exhausts_when_never_satisfied() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .without_jitter(),
        );

        let result = executor
            .execute_with_result_retry(|| async { Ok::<_, Error>(0) }, |_| true)
            .await;

        assert_eq!(result.outcome, RetryOutcome::Exhausted);
        assert_eq!(result.value, None);
        assert_eq!(result.attempts, 3);
    }

    #[test]
    fn test_exponential_delay_grows_by_multiplier() {
        let config = RetryConfig::default()
            .with_backoff_strategy(BackoffStrategy::Exponential)
            .with_backoff_multiplier(2.0)
            .with_base_delay(Duration::from_secs(1))
            .without_jitter();

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_linear_delay_grows_by_attempt() {
        let config = RetryConfig::default()
            .with_backoff_strategy(BackoffStrategy::Linear)
            .with_base_delay(Duration::from_secs(2))
            .without_jitter();

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(6));
    }

    #[test]
    fn test_constant_delay_is_fixed() {
        let config = RetryConfig::default()
            .with_backoff_strategy(BackoffStrategy::Constant)
            .with_base_delay(Duration::from_secs(3))
            .without_jitter();

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(3));
    }

    #[test]
    fn test_fibonacci_delay_follows_sequence() {
        let config = RetryConfig::default()
            .with_backoff_strategy(BackoffStrategy::Fibonacci)
            .with_base_delay(Duration::from_secs(1))
            .without_jitter();

        // fib(1)=1, fib(2)=1, fib(3)=2, fib(4)=3, fib(5)=5
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_is_capped_at_max_delay() {
        let config = RetryConfig::default()
            .with_backoff_strategy(BackoffStrategy::Exponential)
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(15))
            .without_jitter();

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_total_timeout_yields_timed_out_error() {
        let executor = RetryExecutor::new(
            RetryConfig::default()
                .with_max_attempts(10)
                .with_base_delay(Duration::from_millis(20))
                .with_total_timeout(Duration::from_millis(5))
                .without_jitter(),
        );

        let result: Result<()> = executor.run(|| async { Err(Error::api("slow")) }).await;
        assert!(matches!(result, Err(Error::TimedOut)));
    }
}
