//! Cross-module scenarios exercising each primitive the way a host
//! application would, rather than poking at internals.

use std::sync::Arc;
use std::time::Duration;

use resilience_kit::alert::{Alert, AlertManager, AlertRoute, AlertSeverity};
use resilience_kit::cache::{Cache, InMemoryBackend as CacheMemoryBackend};
use resilience_kit::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitState};
use resilience_kit::clock::FixedClock;
use resilience_kit::context::{ContextConfig, ContextWindowManager, Message, MessageRole, TruncationStrategy};
use resilience_kit::error::Error;
use resilience_kit::rate_limiter::{InMemoryBackend as RateLimiterMemoryBackend, RateLimitConfig, RateLimiter};
use resilience_kit::retry::{BackoffStrategy, RetryConfig, RetryExecutor, RetryOutcome};
use resilience_kit::session::{SessionMessage, SessionStore};

// Scenario 1: burst-limited caller (sliding window, 3 req / 10s).
#[tokio::test]
async fn burst_limited_caller_allows_l_requests_then_denies_then_resets() {
    let clock = Arc::new(FixedClock::new(0.0));
    let config = RateLimitConfig::sliding_window(3, 10.0);
    let limiter = RateLimiter::new(config, Arc::new(RateLimiterMemoryBackend::new()), clock.clone());

    for _ in 0..3 {
        let response = limiter.check("caller").await.unwrap();
        assert!(response.allowed);
    }

    let denied = limiter.check("caller").await.unwrap();
    assert!(!denied.allowed);
    assert!((denied.retry_after_secs - 10.0).abs() < 1e-6);

    clock.advance(11.0);
    let allowed_again = limiter.check("caller").await.unwrap();
    assert!(allowed_again.allowed);
}

// Scenario 2: circuit recovery (threshold 3, timeout 1s, success_threshold 2).
#[tokio::test]
async fn circuit_recovers_through_half_open_after_timeout() {
    let clock = Arc::new(FixedClock::new(0.0));
    let config = CircuitConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout_seconds: 1.0,
        ..CircuitConfig::default()
    };
    let breaker = CircuitBreaker::with_clock("vertex-ai", config, clock.clone());

    assert_eq!(breaker.state(), CircuitState::Closed);
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.can_execute());

    clock.advance(1.0);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert!(breaker.can_execute());

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let metrics = breaker.metrics();
    assert_eq!(metrics.state_changes, 2);
}

// Scenario 3: retry with exponential backoff and jitter, always failing.
#[tokio::test]
async fn retry_exhausts_after_max_attempts_with_bounded_delays() {
    let config = RetryConfig::default()
        .with_max_attempts(4)
        .with_base_delay(Duration::from_millis(5))
        .with_backoff_strategy(BackoffStrategy::Exponential)
        .with_backoff_multiplier(2.0);
    let executor = RetryExecutor::new(config);

    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let result = executor
        .execute(|| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err::<(), Error>(Error::other("dependency unreachable"))
            }
        })
        .await;

    assert_eq!(result.outcome, RetryOutcome::Exhausted);
    assert_eq!(result.attempts, 4);
    assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 4);
    assert_eq!(result.delays.len(), 3);
    for (i, delay) in result.delays.iter().enumerate() {
        let base_ms = 5.0 * 2f64.powi(i as i32);
        let lo = base_ms * 0.8 * 0.001;
        let hi = base_ms * 1.2 * 0.001;
        let secs = delay.as_secs_f64();
        assert!(secs >= lo - 1e-6 && secs <= hi + 1e-6, "delay {secs} out of [{lo}, {hi}] for attempt {i}");
    }
}

// Scenario 4: context sliding-window truncation.
#[test]
fn context_sliding_window_keeps_history_under_budget() {
    let config = ContextConfig {
        target_tokens: 50,
        sliding_window_size: 3,
        min_messages: 1,
        truncation_strategy: TruncationStrategy::SlidingWindow,
        ..ContextConfig::default()
    };
    let mut manager = ContextWindowManager::new(config);

    for i in 0..10 {
        manager.add_message(Message::new(MessageRole::User, format!("message number {i}")));
    }

    assert!(manager.message_count() <= 3);
    assert!(manager.current_tokens() <= 50);
}

// Scenario 5: session add/read.
#[tokio::test]
async fn session_create_add_message_and_read_round_trips() {
    let clock = Arc::new(FixedClock::new(100.0));
    let cache = Cache::new(Arc::new(CacheMemoryBackend::new(64, clock.clone())), 3600);
    let store = SessionStore::new(cache, clock.clone(), 50);

    let session_id = store.create_session("u1", None).await.unwrap();
    clock.advance(5.0);
    store
        .add_message(
            &session_id,
            SessionMessage {
                role: "user".into(),
                content: "hi".into(),
                extra: Default::default(),
            },
        )
        .await
        .unwrap();

    let messages = store.get_messages(&session_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, "hi");

    let session = store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.user_id, "u1");
    assert!(session.updated_at >= session.created_at);
}

// Scenario 6: alert dedup + severity/source routing.
#[tokio::test]
async fn alert_manager_dedupes_and_routes_by_severity() {
    use async_trait::async_trait;
    use resilience_kit::alert::{AlertChannel, AlertResult};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingChannel {
        name: &'static str,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl AlertChannel for CountingChannel {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _alert: &Alert) -> AlertResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            AlertResult {
                success: true,
                channel: self.name.to_string(),
                error: None,
            }
        }
    }

    let clock = Arc::new(FixedClock::new(0.0));
    let slack_calls = Arc::new(AtomicU32::new(0));
    let pagerduty_calls = Arc::new(AtomicU32::new(0));

    let mut manager = AlertManager::new(300.0, 100, clock.clone());
    manager.add_channel(Arc::new(CountingChannel { name: "slack", calls: slack_calls.clone() }));
    manager.add_channel(Arc::new(CountingChannel { name: "pagerduty", calls: pagerduty_calls.clone() }));
    manager.add_route(AlertRoute {
        channels: vec!["pagerduty".into()],
        severities: Some(vec![AlertSeverity::Critical]),
        sources: None,
        labels: None,
    });
    manager.add_route(AlertRoute {
        channels: vec!["slack".into()],
        severities: Some(vec![AlertSeverity::Warning, AlertSeverity::Error]),
        sources: None,
        labels: None,
    });

    let alert_a = Alert::new("A", AlertSeverity::Error, "disk pressure", clock.now());
    manager.send_alert(&alert_a, false, false).await;
    manager.send_alert(&alert_a, false, false).await;

    assert_eq!(slack_calls.load(Ordering::SeqCst), 1);
    assert_eq!(pagerduty_calls.load(Ordering::SeqCst), 0);

    let alert_b = Alert::new("B", AlertSeverity::Critical, "region down", clock.now());
    manager.send_alert(&alert_b, false, false).await;

    assert_eq!(pagerduty_calls.load(Ordering::SeqCst), 1);
    assert_eq!(slack_calls.load(Ordering::SeqCst), 1);
}
