//! Opt-in environment-variable convenience constructors.
//!
//! Nothing in this crate reads the environment on its own — every primitive
//! takes an explicit configuration struct. This module exists only for host
//! applications that want to seed the handful of settings commonly sourced
//! from the environment (a remote-store URL, alert-channel webhook URLs and
//! credentials) without writing their own `std::env::var` plumbing. Call
//! these explicitly at your own startup; nothing here runs implicitly.

use std::env;

/// Resolves a Redis connection URL: `RESILIENCE_REDIS_URL` if set, else a
/// caller-supplied fallback, else `redis://127.0.0.1:6379`.
pub fn redis_url(fallback: Option<&str>) -> String {
    env::var("RESILIENCE_REDIS_URL").unwrap_or_else(|_| fallback.unwrap_or("redis://127.0.0.1:6379").to_string())
}

/// Resolves a Slack incoming-webhook URL from `RESILIENCE_SLACK_WEBHOOK_URL`,
/// if present.
pub fn slack_webhook_url() -> Option<String> {
    env::var("RESILIENCE_SLACK_WEBHOOK_URL").ok()
}

/// Resolves a PagerDuty routing key from `RESILIENCE_PAGERDUTY_ROUTING_KEY`,
/// if present.
pub fn pagerduty_routing_key() -> Option<String> {
    env::var("RESILIENCE_PAGERDUTY_ROUTING_KEY").ok()
}

/// Resolves SMTP credentials as `(host, username, password)` from
/// `RESILIENCE_SMTP_HOST` / `RESILIENCE_SMTP_USERNAME` /
/// `RESILIENCE_SMTP_PASSWORD`, if all three are present.
pub fn smtp_credentials() -> Option<(String, String, String)> {
    let host = env::var("RESILIENCE_SMTP_HOST").ok()?;
    let username = env::var("RESILIENCE_SMTP_USERNAME").ok()?;
    let password = env::var("RESILIENCE_SMTP_PASSWORD").ok()?;
    Some((host, username, password))
}

/// Resolves a JWT signing/verification secret from `RESILIENCE_JWT_SECRET`,
/// if present.
pub fn jwt_secret() -> Option<String> {
    env::var("RESILIENCE_JWT_SECRET").ok()
}
