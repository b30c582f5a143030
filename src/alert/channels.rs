//! Concrete [`super::AlertChannel`] implementations: chat, paging, email,
//! generic webhook, and a pluggable metrics sink.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;

use super::{Alert, AlertResult, AlertSeverity, AlertStatus};

/// Where a single [`super::Alert`] gets delivered.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &Alert) -> AlertResult;
}

fn severity_color(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => "#36a64f",
        AlertSeverity::Warning => "#ffcc00",
        AlertSeverity::Error => "#ff6600",
        AlertSeverity::Critical => "#ff0000",
    }
}

fn severity_emoji(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => ":information_source:",
        AlertSeverity::Warning => ":warning:",
        AlertSeverity::Error => ":x:",
        AlertSeverity::Critical => ":rotating_light:",
    }
}

fn severity_str(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Info => "info",
        AlertSeverity::Warning => "warning",
        AlertSeverity::Error => "error",
        AlertSeverity::Critical => "critical",
    }
}

/// Slack incoming-webhook channel.
pub struct SlackChannel {
    webhook_url: String,
    channel: Option<String>,
    username: String,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            channel: None,
            username: "Agent Alerts".into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

#[async_trait]
impl AlertChannel for SlackChannel {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> AlertResult {
        let mut fields = vec![
            json!({"title": "Severity", "value": severity_str(alert.severity), "short": true}),
            json!({"title": "Source", "value": alert.source, "short": true}),
            json!({"title": "Status", "value": matches!(alert.status, AlertStatus::Firing).then_some("firing").unwrap_or("resolved"), "short": true}),
        ];
        for (key, value) in &alert.labels {
            fields.push(json!({"title": key, "value": value, "short": true}));
        }

        let attachment = json!({
            "color": severity_color(alert.severity),
            "title": format!("{} {}", severity_emoji(alert.severity), alert.summary),
            "text": alert.description,
            "fields": fields,
            "footer": format!("Fingerprint: {}", alert.fingerprint),
            "ts": alert.timestamp as i64,
        });

        let mut payload = json!({
            "username": self.username,
            "attachments": [attachment],
        });
        if let Some(channel) = &self.channel {
            payload["channel"] = json!(channel);
        }

        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => AlertResult { success: true, channel: self.name().into(), error: None },
            Ok(response) => AlertResult {
                success: false,
                channel: self.name().into(),
                error: Some(format!("Slack API error: {}", response.status())),
            },
            Err(err) => AlertResult { success: false, channel: self.name().into(), error: Some(err.to_string()) },
        }
    }
}

/// PagerDuty Events API v2 channel.
pub struct PagerDutyChannel {
    routing_key: String,
    source: String,
    client: reqwest::Client,
}

impl PagerDutyChannel {
    const API_URL: &'static str = "https://events.pagerduty.com/v2/enqueue";

    pub fn new(routing_key: impl Into<String>) -> Self {
        Self { routing_key: routing_key.into(), source: "agent".into(), client: reqwest::Client::new() }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

#[async_trait]
impl AlertChannel for PagerDutyChannel {
    fn name(&self) -> &str {
        "pagerduty"
    }

    async fn send(&self, alert: &Alert) -> AlertResult {
        let event_action = match alert.status {
            AlertStatus::Firing => "trigger",
            AlertStatus::Resolved => "resolve",
        };

        let mut custom_details = json!({"description": alert.description});
        for (key, value) in alert.labels.iter().chain(alert.annotations.iter()) {
            custom_details[key] = json!(value);
        }

        let payload = json!({
            "routing_key": self.routing_key,
            "event_action": event_action,
            "dedup_key": alert.fingerprint,
            "payload": {
                "summary": alert.summary,
                "severity": severity_str(alert.severity),
                "source": if alert.source.is_empty() { &self.source } else { &alert.source },
                "custom_details": custom_details,
            },
        });

        match self.client.post(Self::API_URL).json(&payload).send().await {
            Ok(response) if response.status().as_u16() == 202 => {
                AlertResult { success: true, channel: self.name().into(), error: None }
            }
            Ok(response) => AlertResult {
                success: false,
                channel: self.name().into(),
                error: Some(format!("PagerDuty API error: {}", response.status())),
            },
            Err(err) => AlertResult { success: false, channel: self.name().into(), error: Some(err.to_string()) },
        }
    }
}

/// SMTP email channel. Sending goes through `lettre`'s Tokio transport so
/// the SMTP round trip never blocks the async runtime's hot path.
pub struct EmailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_addr: Mailbox,
    to_addrs: Vec<Mailbox>,
}

impl EmailChannel {
    pub fn new(
        smtp_host: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        from_addr: Mailbox,
        to_addrs: Vec<Mailbox>,
    ) -> Result<Self, lettre::transport::smtp::Error> {
        let creds = Credentials::new(username.into(), password.into());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)?.credentials(creds).build();
        Ok(Self { transport, from_addr, to_addrs })
    }
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> AlertResult {
        let subject = format!("[{}] {}", severity_str(alert.severity).to_uppercase(), alert.summary);
        let text_body = format!(
            "Alert: {}\nSeverity: {}\nSource: {}\n\nSummary: {}\n\nDescription:\n{}\n\nFingerprint: {}\n",
            alert.name,
            severity_str(alert.severity),
            alert.source,
            alert.summary,
            alert.description,
            alert.fingerprint,
        );
        let html_body = format!(
            "<html><body><h2>{}</h2><p>{}</p><small>Fingerprint: {}</small></body></html>",
            alert.summary, alert.description, alert.fingerprint,
        );

        let mut builder = Message::builder().from(self.from_addr.clone()).subject(subject);
        for to in &self.to_addrs {
            builder = builder.to(to.clone());
        }

        let message = match builder.multipart(MultiPart::alternative().singlepart(SinglePart::plain(text_body)).singlepart(SinglePart::html(html_body))) {
            Ok(message) => message,
            Err(err) => return AlertResult { success: false, channel: self.name().into(), error: Some(err.to_string()) },
        };

        match self.transport.send(message).await {
            Ok(_) => AlertResult { success: true, channel: self.name().into(), error: None },
            Err(err) => AlertResult { success: false, channel: self.name().into(), error: Some(err.to_string()) },
        }
    }
}

/// Generic outbound webhook channel.
pub struct WebhookChannel {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), headers: Vec::new(), client: reqwest::Client::new() }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> AlertResult {
        let payload = json!({
            "name": alert.name,
            "severity": severity_str(alert.severity),
            "status": matches!(alert.status, AlertStatus::Firing).then_some("firing").unwrap_or("resolved"),
            "summary": alert.summary,
            "description": alert.description,
            "source": alert.source,
            "labels": alert.labels,
            "annotations": alert.annotations,
            "fingerprint": alert.fingerprint,
            "timestamp": alert.timestamp,
        });

        let mut request = self.client.post(&self.url).json(&payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                AlertResult {
                    success: status.is_success(),
                    channel: self.name().into(),
                    error: if status.is_success() { None } else { Some(format!("HTTP {status}")) },
                }
            }
            Err(err) => AlertResult { success: false, channel: self.name().into(), error: Some(err.to_string()) },
        }
    }
}

/// Sink for an external metrics/monitoring system: any pluggable metrics
/// backend, not tied to one specific cloud provider.
pub trait MetricsSink: Send + Sync {
    fn record_alert(&self, alert: &Alert) -> Result<(), String>;
}

pub struct MetricsChannel {
    sink: Box<dyn MetricsSink>,
}

impl MetricsChannel {
    pub fn new(sink: Box<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl AlertChannel for MetricsChannel {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn send(&self, alert: &Alert) -> AlertResult {
        match self.sink.record_alert(alert) {
            Ok(()) => AlertResult { success: true, channel: self.name().into(), error: None },
            Err(error) => AlertResult { success: false, channel: self.name().into(), error: Some(error) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct RecordingSink(Arc<AtomicBool>);
    impl MetricsSink for RecordingSink {
        fn record_alert(&self, _alert: &Alert) -> Result<(), String> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_metrics_channel_delegates_to_sink() {
        let recorded = Arc::new(AtomicBool::new(false));
        let channel = MetricsChannel::new(Box::new(RecordingSink(recorded.clone())));
        let alert = Alert::new("x", AlertSeverity::Info, "s", 0.0);
        let result = channel.send(&alert).await;
        assert!(result.success);
        assert!(recorded.load(Ordering::SeqCst));
    }

    #[test]
    fn test_severity_color_and_emoji_cover_every_variant() {
        for severity in [AlertSeverity::Info, AlertSeverity::Warning, AlertSeverity::Error, AlertSeverity::Critical] {
            assert!(!severity_color(severity).is_empty());
            assert!(!severity_emoji(severity).is_empty());
        }
    }
}
