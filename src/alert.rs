//! Multi-channel alerting: severity-routed, deduplicated, rate-limited
//! fan-out of [`Alert`]s to pluggable [`channels::AlertChannel`]s.

pub mod channels;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub use channels::{AlertChannel, EmailChannel, MetricsChannel, PagerDutyChannel, SlackChannel, WebhookChannel};

use crate::clock::SharedClock;

/// How urgently an alert needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Whether an alert is actively firing or has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// One alert event, fanned out to whichever channels its routing rules
/// select.
#[derive(Debug, Clone)]
pub struct Alert {
    pub name: String,
    pub severity: AlertSeverity,
    pub summary: String,
    pub description: String,
    pub source: String,
    pub status: AlertStatus,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub timestamp: f64,
    pub fingerprint: String,
}

impl Alert {
    pub fn new(name: impl Into<String>, severity: AlertSeverity, summary: impl Into<String>, timestamp: f64) -> Self {
        let name = name.into();
        let mut alert = Self {
            name,
            severity,
            summary: summary.into(),
            description: String::new(),
            source: "agent".into(),
            status: AlertStatus::Firing,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            timestamp,
            fingerprint: String::new(),
        };
        alert.fingerprint = alert.compute_fingerprint();
        alert
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self.fingerprint = self.compute_fingerprint();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self.fingerprint = self.compute_fingerprint();
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Stable identity used for deduplication: name, source, and sorted
    /// labels, hashed with SHA-256 (no external system here depends on a
    /// specific hash, so there's no reason to reach for a broken one).
    fn compute_fingerprint(&self) -> String {
        let mut labels: Vec<(&String, &String)> = self.labels.iter().collect();
        labels.sort_by(|a, b| a.0.cmp(b.0));
        let content = format!("{}:{}:{:?}", self.name, self.source, labels);
        let digest = Sha256::digest(content.as_bytes());
        format!("{digest:x}")[..12].to_string()
    }
}

/// Outcome of delivering an [`Alert`] to one channel.
#[derive(Debug, Clone)]
pub struct AlertResult {
    pub success: bool,
    pub channel: String,
    pub error: Option<String>,
}

/// Filter selecting which alerts route to which channels.
#[derive(Debug, Clone, Default)]
pub struct AlertRoute {
    pub channels: Vec<String>,
    pub severities: Option<Vec<AlertSeverity>>,
    pub sources: Option<Vec<String>>,
    pub labels: Option<HashMap<String, String>>,
}

struct State {
    seen_fingerprints: HashMap<String, f64>,
    sent_count: u32,
    sent_window_start: f64,
}

/// Routes, deduplicates, rate-limits, and dispatches alerts across
/// registered channels.
pub struct AlertManager {
    dedup_window_seconds: f64,
    rate_limit_per_minute: u32,
    channels: HashMap<String, Arc<dyn AlertChannel>>,
    routes: Vec<AlertRoute>,
    state: Mutex<State>,
    clock: SharedClock,
}

impl AlertManager {
    pub fn new(dedup_window_seconds: f64, rate_limit_per_minute: u32, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            dedup_window_seconds,
            rate_limit_per_minute,
            channels: HashMap::new(),
            routes: Vec::new(),
            state: Mutex::new(State {
                seen_fingerprints: HashMap::new(),
                sent_count: 0,
                sent_window_start: now,
            }),
            clock,
        }
    }

    pub fn add_channel(&mut self, channel: Arc<dyn AlertChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn add_route(&mut self, route: AlertRoute) {
        self.routes.push(route);
    }

    fn should_dedupe(&self, alert: &Alert) -> bool {
        let now = self.clock.now();
        let cutoff = now - self.dedup_window_seconds;
        let mut state = self.state.lock();
        state.seen_fingerprints.retain(|_, ts| *ts > cutoff);

        if state.seen_fingerprints.contains_key(&alert.fingerprint) {
            return true;
        }
        state.seen_fingerprints.insert(alert.fingerprint.clone(), now);
        false
    }

    fn check_rate_limit(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if now - state.sent_window_start > 60.0 {
            state.sent_count = 0;
            state.sent_window_start = now;
        }
        if state.sent_count >= self.rate_limit_per_minute {
            return false;
        }
        state.sent_count += 1;
        true
    }

    fn channels_for_alert(&self, alert: &Alert) -> HashSet<String> {
        let mut channels = HashSet::new();
        for route in &self.routes {
            if let Some(severities) = &route.severities {
                if !severities.contains(&alert.severity) {
                    continue;
                }
            }
            if let Some(sources) = &route.sources {
                if !sources.contains(&alert.source) {
                    continue;
                }
            }
            if let Some(labels) = &route.labels {
                if !labels.iter().all(|(k, v)| alert.labels.get(k) == Some(v)) {
                    continue;
                }
            }
            channels.extend(route.channels.iter().cloned());
        }
        if channels.is_empty() && self.routes.is_empty() {
            channels.extend(self.channels.keys().cloned());
        }
        channels
    }

    pub async fn send_alert(&self, alert: &Alert, skip_dedupe: bool, skip_rate_limit: bool) -> HashMap<String, AlertResult> {
        let mut results = HashMap::new();

        if !skip_dedupe && self.should_dedupe(alert) {
            tracing::debug!(fingerprint = %alert.fingerprint, "alert deduplicated");
            return results;
        }
        if !skip_rate_limit && !self.check_rate_limit() {
            tracing::warn!("alert rate limit exceeded");
            return results;
        }

        for channel_name in self.channels_for_alert(alert) {
            let Some(channel) = self.channels.get(&channel_name) else {
                tracing::warn!(channel = channel_name, "unknown alert channel");
                continue;
            };
            let result = channel.send(alert).await;
            if !result.success {
                tracing::error!(channel = channel_name, error = ?result.error, "alert send failed");
            }
            results.insert(channel_name, result);
        }

        results
    }

    pub async fn resolve_alert(&self, mut alert: Alert) -> HashMap<String, AlertResult> {
        alert.status = AlertStatus::Resolved;
        self.send_alert(&alert, true, false).await
    }
}
