//! Service Level Objective tracking: rolling-window compliance, error
//! budget, and burn-rate calculation for an agent-serving SLI.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::clock::SharedClock;

/// Kind of Service Level Indicator a [`SLO`] measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliType {
    Availability,
    Latency,
    ErrorRate,
    Throughput,
    Quality,
}

/// Whether an [`SLO`]'s current compliance is holding, at risk, or blown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceStatus {
    Compliant,
    AtRisk,
    Violated,
}

/// Named Service Level Indicator definition.
#[derive(Debug, Clone)]
pub struct Sli {
    pub name: String,
    pub kind: SliType,
    pub description: String,
    pub unit: String,
}

/// A Service Level Objective: a target value for an [`Sli`] over a rolling
/// window.
#[derive(Debug, Clone)]
pub struct Slo {
    pub name: String,
    pub sli: Sli,
    /// Target value, e.g. `99.9` for 99.9% availability.
    pub target: f64,
    pub window_seconds: f64,
    pub description: String,
    /// `true` when lower observed values are better (e.g. latency, error
    /// rate); `false` when higher is better (e.g. availability, quality).
    pub is_upper_bound: bool,
}

impl Slo {
    pub fn new(name: impl Into<String>, sli: Sli, target: f64, window_seconds: f64) -> Self {
        Self {
            name: name.into(),
            sli,
            target,
            window_seconds,
            description: String::new(),
            is_upper_bound: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_upper_bound(mut self, is_upper_bound: bool) -> Self {
        self.is_upper_bound = is_upper_bound;
        self
    }
}

/// Snapshot of an SLO's current standing.
#[derive(Debug, Clone)]
pub struct SloStatus {
    pub slo_name: String,
    pub current_value: f64,
    pub target: f64,
    pub error_budget_remaining: f64,
    pub compliance: ComplianceStatus,
    pub burn_rate: f64,
    pub time_remaining: f64,
    pub total_events: u64,
    pub good_events: u64,
}

#[derive(Debug, Clone, Copy)]
struct SloEvent {
    timestamp: f64,
    value: f64,
    is_good: bool,
}

struct TrackerState {
    events: VecDeque<SloEvent>,
    total_events: u64,
    good_events: u64,
}

/// Tracks a single [`Slo`]'s rolling-window performance.
///
/// Events older than `slo.window_seconds` are evicted from the front of the
/// deque on every read and write, the same cleanup-on-touch discipline the
/// rate limiter and circuit breaker use, rather than a background sweep.
pub struct SloTracker {
    slo: Slo,
    max_events: usize,
    state: Mutex<TrackerState>,
    clock: SharedClock,
    window_start: f64,
}

impl SloTracker {
    pub fn new(slo: Slo, max_events: usize, clock: SharedClock) -> Self {
        let window_start = clock.now();
        Self {
            slo,
            max_events,
            state: Mutex::new(TrackerState {
                events: VecDeque::new(),
                total_events: 0,
                good_events: 0,
            }),
            clock,
            window_start,
        }
    }

    pub fn slo(&self) -> &Slo {
        &self.slo
    }

    fn cleanup_locked(&self, state: &mut TrackerState, now: f64) {
        let cutoff = now - self.slo.window_seconds;
        while let Some(front) = state.events.front() {
            if front.timestamp >= cutoff {
                break;
            }
            let old = state.events.pop_front().unwrap();
            state.total_events -= 1;
            if old.is_good {
                state.good_events -= 1;
            }
        }
    }

    pub fn record_event(&self, is_good: bool, value: Option<f64>) {
        let now = self.clock.now();
        let event = SloEvent {
            timestamp: now,
            value: value.unwrap_or(if is_good { 1.0 } else { 0.0 }),
            is_good,
        };
        let mut state = self.state.lock();
        if state.events.len() >= self.max_events {
            let old = state.events.pop_front().unwrap();
            state.total_events -= 1;
            if old.is_good {
                state.good_events -= 1;
            }
        }
        state.events.push_back(event);
        state.total_events += 1;
        if is_good {
            state.good_events += 1;
        }
        self.cleanup_locked(&mut state, now);
    }

    pub fn record_latency(&self, latency_ms: f64, threshold_ms: Option<f64>) {
        let threshold = threshold_ms.unwrap_or(self.slo.target);
        self.record_event(latency_ms <= threshold, Some(latency_ms));
    }

    pub fn record_error(&self, is_error: bool) {
        self.record_event(!is_error, None);
    }

    pub fn current_value(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.cleanup_locked(&mut state, now);
        if state.total_events == 0 {
            return 100.0;
        }
        match self.slo.sli.kind {
            SliType::Availability => state.good_events as f64 / state.total_events as f64 * 100.0,
            SliType::ErrorRate => {
                let bad = state.total_events - state.good_events;
                bad as f64 / state.total_events as f64 * 100.0
            }
            _ => {
                let sum: f64 = state.events.iter().map(|e| e.value).sum();
                sum / state.events.len() as f64
            }
        }
    }

    pub fn error_budget_remaining(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.cleanup_locked(&mut state, now);
        if state.total_events == 0 {
            return 100.0;
        }

        let target = self.slo.target;
        match self.slo.sli.kind {
            SliType::Availability => {
                let allowed_bad = state.total_events as f64 * (100.0 - target) / 100.0;
                let actual_bad = (state.total_events - state.good_events) as f64;
                if allowed_bad <= 0.0 {
                    return if actual_bad == 0.0 { 100.0 } else { 0.0 };
                }
                ((allowed_bad - actual_bad) / allowed_bad * 100.0).clamp(0.0, 100.0)
            }
            _ => {
                drop(state);
                let current = self.current_value();
                if self.slo.is_upper_bound {
                    ((target - current) / target * 100.0 + 100.0).max(0.0)
                } else {
                    (current / target * 100.0).max(0.0)
                }
            }
        }
    }

    pub fn burn_rate(&self, short_window_minutes: f64) -> f64 {
        let now = self.clock.now();
        let state = self.state.lock();
        let short_window_start = now - short_window_minutes * 60.0;

        let mut short_total = 0u64;
        let mut short_good = 0u64;
        for event in state.events.iter() {
            if event.timestamp >= short_window_start {
                short_total += 1;
                if event.is_good {
                    short_good += 1;
                }
            }
        }
        if short_total == 0 {
            return 0.0;
        }

        let short_error_rate = (short_total - short_good) as f64 / short_total as f64;
        let sustainable_error_rate = (100.0 - self.slo.target) / 100.0;
        if sustainable_error_rate <= 0.0 {
            return if short_error_rate > 0.0 { f64::INFINITY } else { 0.0 };
        }
        short_error_rate / sustainable_error_rate
    }

    pub fn status(&self) -> SloStatus {
        let current_value = self.current_value();
        let error_budget = self.error_budget_remaining();
        let burn_rate = self.burn_rate(60.0);

        let compliance = if error_budget <= 0.0 {
            ComplianceStatus::Violated
        } else if error_budget <= 20.0 || burn_rate > 1.0 {
            ComplianceStatus::AtRisk
        } else {
            ComplianceStatus::Compliant
        };

        let now = self.clock.now();
        let elapsed = now - self.window_start;
        let time_remaining = (self.slo.window_seconds - elapsed).max(0.0);

        let state = self.state.lock();
        SloStatus {
            slo_name: self.slo.name.clone(),
            current_value: (current_value * 10_000.0).round() / 10_000.0,
            target: self.slo.target,
            error_budget_remaining: (error_budget * 100.0).round() / 100.0,
            compliance,
            burn_rate: (burn_rate * 100.0).round() / 100.0,
            time_remaining,
            total_events: state.total_events,
            good_events: state.good_events,
        }
    }
}

/// Compliance callbacks fired on a transition into a new status.
pub trait SloCallback: Send + Sync {
    fn on_violation(&self, status: &SloStatus);
    fn on_at_risk(&self, status: &SloStatus);
}

/// Manages a named set of [`SloTracker`]s and fires callbacks only on
/// status *transitions*, tracking the last-seen status per SLO so a steady
/// `VIOLATED` SLO doesn't re-page on every single event.
pub struct SloManager {
    trackers: HashMap<String, SloTracker>,
    last_status: Mutex<HashMap<String, ComplianceStatus>>,
    callback: Option<Box<dyn SloCallback>>,
}

impl SloManager {
    pub fn new(callback: Option<Box<dyn SloCallback>>) -> Self {
        Self {
            trackers: HashMap::new(),
            last_status: Mutex::new(HashMap::new()),
            callback,
        }
    }

    pub fn add_slo(&mut self, slo: Slo, max_events: usize, clock: SharedClock) {
        let name = slo.name.clone();
        self.trackers.insert(name.clone(), SloTracker::new(slo, max_events, clock));
        self.last_status.lock().insert(name, ComplianceStatus::Compliant);
    }

    /// Record a boolean good/bad event for a tracked SLO. Returns `false`
    /// (and logs) when the name isn't registered.
    pub fn record(&self, slo_name: &str, is_good: bool, value: Option<f64>) -> bool {
        let Some(tracker) = self.trackers.get(slo_name) else {
            tracing::warn!(slo = slo_name, "unknown SLO");
            return false;
        };
        tracker.record_event(is_good, value);
        self.check_status_change(slo_name);
        true
    }

    /// Record a numeric value, classifying good/bad from the SLO's target
    /// and `is_upper_bound` direction.
    pub fn record_value(&self, slo_name: &str, value: f64) -> bool {
        let Some(tracker) = self.trackers.get(slo_name) else {
            tracing::warn!(slo = slo_name, "unknown SLO");
            return false;
        };
        let is_good = if tracker.slo().is_upper_bound {
            value <= tracker.slo().target
        } else {
            value >= tracker.slo().target
        };
        tracker.record_event(is_good, Some(value));
        self.check_status_change(slo_name);
        true
    }

    fn check_status_change(&self, slo_name: &str) {
        let Some(tracker) = self.trackers.get(slo_name) else { return };
        let status = tracker.status();
        let mut last_status = self.last_status.lock();
        let previous = last_status.get(slo_name).copied().unwrap_or(ComplianceStatus::Compliant);
        if status.compliance == previous {
            return;
        }
        last_status.insert(slo_name.to_string(), status.compliance);
        drop(last_status);

        if let Some(callback) = &self.callback {
            match status.compliance {
                ComplianceStatus::Violated => callback.on_violation(&status),
                ComplianceStatus::AtRisk => callback.on_at_risk(&status),
                ComplianceStatus::Compliant => {}
            }
        }
    }

    pub fn status(&self, slo_name: &str) -> Option<SloStatus> {
        self.trackers.get(slo_name).map(|t| t.status())
    }

    pub fn all_statuses(&self) -> HashMap<String, SloStatus> {
        self.trackers.iter().map(|(name, tracker)| (name.clone(), tracker.status())).collect()
    }

    /// Aggregate counts of compliant/at-risk/violated SLOs, the data behind
    /// an operator-facing compliance dashboard.
    pub fn compliance_report(&self) -> ComplianceReport {
        let statuses = self.all_statuses();
        let mut compliant = 0;
        let mut at_risk = 0;
        let mut violated = 0;
        for status in statuses.values() {
            match status.compliance {
                ComplianceStatus::Compliant => compliant += 1,
                ComplianceStatus::AtRisk => at_risk += 1,
                ComplianceStatus::Violated => violated += 1,
            }
        }
        ComplianceReport {
            total_slos: statuses.len(),
            compliant,
            at_risk,
            violated,
            statuses,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComplianceReport {
    pub total_slos: usize,
    pub compliant: usize,
    pub at_risk: usize,
    pub violated: usize,
    pub statuses: HashMap<String, SloStatus>,
}

/// Preset SLO definitions for AI-agent-serving workloads, under a reusable
/// naming scheme rather than a one-off per deployment.
pub struct AgentServingSloPresets;

impl AgentServingSloPresets {
    pub fn availability_999() -> Slo {
        Slo::new(
            "agent_availability_999",
            Sli { name: "availability".into(), kind: SliType::Availability, description: String::new(), unit: "%".into() },
            99.9,
            2_592_000.0,
        )
        .with_description("99.9% of requests should succeed")
        .with_upper_bound(false)
    }

    pub fn latency_p99(threshold_ms: f64) -> Slo {
        Slo::new(
            "agent_latency_p99",
            Sli { name: "p99_latency".into(), kind: SliType::Latency, description: String::new(), unit: "ms".into() },
            threshold_ms,
            2_592_000.0,
        )
        .with_description(format!("99% of requests under {threshold_ms}ms"))
        .with_upper_bound(true)
    }

    pub fn error_rate(max_rate: f64) -> Slo {
        Slo::new(
            "agent_error_rate",
            Sli { name: "error_rate".into(), kind: SliType::ErrorRate, description: String::new(), unit: "%".into() },
            max_rate,
            2_592_000.0,
        )
        .with_description(format!("Error rate under {max_rate}%"))
        .with_upper_bound(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::sync::Arc;

    fn availability_tracker(clock: Arc<FixedClock>) -> SloTracker {
        SloTracker::new(AgentServingSloPresets::availability_999(), 10_000, clock)
    }

    #[test]
    fn test_no_events_assumes_compliant() {
        let clock = Arc::new(FixedClock::new(0.0));
        let tracker = availability_tracker(clock);
        assert_eq!(tracker.current_value(), 100.0);
        assert_eq!(tracker.error_budget_remaining(), 100.0);
    }

    #[test]
    fn test_availability_current_value() {
        let clock = Arc::new(FixedClock::new(0.0));
        let tracker = availability_tracker(clock);
        for _ in 0..99 {
            tracker.record_event(true, None);
        }
        tracker.record_event(false, None);
        assert_eq!(tracker.current_value(), 99.0);
    }

    #[test]
    fn test_error_budget_exhausted_marks_violated() {
        let clock = Arc::new(FixedClock::new(0.0));
        let tracker = availability_tracker(clock);
        for _ in 0..10 {
            tracker.record_event(false, None);
        }
        let status = tracker.status();
        assert_eq!(status.compliance, ComplianceStatus::Violated);
        assert_eq!(status.error_budget_remaining, 0.0);
    }

    #[test]
    fn test_events_outside_window_are_evicted() {
        let clock = Arc::new(FixedClock::new(0.0));
        let slo = Slo::new(
            "short",
            Sli { name: "availability".into(), kind: SliType::Availability, description: String::new(), unit: "%".into() },
            99.0,
            10.0,
        );
        let tracker = SloTracker::new(slo, 10_000, clock.clone());
        tracker.record_event(false, None);
        clock.advance(11.0);
        assert_eq!(tracker.current_value(), 100.0);
    }

    #[test]
    fn test_burn_rate_over_sustainable_rate() {
        let clock = Arc::new(FixedClock::new(0.0));
        let tracker = availability_tracker(clock);
        for _ in 0..10 {
            tracker.record_event(false, None);
        }
        assert!(tracker.burn_rate(60.0) > 1.0);
    }

    #[test]
    fn test_manager_records_and_classifies_by_target() {
        let clock = Arc::new(FixedClock::new(0.0));
        let mut manager = SloManager::new(None);
        manager.add_slo(AgentServingSloPresets::latency_p99(100.0), 10_000, clock);
        manager.record_value("agent_latency_p99", 50.0);
        manager.record_value("agent_latency_p99", 200.0);
        let status = manager.status("agent_latency_p99").unwrap();
        assert_eq!(status.total_events, 2);
        assert_eq!(status.good_events, 1);
    }

    #[test]
    fn test_manager_unknown_slo_returns_false() {
        let manager = SloManager::new(None);
        assert!(!manager.record("missing", true, None));
    }

    struct CountingCallback {
        violations: Mutex<u32>,
        at_risks: Mutex<u32>,
    }

    impl SloCallback for CountingCallback {
        fn on_violation(&self, _status: &SloStatus) {
            *self.violations.lock() += 1;
        }
        fn on_at_risk(&self, _status: &SloStatus) {
            *self.at_risks.lock() += 1;
        }
    }

    #[test]
    fn test_callback_fires_only_on_transition() {
        let clock = Arc::new(FixedClock::new(0.0));
        let callback = Arc::new(CountingCallback { violations: Mutex::new(0), at_risks: Mutex::new(0) });

        struct Forward(Arc<CountingCallback>);
        impl SloCallback for Forward {
            fn on_violation(&self, s: &SloStatus) {
                self.0.on_violation(s);
            }
            fn on_at_risk(&self, s: &SloStatus) {
                self.0.on_at_risk(s);
            }
        }

        let mut manager = SloManager::new(Some(Box::new(Forward(callback.clone()))));
        manager.add_slo(AgentServingSloPresets::availability_999(), 10_000, clock);
        for _ in 0..10 {
            manager.record("agent_availability_999", false, None);
        }
        assert_eq!(*callback.violations.lock(), 1);
    }

    #[test]
    fn test_compliance_report_counts_by_status() {
        let clock = Arc::new(FixedClock::new(0.0));
        let mut manager = SloManager::new(None);
        manager.add_slo(AgentServingSloPresets::availability_999(), 10_000, clock);
        let report = manager.compliance_report();
        assert_eq!(report.total_slos, 1);
        assert_eq!(report.compliant, 1);
    }
}
