//! Token-usage and cost accounting: per-model pricing, daily/monthly
//! summaries, and budget-threshold alerts for AI model calls.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use parking_lot::Mutex;

use crate::clock::SharedClock;

/// Category a token falls into for pricing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Input,
    Output,
    Cached,
    Total,
}

/// Per-1K-token pricing for one model.
#[derive(Debug, Clone)]
pub struct ModelPricing {
    pub model_name: String,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub cached_input_price_per_1k: f64,
    pub currency: String,
}

impl ModelPricing {
    pub fn new(model_name: impl Into<String>, input_price_per_1k: f64, output_price_per_1k: f64) -> Self {
        Self {
            model_name: model_name.into(),
            input_price_per_1k,
            output_price_per_1k,
            cached_input_price_per_1k: 0.0,
            currency: "USD".into(),
        }
    }
}

/// One recorded unit of model usage.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub timestamp: f64,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost: f64,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cost: f64,
    pub requests: u64,
}

#[derive(Debug, Clone, Default)]
pub struct UserUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub requests: u64,
}

/// Aggregated usage over a period.
#[derive(Debug, Clone)]
pub struct UsageSummary {
    pub period_start: f64,
    pub period_end: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cached_tokens: u64,
    pub total_cost: f64,
    pub request_count: u64,
    pub by_model: HashMap<String, ModelUsage>,
    pub by_user: HashMap<String, UserUsage>,
}

/// Spend caps and alert fractions.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub daily_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
    pub per_user_daily_limit: Option<f64>,
    pub alert_thresholds: Vec<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: None,
            monthly_limit: None,
            per_user_daily_limit: None,
            alert_thresholds: vec![0.5, 0.8, 0.95],
        }
    }
}

/// Receives `(budget_type, current_spend, limit)` when a configured
/// threshold fraction of a budget is crossed.
pub trait BudgetAlertSink: Send + Sync {
    fn on_threshold_crossed(&self, budget_type: &str, current: f64, limit: f64);
}

struct State {
    records: Vec<UsageRecord>,
    daily_costs: HashMap<String, f64>,
    user_daily_costs: HashMap<String, HashMap<String, f64>>,
    /// Highest alert threshold already fired, keyed per budget type — the
    /// original tracked one global `_last_alert_threshold`, which meant a
    /// crossed daily-budget threshold silently suppressed the very next
    /// per-user threshold crossing. Each budget type gets its own high
    /// water mark here instead.
    last_alert_threshold: HashMap<String, f64>,
}

/// Tracks token usage and cost across models, users, and budget periods.
pub struct CostTracker {
    budget_config: BudgetConfig,
    alert_sink: Option<Arc<dyn BudgetAlertSink>>,
    max_records: usize,
    pricing: Mutex<HashMap<String, ModelPricing>>,
    state: Mutex<State>,
    clock: SharedClock,
}

impl CostTracker {
    pub fn new(budget_config: BudgetConfig, alert_sink: Option<Arc<dyn BudgetAlertSink>>, max_records: usize, clock: SharedClock) -> Self {
        Self {
            budget_config,
            alert_sink,
            max_records,
            pricing: Mutex::new(default_pricing()),
            state: Mutex::new(State {
                records: Vec::new(),
                daily_costs: HashMap::new(),
                user_daily_costs: HashMap::new(),
                last_alert_threshold: HashMap::new(),
            }),
            clock,
        }
    }

    pub fn add_model_pricing(&self, pricing: ModelPricing) {
        self.pricing.lock().insert(pricing.model_name.clone(), pricing);
    }

    fn calculate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64, cached_tokens: u64) -> f64 {
        let pricing = self.pricing.lock();
        let Some(p) = pricing.get(model) else {
            tracing::warn!(model, "no pricing for model, using estimate");
            return (input_tokens + output_tokens) as f64 * 0.00001;
        };
        let input_cost = input_tokens as f64 / 1000.0 * p.input_price_per_1k;
        let output_cost = output_tokens as f64 / 1000.0 * p.output_price_per_1k;
        let cached_cost = cached_tokens as f64 / 1000.0 * p.cached_input_price_per_1k;
        input_cost + output_cost + cached_cost
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let secs = self.clock.now();
        Utc.timestamp_opt(secs as i64, 0).single().unwrap_or_else(Utc::now)
    }

    pub fn record_usage(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
        session_id: Option<String>,
        user_id: Option<String>,
    ) -> UsageRecord {
        let cost = self.calculate_cost(model, input_tokens, output_tokens, cached_tokens);
        let timestamp = self.clock.now();
        let record = UsageRecord {
            timestamp,
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cached_tokens,
            cost,
            session_id,
            user_id: user_id.clone(),
        };

        let date_key = self.now_utc().format("%Y-%m-%d").to_string();
        {
            let mut state = self.state.lock();
            state.records.push(record.clone());
            if state.records.len() > self.max_records {
                let overflow = state.records.len() - self.max_records;
                state.records.drain(0..overflow);
            }
            *state.daily_costs.entry(date_key.clone()).or_insert(0.0) += cost;
            if let Some(uid) = &user_id {
                *state.user_daily_costs.entry(uid.clone()).or_default().entry(date_key.clone()).or_insert(0.0) += cost;
            }
        }

        self.check_budgets(user_id.as_deref(), &date_key);
        record
    }

    fn check_budgets(&self, user_id: Option<&str>, date_key: &str) {
        if let Some(limit) = self.budget_config.daily_limit {
            let daily_cost = *self.state.lock().daily_costs.get(date_key).unwrap_or(&0.0);
            self.check_threshold("daily", daily_cost, limit);
        }
        if let (Some(uid), Some(limit)) = (user_id, self.budget_config.per_user_daily_limit) {
            let user_cost = self
                .state
                .lock()
                .user_daily_costs
                .get(uid)
                .and_then(|m| m.get(date_key))
                .copied()
                .unwrap_or(0.0);
            self.check_threshold(&format!("user_{uid}_daily"), user_cost, limit);
        }
    }

    fn check_threshold(&self, budget_type: &str, current: f64, limit: f64) {
        let Some(sink) = &self.alert_sink else { return };
        let ratio = if limit > 0.0 { current / limit } else { 0.0 };

        let mut state = self.state.lock();
        let last = state.last_alert_threshold.get(budget_type).copied().unwrap_or(0.0);
        for &threshold in &self.budget_config.alert_thresholds {
            if ratio >= threshold && threshold > last {
                state.last_alert_threshold.insert(budget_type.to_string(), threshold);
                drop(state);
                sink.on_threshold_crossed(budget_type, current, limit);
                return;
            }
        }
    }

    pub fn daily_summary(&self, date: Option<&str>) -> UsageSummary {
        let date = date.map(String::from).unwrap_or_else(|| self.now_utc().format("%Y-%m-%d").to_string());
        let records: Vec<UsageRecord> = self
            .state
            .lock()
            .records
            .iter()
            .filter(|r| {
                Utc.timestamp_opt(r.timestamp as i64, 0)
                    .single()
                    .map(|dt| dt.format("%Y-%m-%d").to_string() == date)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        self.create_summary(&records, &date)
    }

    pub fn monthly_summary(&self, year_month: Option<&str>) -> UsageSummary {
        let year_month = year_month.map(String::from).unwrap_or_else(|| self.now_utc().format("%Y-%m").to_string());
        let records: Vec<UsageRecord> = self
            .state
            .lock()
            .records
            .iter()
            .filter(|r| {
                Utc.timestamp_opt(r.timestamp as i64, 0)
                    .single()
                    .map(|dt| dt.format("%Y-%m").to_string() == year_month)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        self.create_summary(&records, &year_month)
    }

    fn create_summary(&self, records: &[UsageRecord], period: &str) -> UsageSummary {
        let mut by_model: HashMap<String, ModelUsage> = HashMap::new();
        let mut by_user: HashMap<String, UserUsage> = HashMap::new();
        let mut total_input = 0u64;
        let mut total_output = 0u64;
        let mut total_cached = 0u64;
        let mut total_cost = 0.0;

        for record in records {
            total_input += record.input_tokens;
            total_output += record.output_tokens;
            total_cached += record.cached_tokens;
            total_cost += record.cost;

            let model_entry = by_model.entry(record.model.clone()).or_default();
            model_entry.input_tokens += record.input_tokens;
            model_entry.output_tokens += record.output_tokens;
            model_entry.cached_tokens += record.cached_tokens;
            model_entry.cost += record.cost;
            model_entry.requests += 1;

            if let Some(uid) = &record.user_id {
                let user_entry = by_user.entry(uid.clone()).or_default();
                user_entry.input_tokens += record.input_tokens;
                user_entry.output_tokens += record.output_tokens;
                user_entry.cost += record.cost;
                user_entry.requests += 1;
            }
        }

        // Real calendar arithmetic rather than a naive "+32 days"
        // approximation: a day period runs midnight to midnight, a month
        // period runs to the first instant of the following calendar
        // month regardless of how many days that month has.
        let (start, end) = if period.len() == 10 {
            let date = chrono::NaiveDate::parse_from_str(period, "%Y-%m-%d").unwrap_or_else(|_| self.now_utc().date_naive());
            let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
            (start, start + Duration::days(1))
        } else {
            let year: i32 = period[0..4].parse().unwrap_or(self.now_utc().year());
            let month: u32 = period[5..7].parse().unwrap_or(self.now_utc().month());
            let date = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap();
            let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
            let next_month = if month == 12 {
                chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1)
            } else {
                chrono::NaiveDate::from_ymd_opt(year, month + 1, 1)
            }
            .unwrap();
            let end = Utc.from_utc_datetime(&next_month.and_hms_opt(0, 0, 0).unwrap());
            (start, end)
        };

        UsageSummary {
            period_start: start.timestamp() as f64,
            period_end: end.timestamp() as f64,
            total_input_tokens: total_input,
            total_output_tokens: total_output,
            total_cached_tokens: total_cached,
            total_cost: (total_cost * 1_000_000.0).round() / 1_000_000.0,
            request_count: records.len() as u64,
            by_model,
            by_user,
        }
    }

    pub fn user_usage(&self, user_id: &str, days: u32) -> UserUsageReport {
        let cutoff = self.clock.now() - days as f64 * 86_400.0;
        let records: Vec<UsageRecord> = self
            .state
            .lock()
            .records
            .iter()
            .filter(|r| r.user_id.as_deref() == Some(user_id) && r.timestamp >= cutoff)
            .cloned()
            .collect();

        let total_cost: f64 = records.iter().map(|r| r.cost).sum();
        let total_input: u64 = records.iter().map(|r| r.input_tokens).sum();
        let total_output: u64 = records.iter().map(|r| r.output_tokens).sum();
        let request_count = records.len() as u64;

        UserUsageReport {
            user_id: user_id.to_string(),
            days,
            total_cost: (total_cost * 1_000_000.0).round() / 1_000_000.0,
            total_input_tokens: total_input,
            total_output_tokens: total_output,
            request_count,
            average_cost_per_request: if request_count > 0 { total_cost / request_count as f64 } else { 0.0 },
        }
    }

    pub fn remaining_budget(&self) -> RemainingBudget {
        let now = self.now_utc();
        let date_key = now.format("%Y-%m-%d").to_string();
        let month_key = now.format("%Y-%m").to_string();

        let state = self.state.lock();
        let daily_spent = state.daily_costs.get(&date_key).copied().unwrap_or(0.0);
        let monthly_spent: f64 = state
            .daily_costs
            .iter()
            .filter(|(date, _)| date.starts_with(&month_key))
            .map(|(_, cost)| cost)
            .sum();

        RemainingBudget {
            daily_remaining: self.budget_config.daily_limit.map(|limit| limit - daily_spent),
            monthly_remaining: self.budget_config.monthly_limit.map(|limit| limit - monthly_spent),
            daily_spent,
            monthly_spent,
        }
    }

    pub fn export_records(&self, start_time: Option<f64>, end_time: Option<f64>) -> Vec<UsageRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| start_time.is_none_or(|s| r.timestamp >= s))
            .filter(|r| end_time.is_none_or(|e| r.timestamp <= e))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct UserUsageReport {
    pub user_id: String,
    pub days: u32,
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub request_count: u64,
    pub average_cost_per_request: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct RemainingBudget {
    pub daily_remaining: Option<f64>,
    pub monthly_remaining: Option<f64>,
    pub daily_spent: f64,
    pub monthly_spent: f64,
}

fn default_pricing() -> HashMap<String, ModelPricing> {
    let mut table = HashMap::new();
    for pricing in [
        ModelPricing::new("gemini-1.5-pro", 0.00125, 0.005),
        ModelPricing::new("gemini-1.5-flash", 0.000075, 0.0003),
        ModelPricing::new("gemini-2.0-flash", 0.0001, 0.0004),
        ModelPricing::new("gpt-4-turbo", 0.01, 0.03),
        ModelPricing::new("gpt-4o", 0.005, 0.015),
        ModelPricing::new("claude-3-opus", 0.015, 0.075),
        ModelPricing::new("claude-3-sonnet", 0.003, 0.015),
    ] {
        table.insert(pricing.model_name.clone(), pricing);
    }
    table
}
