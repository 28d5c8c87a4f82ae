//! Cost accounting over recorded telemetry.
//!
//! Generation events carry token usage; this module prices them with
//! per-model USD rates (per million tokens) and aggregates spend by model,
//! provider and use case. Models without a configured rate are priced at a
//! deliberately high default so unknown models over-count rather than
//! slip under a budget.
//!
//! Budgets are advisory. [`CostTracker::budget_status`] reports spend
//! against the configured daily and monthly caps; it never blocks a call.
//! Budgets persist as one JSON document in the [`ConfigStore`] so every
//! instance sees the same numbers.
//!
//! # Example
//!
//! ```ignore
//! use trendscope_ai::cost_tracker::CostTracker;
//!
//! let tracker = CostTracker::new(sink, config);
//! let summary = tracker.summary(7).await?;
//! println!("last 7 days: {} over {} calls", format_cost(summary.total_cost_usd), summary.call_count);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::error::{AiError, Result};
use crate::telemetry::{EventKind, EventSink, TelemetryEvent};

/// Config key holding the [`CostBudgets`] document.
const BUDGET_KEY: &str = "ai_budget";

// ============================================================================
// Pricing
// ============================================================================

/// USD rates for one model, per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
}

impl ModelPricing {
    pub fn new(input_cost_per_million: f64, output_cost_per_million: f64) -> Self {
        Self {
            input_cost_per_million,
            output_cost_per_million,
        }
    }

    /// Price a single call.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_million;
        let output = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_million;
        input + output
    }
}

impl Default for ModelPricing {
    /// Rate applied to models missing from the table. Sits above every
    /// configured model so unpriced usage is overstated, never understated.
    fn default() -> Self {
        Self::new(5.0, 20.0)
    }
}

/// Published rates for the models the dashboard routes to. Keys are
/// prefixes: `claude-3-5-sonnet` matches `claude-3-5-sonnet-20241022`.
fn default_pricing() -> HashMap<String, ModelPricing> {
    let mut pricing = HashMap::new();

    pricing.insert("claude-3-5-sonnet".to_string(), ModelPricing::new(3.0, 15.0));
    pricing.insert("claude-3-5-haiku".to_string(), ModelPricing::new(0.8, 4.0));

    pricing.insert("gpt-4o-mini".to_string(), ModelPricing::new(0.15, 0.6));
    pricing.insert("gpt-4o".to_string(), ModelPricing::new(2.5, 10.0));

    pricing.insert("gemini-2.0-flash".to_string(), ModelPricing::new(0.075, 0.3));
    pricing.insert("gemini-1.5-pro".to_string(), ModelPricing::new(1.25, 5.0));

    pricing
}

// ============================================================================
// Summaries and budgets
// ============================================================================

/// Aggregated spend over a lookback window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost_usd: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub call_count: usize,
    pub avg_cost_per_call: f64,
    pub by_model: HashMap<String, f64>,
    pub by_provider: HashMap<String, f64>,
    pub by_use_case: HashMap<String, f64>,
}

/// Advisory spend caps, stored as one config document.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostBudgets {
    pub daily_usd: Option<f64>,
    pub monthly_usd: Option<f64>,
}

/// Current spend measured against the configured budgets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// Spend since midnight UTC.
    pub daily_spend_usd: f64,
    /// Spend since the first of the current month, UTC.
    pub monthly_spend_usd: f64,
    pub daily_budget_usd: Option<f64>,
    pub monthly_budget_usd: Option<f64>,
}

impl BudgetStatus {
    pub fn over_daily(&self) -> bool {
        self.daily_budget_usd
            .map(|budget| self.daily_spend_usd >= budget)
            .unwrap_or(false)
    }

    pub fn over_monthly(&self) -> bool {
        self.monthly_budget_usd
            .map(|budget| self.monthly_spend_usd >= budget)
            .unwrap_or(false)
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Prices recorded generation events and tracks advisory budgets.
pub struct CostTracker {
    sink: Arc<dyn EventSink>,
    config: Arc<dyn ConfigStore>,
    pricing: HashMap<String, ModelPricing>,
}

impl CostTracker {
    /// Tracker over the shared event sink and config store, seeded with the
    /// default pricing table.
    pub fn new(sink: Arc<dyn EventSink>, config: Arc<dyn ConfigStore>) -> Self {
        Self {
            sink,
            config,
            pricing: default_pricing(),
        }
    }

    /// Add or replace the rate for a model prefix.
    pub fn with_pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.into(), pricing);
        self
    }

    /// Rate for a model: exact match, then the longest configured prefix,
    /// then the conservative default.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        if let Some(pricing) = self.pricing.get(model) {
            return *pricing;
        }
        self.pricing
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, pricing)| *pricing)
            .unwrap_or_default()
    }

    /// USD cost of one call against the configured rates.
    pub fn estimate(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        self.pricing_for(model)
            .calculate_cost(u64::from(input_tokens), u64::from(output_tokens))
    }

    /// Spend over the last `days` days, bucketed by model, provider and
    /// use case. Only `generation` events are priced.
    pub async fn summary(&self, days: u32) -> Result<CostSummary> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let events = self.sink.since(cutoff).await?;
        Ok(self.summarize(&events))
    }

    fn summarize(&self, events: &[TelemetryEvent]) -> CostSummary {
        let mut summary = CostSummary::default();

        for event in events {
            if event.kind != EventKind::Generation {
                continue;
            }
            let cost = self.event_cost(event);
            summary.total_cost_usd += cost;
            summary.total_input_tokens += u64::from(event.input_tokens.unwrap_or(0));
            summary.total_output_tokens += u64::from(event.output_tokens.unwrap_or(0));
            summary.call_count += 1;

            let model = event.model.as_deref().unwrap_or("unknown");
            let provider = event.provider.as_deref().unwrap_or("unknown");
            let use_case = event.use_case.as_deref().unwrap_or("unknown");
            *summary.by_model.entry(model.to_string()).or_default() += cost;
            *summary.by_provider.entry(provider.to_string()).or_default() += cost;
            *summary.by_use_case.entry(use_case.to_string()).or_default() += cost;
        }

        if summary.call_count > 0 {
            summary.avg_cost_per_call = summary.total_cost_usd / summary.call_count as f64;
        }
        summary
    }

    fn event_cost(&self, event: &TelemetryEvent) -> f64 {
        let pricing = event
            .model
            .as_deref()
            .map(|model| self.pricing_for(model))
            .unwrap_or_default();
        pricing.calculate_cost(
            u64::from(event.input_tokens.unwrap_or(0)),
            u64::from(event.output_tokens.unwrap_or(0)),
        )
    }

    /// Persist the advisory budgets. `None` clears a cap; negative values
    /// are rejected.
    pub async fn set_budgets(&self, daily_usd: Option<f64>, monthly_usd: Option<f64>) -> Result<()> {
        for budget in [daily_usd, monthly_usd].into_iter().flatten() {
            if budget < 0.0 {
                return Err(AiError::InvalidInput(format!(
                    "budget must be non-negative, got {budget}"
                )));
            }
        }
        let budgets = CostBudgets {
            daily_usd,
            monthly_usd,
        };
        self.config
            .set(BUDGET_KEY, serde_json::to_value(budgets)?)
            .await
    }

    /// The configured budgets, or the empty default when none were set.
    pub async fn budgets(&self) -> Result<CostBudgets> {
        match self.config.get(BUDGET_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(CostBudgets::default()),
        }
    }

    /// Spend so far today and this month, against the configured caps.
    pub async fn budget_status(&self) -> Result<BudgetStatus> {
        self.budget_status_at(Utc::now()).await
    }

    async fn budget_status_at(&self, now: DateTime<Utc>) -> Result<BudgetStatus> {
        let budgets = self.budgets().await?;

        let today = now.date_naive();
        let day_start = today.and_time(NaiveTime::MIN).and_utc();
        let month_start = today
            .with_day(1)
            .unwrap_or(today)
            .and_time(NaiveTime::MIN)
            .and_utc();

        let monthly_events = self.sink.since(month_start).await?;
        let mut daily_spend = 0.0;
        let mut monthly_spend = 0.0;
        for event in &monthly_events {
            if event.kind != EventKind::Generation || event.timestamp > now {
                continue;
            }
            let cost = self.event_cost(event);
            monthly_spend += cost;
            if event.timestamp >= day_start {
                daily_spend += cost;
            }
        }

        Ok(BudgetStatus {
            daily_spend_usd: daily_spend,
            monthly_spend_usd: monthly_spend,
            daily_budget_usd: budgets.daily_usd,
            monthly_budget_usd: budgets.monthly_usd,
        })
    }
}

/// Format a USD amount with precision matched to its size.
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${:.4}", cost)
    } else if cost < 1.0 {
        format!("${:.3}", cost)
    } else {
        format!("${:.2}", cost)
    }
}
