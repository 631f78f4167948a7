//! Usage Tracking
//!
//! Records tokens, cost, latency, failover events and mode detections into
//! the shared [`StateStore`], and aggregates them on demand.
//!
//! ## State Keys
//!
//! - `ai_cost_total_{tokens,cost,calls}` and `ai_cost_<provider>_{tokens,cost,calls}`
//! - `ai_usage_<YYYY-MM>`: per-provider monthly totals
//! - `ai_usage_daily_<YYYY-MM-DD>`: daily totals
//! - `ai_latency_samples_<YYYY-MM-DD>`: rolling latency samples (seconds)
//! - `ai_fallback_count_<YYYY-MM-DD>`: failed attempts per provider
//! - `mode_detector_<mode>_count`: classifier decisions per mode
//!
//! Telemetry never interrupts a request: every write and read failure is
//! logged and swallowed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::ai::provider::TokenUsage;
use crate::ai::tokenizer::resolve_usage;
use crate::config::{ModelPrice, UsageConfig};
use crate::storage::SharedStateStore;
use crate::types::{Mode, SharedClock, day_key, log_filter_warn, month_key, system_clock};

// =============================================================================
// Price Table
// =============================================================================

const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    ("claude-sonnet-4-5-20250929", 0.003, 0.015),
    ("claude-haiku-4-5-20251001", 0.0008, 0.004),
    ("claude-3-5-sonnet-20241022", 0.003, 0.015),
    ("claude-3-haiku-20240307", 0.00025, 0.00125),
    ("gpt-4o", 0.0025, 0.01),
    ("gemini-2.5-pro", 0.00125, 0.005),
    ("gemini-2.5-flash", 0.000075, 0.0003),
    ("gemini-2.0-flash", 0.000075, 0.0003),
    ("gemini-3-pro-preview", 0.00125, 0.005),
];

/// Per-model price per 1K tokens
#[derive(Debug, Clone)]
pub struct PriceTable {
    prices: BTreeMap<String, ModelPrice>,
    default: ModelPrice,
}

impl PriceTable {
    /// Built-in prices overlaid with `usage.prices`
    pub fn from_config(config: &UsageConfig) -> Self {
        let mut prices: BTreeMap<String, ModelPrice> = BUILTIN_PRICES
            .iter()
            .map(|(model, input, output)| {
                (
                    model.to_string(),
                    ModelPrice {
                        input: *input,
                        output: *output,
                    },
                )
            })
            .collect();
        prices.extend(config.prices.iter().map(|(k, v)| (k.clone(), *v)));

        Self {
            prices,
            default: config.default_price,
        }
    }

    pub fn price_for(&self, model: &str) -> ModelPrice {
        self.prices.get(model).copied().unwrap_or(self.default)
    }

    /// `(in/1000)*price_in + (out/1000)*price_out`
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let price = self.price_for(model);
        (input_tokens as f64 / 1000.0) * price.input + (output_tokens as f64 / 1000.0) * price.output
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::from_config(&UsageConfig::default())
    }
}

// =============================================================================
// Records
// =============================================================================

/// One completed generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSample {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    /// `YYYY-MM-DD`
    pub day: String,
}

/// Daily totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub cost: f64,
    pub tokens: u64,
    pub calls: u64,
}

/// Monthly totals of one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub calls: u64,
}

// =============================================================================
// Summary
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub p50: f64,
    pub p99: f64,
    pub avg: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FallbackRate {
    pub count: i64,
    /// Percentage of all recorded calls
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub daily: BTreeMap<String, DailyUsage>,
    pub weekly_total: f64,
    pub monthly_total: f64,
    pub monthly_by_provider: BTreeMap<String, ProviderUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub tokens: i64,
    pub cost: f64,
    pub calls: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeCount {
    pub mode: Mode,
    pub count: i64,
}

/// Read-only aggregation over the summary window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub latency: LatencySummary,
    pub fallback_rate: BTreeMap<String, FallbackRate>,
    pub costs: CostSummary,
    pub totals: UsageTotals,
    /// Descending by count
    pub top_modes: Vec<ModeCount>,
}

// =============================================================================
// Usage Tracker
// =============================================================================

/// Shared tracker handle
pub type SharedUsageTracker = Arc<UsageTracker>;

pub struct UsageTracker {
    store: SharedStateStore,
    clock: SharedClock,
    prices: PriceTable,
    enabled: bool,
    max_latency_samples: usize,
    window_days: i64,
}

impl UsageTracker {
    pub fn new(store: SharedStateStore, config: &UsageConfig) -> Self {
        Self {
            store,
            clock: system_clock(),
            prices: PriceTable::from_config(config),
            enabled: config.enabled,
            max_latency_samples: config.max_latency_samples.max(1),
            window_days: config.summary_window_days.max(1),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Record one completed generation.
    ///
    /// Uses the backend's token counts when present, otherwise estimates
    /// them from the texts.
    pub fn record(
        &self,
        provider: &str,
        model: &str,
        input_text: &str,
        output_text: &str,
        usage: Option<TokenUsage>,
    ) -> UsageSample {
        let (input_tokens, output_tokens) =
            resolve_usage(input_text, output_text, usage.map(|u| u.as_pair()));
        let cost = self.prices.cost(model, input_tokens, output_tokens);
        let now = self.clock.now();

        let sample = UsageSample {
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost,
            day: day_key(now),
        };

        if !self.enabled {
            return sample;
        }

        let total_tokens = (input_tokens + output_tokens) as i64;
        let store = &self.store;

        log_filter_warn(store.increment("ai_cost_total_tokens", total_tokens), "Usage tracking failed");
        log_filter_warn(add_f64(store, "ai_cost_total_cost", cost), "Usage tracking failed");
        log_filter_warn(store.increment("ai_cost_total_calls", 1), "Usage tracking failed");

        log_filter_warn(
            store.increment(&format!("ai_cost_{}_tokens", provider), total_tokens),
            "Usage tracking failed",
        );
        log_filter_warn(
            add_f64(store, &format!("ai_cost_{}_cost", provider), cost),
            "Usage tracking failed",
        );
        log_filter_warn(
            store.increment(&format!("ai_cost_{}_calls", provider), 1),
            "Usage tracking failed",
        );

        let month = format!("ai_usage_{}", month_key(now));
        log_filter_warn(
            store.update(&month, &mut |current| {
                let mut monthly: BTreeMap<String, ProviderUsage> = decode(current);
                let entry = monthly.entry(provider.to_string()).or_default();
                entry.tokens_in += input_tokens;
                entry.tokens_out += output_tokens;
                entry.cost += cost;
                entry.calls += 1;
                encode(&monthly)
            }),
            "Monthly usage tracking failed",
        );

        let daily = format!("ai_usage_daily_{}", sample.day);
        log_filter_warn(
            store.update(&daily, &mut |current| {
                let mut day: DailyUsage = decode(current);
                day.cost += cost;
                day.tokens += input_tokens + output_tokens;
                day.calls += 1;
                encode(&day)
            }),
            "Daily usage tracking failed",
        );

        debug!(
            provider = %provider,
            model = %model,
            tokens = total_tokens,
            cost = cost,
            "AI usage tracked"
        );
        sample
    }

    /// Append a latency sample to today's rolling list
    pub fn record_latency_sample(&self, seconds: f64) {
        if !self.enabled {
            return;
        }
        let key = format!("ai_latency_samples_{}", day_key(self.clock.now()));
        let cap = self.max_latency_samples;
        let rounded = (seconds * 1000.0).round() / 1000.0;

        log_filter_warn(
            self.store.update(&key, &mut |current| {
                let mut samples: Vec<f64> = decode(current);
                samples.push(rounded);
                if samples.len() > cap {
                    let excess = samples.len() - cap;
                    samples.drain(..excess);
                }
                encode(&samples)
            }),
            "Latency tracking failed",
        );
    }

    /// Count a failed attempt against a provider
    pub fn record_fallback_event(&self, provider: &str) {
        if !self.enabled {
            return;
        }
        let key = format!("ai_fallback_count_{}", day_key(self.clock.now()));
        log_filter_warn(
            self.store.update(&key, &mut |current| {
                let mut counts: BTreeMap<String, i64> = decode(current);
                *counts.entry(provider.to_string()).or_default() += 1;
                encode(&counts)
            }),
            "Fallback tracking failed",
        );
    }

    /// Count one classifier decision
    pub fn record_mode(&self, mode: Mode) {
        if !self.enabled {
            return;
        }
        log_filter_warn(
            self.store
                .increment(&format!("mode_detector_{}_count", mode.as_str()), 1),
            "Mode tracking failed",
        );
    }

    /// Detection counts per mode, descending; zero counts omitted
    pub fn mode_counts(&self) -> Vec<ModeCount> {
        let mut counts: Vec<ModeCount> = Mode::ALL
            .iter()
            .filter_map(|mode| {
                let key = format!("mode_detector_{}_count", mode.as_str());
                let count = log_filter_warn(self.store.get_i64(&key), "Mode count read failed")
                    .unwrap_or(0);
                (count > 0).then_some(ModeCount { mode: *mode, count })
            })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count));
        counts
    }

    /// Aggregate the last `summary_window_days` days. Never fails.
    pub fn metrics_summary(&self) -> MetricsSummary {
        let now = self.clock.now();
        let days: Vec<String> = (0..self.window_days)
            .map(|i| day_key(now - Duration::days(i)))
            .collect();

        // Latency
        let mut samples: Vec<f64> = days
            .iter()
            .flat_map(|day| self.read::<Vec<f64>>(&format!("ai_latency_samples_{}", day)))
            .collect();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let latency = if samples.is_empty() {
            LatencySummary::default()
        } else {
            let n = samples.len();
            let percentile = |q: f64| samples[((n as f64 * q) as usize).min(n - 1)];
            LatencySummary {
                p50: round3(percentile(0.50)),
                p99: round3(percentile(0.99)),
                avg: round3(samples.iter().sum::<f64>() / n as f64),
                samples: n,
            }
        };

        // Totals
        let totals = UsageTotals {
            tokens: self.read_i64("ai_cost_total_tokens"),
            cost: log_filter_warn(self.store.get_f64("ai_cost_total_cost"), "Metrics read failed")
                .unwrap_or(0.0),
            calls: self.read_i64("ai_cost_total_calls"),
        };

        // Fallback rate
        let mut fallbacks: BTreeMap<String, i64> = BTreeMap::new();
        for day in &days {
            let counts: BTreeMap<String, i64> = self.read(&format!("ai_fallback_count_{}", day));
            for (provider, count) in counts {
                *fallbacks.entry(provider).or_default() += count;
            }
        }
        let fallback_rate = fallbacks
            .into_iter()
            .map(|(provider, count)| {
                let rate = if totals.calls > 0 {
                    round2(count as f64 / totals.calls as f64 * 100.0)
                } else {
                    0.0
                };
                (provider, FallbackRate { count, rate })
            })
            .collect();

        // Costs
        let mut costs = CostSummary::default();
        for day in &days {
            let usage: DailyUsage = self.read(&format!("ai_usage_daily_{}", day));
            costs.weekly_total += usage.cost;
            costs.daily.insert(day.clone(), usage);
        }
        costs.monthly_by_provider = self.read(&format!("ai_usage_{}", month_key(now)));
        costs.monthly_total = costs.monthly_by_provider.values().map(|p| p.cost).sum();

        MetricsSummary {
            latency,
            fallback_rate,
            costs,
            totals,
            top_modes: self.mode_counts(),
        }
    }

    fn read<T: serde::de::DeserializeOwned + Default>(&self, key: &str) -> T {
        log_filter_warn(self.store.get(key), "Metrics read failed")
            .map(decode)
            .unwrap_or_default()
    }

    fn read_i64(&self, key: &str) -> i64 {
        log_filter_warn(self.store.get_i64(key), "Metrics read failed").unwrap_or(0)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Decode a stored aggregate, treating absent or malformed values as empty
fn decode<T: serde::de::DeserializeOwned + Default>(value: Option<Value>) -> T {
    match value {
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!(error = %e, "Discarding malformed usage aggregate");
            T::default()
        }),
        None => T::default(),
    }
}

fn encode<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn add_f64(store: &SharedStateStore, key: &str, by: f64) -> crate::types::Result<Value> {
    store.update(key, &mut |current| {
        let total = current.and_then(|v| v.as_f64()).unwrap_or(0.0) + by;
        serde_json::Number::from_f64(total)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
