//! Metrics Command
//!
//! Usage summary over the last days, cache statistics and breaker state.
//! Only meaningful with a persistent (`sqlite`) state store.

use serde::Serialize;

use crate::ai::provider::CircuitBreakerStats;
use crate::ai::{CacheStats, MetricsSummary};
use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::config::StorageBackend;
use crate::types::Result;

#[derive(Debug, Serialize)]
struct MetricsReport {
    usage: MetricsSummary,
    cache: CacheStats,
    circuit_breakers: Vec<CircuitBreakerStats>,
}

pub fn run(ctx: &CommandContext, format: &str) -> Result<()> {
    let breakers = ctx.orchestrator.breakers();
    let report = MetricsReport {
        usage: ctx.orchestrator.usage().metrics_summary(),
        cache: ctx.orchestrator.cache().stats(),
        circuit_breakers: ctx
            .config
            .providers
            .keys()
            .map(|provider| breakers.stats_for(provider))
            .collect(),
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let output = Output::new();
    if ctx.config.storage.backend == StorageBackend::Memory {
        output.info("In-memory state store: metrics cover this process only");
    }

    let usage = &report.usage;
    output.header("Usage");
    output.field("Calls", usage.totals.calls);
    output.field("Tokens", usage.totals.tokens);
    output.field("Cost (total)", format!("${:.4}", usage.totals.cost));
    output.field("Cost (7 days)", format!("${:.4}", usage.costs.weekly_total));
    output.field("Cost (month)", format!("${:.4}", usage.costs.monthly_total));

    output.section("Latency");
    output.field("p50", format!("{:.3}s", usage.latency.p50));
    output.field("p99", format!("{:.3}s", usage.latency.p99));
    output.field("avg", format!("{:.3}s", usage.latency.avg));
    output.field("samples", usage.latency.samples);

    if !usage.fallback_rate.is_empty() {
        output.section("Failovers");
        for (provider, rate) in &usage.fallback_rate {
            output.field(provider, format!("{} ({:.1}%)", rate.count, rate.rate));
        }
    }

    if !usage.costs.monthly_by_provider.is_empty() {
        output.section("This month by provider");
        for (provider, usage) in &usage.costs.monthly_by_provider {
            output.field(
                provider,
                format!(
                    "{} calls, {} in / {} out, ${:.4}",
                    usage.calls, usage.tokens_in, usage.tokens_out, usage.cost
                ),
            );
        }
    }

    if !usage.top_modes.is_empty() {
        output.section("Modes");
        for entry in &usage.top_modes {
            output.field(entry.mode.as_str(), entry.count);
        }
    }

    output.section("Cache");
    println!("  {}", report.cache.summary());

    output.section("Circuit breakers");
    for stats in &report.circuit_breakers {
        println!("  {}", stats.summary());
    }
    Ok(())
}
