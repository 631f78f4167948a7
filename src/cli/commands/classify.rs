//! Classify Command
//!
//! Show the mode the classifier picks for a message, without generating.

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::types::{ChatRequest, Mode, Result};

pub async fn run(ctx: &CommandContext, request: ChatRequest, format: &str) -> Result<()> {
    let decision = ctx.orchestrator.classify(&request).await;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&decision)?);
        return Ok(());
    }

    let output = Output::new();
    output.header(&format!("{} ({})", decision.mode.label(), decision.mode));
    output.field("Confidence", decision.confidence);
    output.field("Score", format!("{:.2}", decision.score));
    output.field("Emotion", format!("{:.2}", decision.emotion_score));

    let mut ranked: Vec<(&Mode, &f64)> = decision.scores.iter().filter(|(_, s)| **s > 0.0).collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
    if !ranked.is_empty() {
        output.section("Scores");
        for (mode, score) in ranked {
            output.field(mode.as_str(), format!("{:.2}", score));
        }
    }
    Ok(())
}
