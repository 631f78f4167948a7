//! Chat Commands
//!
//! Usage:
//!   copilot-router chat "¿Cómo valido mi idea?" [--mode consultor] [--tenant t1] [-C key=value] [-f json]
//!   copilot-router chat "..." --stream
//!   copilot-router stream "..." [--tenant t1] [--track IMPULSO] [-f json]

use std::io::Write;

use futures::StreamExt;

use crate::ai::{StreamEvent, StreamingMode};
use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::types::{CacheLayer, ChatRequest, ChatResponse, Result};

/// Buffered chat
pub async fn run(ctx: &CommandContext, request: ChatRequest, format: &str) -> Result<()> {
    let response = ctx.orchestrator.chat(&request).await;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    print_response(&response);
    Ok(())
}

/// Streaming chat. JSON output prints one event per line.
pub async fn stream(ctx: &CommandContext, request: ChatRequest, format: &str) -> Result<()> {
    let mut events = ctx.orchestrator.stream_chat(request);
    let output = Output::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        if format == "json" {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }

        match event {
            StreamEvent::Mode { mode, .. } => output.meta(&format!("[{}]", mode.label())),
            StreamEvent::Chunk { text, .. } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamEvent::Done {
                provider,
                model,
                suggestions,
                streaming_mode,
                ..
            } => {
                println!();
                if !suggestions.is_empty() {
                    output.section("Suggestions");
                    output.list(&suggestions);
                }
                output.meta(&format!(
                    "\n{} · {}{}",
                    provider,
                    if model.is_empty() { "-" } else { model.as_str() },
                    match streaming_mode {
                        StreamingMode::Real => String::new(),
                        other => format!(" · {}", other),
                    }
                ));
            }
            StreamEvent::Error { message } => {
                println!();
                output.error(&message);
            }
        }
    }
    Ok(())
}

fn print_response(response: &ChatResponse) {
    let output = Output::new();

    if response.error {
        output.warning("All providers unavailable, showing fallback answer");
    }
    println!("{}", response.text);

    if !response.suggestions.is_empty() {
        output.section("Suggestions");
        output.list(&response.suggestions);
    }

    let cache = match (response.cache_layer, response.similarity_score) {
        (CacheLayer::None, _) => String::new(),
        (layer, Some(score)) => format!(" · cache {} ({:.2})", layer, score),
        (layer, None) => format!(" · cache {}", layer),
    };
    output.meta(&format!(
        "\n[{}] {} · {}{}",
        response.mode.label(),
        response.provider,
        if response.model.is_empty() { "-" } else { response.model.as_str() },
        cache
    ));
}
