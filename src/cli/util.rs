//! CLI Common Utilities
//!
//! Shared initialization and argument parsing for CLI commands.

use std::path::Path;

use crate::ai::Orchestrator;
use crate::config::{Config, ConfigLoader};
use crate::types::{ChatContext, ChatRequest, Mode, Result, RouterError};

/// Command execution context
///
/// Holds the resolved configuration and a fully wired orchestrator.
#[derive(Clone)]
pub struct CommandContext {
    pub config: Config,
    pub orchestrator: Orchestrator,
}

impl CommandContext {
    /// Load configuration (from `config_path` when given, else the layered
    /// global → project → env chain) and wire the orchestrator.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = load_config(config_path)?;
        let orchestrator = Orchestrator::from_config(&config)?;
        Ok(Self {
            config,
            orchestrator,
        })
    }
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(RouterError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            ConfigLoader::load_from_file(path)
        }
        None => ConfigLoader::load(),
    }
}

/// Parse `key=value` pairs into a request context
pub fn parse_context(pairs: &[String]) -> Result<ChatContext> {
    let mut context = ChatContext::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            RouterError::Config(format!("Invalid context '{}', expected key=value", pair))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(RouterError::Config(format!(
                "Invalid context '{}', key is empty",
                pair
            )));
        }
        context.insert(key, value.trim());
    }
    Ok(context)
}

/// Parse a mode name for clap
pub fn parse_mode(s: &str) -> std::result::Result<Mode, String> {
    s.parse::<Mode>().map_err(|_| {
        let valid: Vec<&str> = Mode::ALL.iter().map(|m| m.as_str()).collect();
        format!("Invalid mode '{}'. Valid values: {}", s, valid.join(", "))
    })
}

/// Merge named context flags over raw `key=value` entries; named flags win
pub fn context_entries(
    tenant: Option<&str>,
    track: Option<&str>,
    phase: Option<&str>,
    extra: &[String],
) -> Vec<String> {
    let mut entries = extra.to_vec();
    for (key, value) in [("tenant", tenant), ("track", track), ("phase", phase)] {
        if let Some(value) = value {
            entries.push(format!("{}={}", key, value));
        }
    }
    entries
}

/// Assemble a request from CLI arguments
pub fn build_request(message: &str, mode: Option<Mode>, context: &[String]) -> Result<ChatRequest> {
    let mut request = ChatRequest::new(message).with_context(parse_context(context)?);
    request.mode = mode;
    Ok(request)
}
