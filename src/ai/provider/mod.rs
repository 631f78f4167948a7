//! Generation Backends
//!
//! Defines the [`ChatBackend`] trait every generation endpoint implements,
//! plus the circuit breaker table and the mode-aware provider router.
//!
//! ## Modules
//!
//! - `router`: Ordered candidates per mode, filtered by breaker state
//! - `circuit_breaker`: Per-provider failure/cooldown state machine
//! - `openai`: Chat Completions (OpenAI, Gemini's compatible endpoint)
//! - `anthropic`: Messages API
//! - `ollama`: Local Ollama server
//! - `sse`: Incremental decoding of streamed responses

mod anthropic;
mod circuit_breaker;
mod ollama;
mod openai;
mod router;
pub mod sse;

pub use anthropic::AnthropicBackend;
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitBreakers,
    CircuitState, SharedCircuitBreakers, create_shared_breakers,
};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use router::{ProviderEndpoint, ProviderRouter, ProviderRouterBuilder, SharedRouter};

// Re-export error types from centralized location
pub use crate::types::{BackendFailure, ErrorCategory, ErrorClassifier};

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ai::cache::SharedEmbeddingProvider;
use crate::ai::timeout::Timeouts;
use crate::config::{Config, ProviderEndpointConfig, ProviderKind};
use crate::types::{Result, RouterError};

// =============================================================================
// Generation Types
// =============================================================================

/// Token counts reported by the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens (prompt)
    pub input_tokens: u32,
    /// Output tokens (response)
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens used (input + output)
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn as_pair(&self) -> (u32, u32) {
        (self.input_tokens, self.output_tokens)
    }
}

/// Buffered generation result
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Absent when the backend did not report counts
    pub usage: Option<TokenUsage>,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Sampling parameters passed to every generation call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: crate::constants::prompt::DEFAULT_MAX_TOKENS,
            temperature: crate::constants::prompt::DEFAULT_TEMPERATURE,
        }
    }
}

/// Ordered text fragments from a streaming backend
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Shared backend handle
pub type SharedBackend = Arc<dyn ChatBackend>;

/// Backends keyed by provider id
pub type BackendMap = BTreeMap<String, SharedBackend>;

// =============================================================================
// Chat Backend Trait
// =============================================================================

/// A generation endpoint
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Provider id used for routing, breakers and usage keys
    fn name(&self) -> &str;

    /// Whether [`ChatBackend::stream`] yields incremental fragments
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Buffered generation
    async fn chat(
        &self,
        system_prompt: &str,
        message: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<Generation>;

    /// Incremental generation. The returned stream ends after the last
    /// fragment; a failure is yielded as its final item.
    async fn stream(
        &self,
        system_prompt: &str,
        message: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<FragmentStream> {
        let _ = (system_prompt, message, model, options);
        Err(RouterError::unavailable(
            self.name(),
            "streaming not supported",
        ))
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Build one backend from its endpoint configuration
pub fn create_backend(
    id: &str,
    config: &ProviderEndpointConfig,
    timeouts: &Timeouts,
) -> Result<SharedBackend> {
    match config.kind {
        ProviderKind::OpenAi => Ok(Arc::new(OpenAiBackend::new(id, config, timeouts)?)),
        ProviderKind::Anthropic => Ok(Arc::new(AnthropicBackend::new(id, config, timeouts)?)),
        ProviderKind::Ollama => Ok(Arc::new(OllamaBackend::new(id, config, timeouts)?)),
    }
}

/// Build every enabled backend.
///
/// A backend that cannot be constructed (typically a missing API key) is
/// skipped with a warning; its routes then fall through to the next
/// candidate.
pub fn build_backends(config: &Config) -> BackendMap {
    let timeouts = Timeouts::from(&config.timeouts);
    let mut backends = BackendMap::new();

    for (id, endpoint) in &config.providers {
        if !endpoint.enabled {
            debug!(provider = %id, "Provider disabled, skipping");
            continue;
        }
        match create_backend(id, endpoint, &timeouts) {
            Ok(backend) => {
                debug!(provider = %id, kind = %endpoint.kind, "Backend ready");
                backends.insert(id.clone(), backend);
            }
            Err(e) => warn!(provider = %id, error = %e, "Backend unavailable, skipping"),
        }
    }

    backends
}

/// Build the embedding provider named by `cache.embedding_provider`
pub fn create_embedding_provider(config: &Config) -> Result<Option<SharedEmbeddingProvider>> {
    let Some(id) = config.cache.embedding_provider.as_deref() else {
        return Ok(None);
    };
    let endpoint = config.providers.get(id).ok_or_else(|| {
        RouterError::Configuration(format!("Unknown embedding provider: {}", id))
    })?;

    let timeouts = Timeouts::from(&config.timeouts);
    let model = config.cache.embedding_model.clone();
    let provider: SharedEmbeddingProvider = match endpoint.kind {
        ProviderKind::OpenAi => {
            Arc::new(OpenAiBackend::new(id, endpoint, &timeouts)?.with_embedding_model(model))
        }
        ProviderKind::Ollama => {
            Arc::new(OllamaBackend::new(id, endpoint, &timeouts)?.with_embedding_model(model))
        }
        ProviderKind::Anthropic => {
            return Err(RouterError::Configuration(format!(
                "Provider {} ({}) has no embeddings endpoint. Supported: openai, ollama",
                id, endpoint.kind
            )));
        }
    };
    Ok(Some(provider))
}

/// Shared HTTP client with connect timeout; request timeouts are applied per call
pub(crate) fn http_client(timeouts: &Timeouts) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(timeouts.connect)
        .build()
        .map_err(|e| RouterError::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Map a non-success response into a categorized backend failure
pub(crate) async fn failure_from_response(
    response: reqwest::Response,
    provider: &str,
) -> RouterError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        body
    };
    ErrorClassifier::classify_http_status(status, &message, provider).into()
}

/// Map a transport error into a categorized backend failure
pub(crate) fn failure_from_transport(err: reqwest::Error, provider: &str) -> RouterError {
    let category = if err.is_timeout() || err.is_connect() {
        ErrorCategory::Network
    } else {
        ErrorClassifier::classify(&err.to_string(), provider).category
    };
    BackendFailure::new(category, err.to_string(), provider).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(100, 50);
        assert_eq!(usage.total(), 150);
        assert_eq!(usage.as_pair(), (100, 50));
    }

    #[test]
    fn test_build_backends_skips_missing_keys() {
        let mut config = Config::default();
        for endpoint in config.providers.values_mut() {
            endpoint.api_key = None;
            endpoint.api_key_env = Some("COPILOT_ROUTER_TEST_UNSET_KEY".to_string());
        }
        config.providers.insert(
            "local".to_string(),
            ProviderEndpointConfig {
                kind: ProviderKind::Ollama,
                ..Default::default()
            },
        );

        let backends = build_backends(&config);
        assert_eq!(backends.keys().collect::<Vec<_>>(), vec!["local"]);
    }

    #[test]
    fn test_disabled_backends_are_skipped() {
        let mut config = Config::default();
        config.providers.clear();
        config.providers.insert(
            "local".to_string(),
            ProviderEndpointConfig {
                kind: ProviderKind::Ollama,
                enabled: false,
                ..Default::default()
            },
        );
        assert!(build_backends(&config).is_empty());
    }

    #[test]
    fn test_embedding_provider_requires_embeddings_endpoint() {
        let mut config = Config::default();
        config.cache.embedding_provider = Some("anthropic".to_string());
        config
            .providers
            .get_mut("anthropic")
            .unwrap()
            .api_key = Some("sk-test".to_string());
        assert!(create_embedding_provider(&config).is_err());

        config.cache.embedding_provider = None;
        assert!(create_embedding_provider(&config).unwrap().is_none());
    }
}
