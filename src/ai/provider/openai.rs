//! OpenAI-compatible Chat Completions Backend
//!
//! Serves OpenAI itself and any endpoint speaking the same protocol
//! (Gemini's `/v1beta/openai` compatibility layer). Also provides
//! embeddings through `/embeddings` for the semantic cache tier.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use super::sse::{Frame, SseEvent, sse_fragment_stream};
use super::{
    ChatBackend, FragmentStream, Generation, GenerationOptions, TokenUsage, failure_from_response,
    failure_from_transport, http_client,
};
use crate::ai::cache::EmbeddingProvider;
use crate::ai::timeout::Timeouts;
use crate::config::ProviderEndpointConfig;
use crate::types::{BackendFailure, ErrorCategory, Result, RouterError};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI-compatible backend with secure API key handling
pub struct OpenAiBackend {
    id: String,
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: String,
    streaming: bool,
    request_timeout: Duration,
    auxiliary_timeout: Duration,
    embedding_model: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("id", &self.id)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("streaming", &self.streaming)
            .field("embedding_model", &self.embedding_model)
            .finish()
    }
}

impl OpenAiBackend {
    pub fn new(id: &str, config: &ProviderEndpointConfig, timeouts: &Timeouts) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            RouterError::Configuration(format!(
                "API key for provider '{}' not found. Set {} or provide api_key in config",
                id,
                config.api_key_env.as_deref().unwrap_or("api_key_env")
            ))
        })?;

        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            id: id.to_string(),
            api_key: SecretString::from(api_key),
            api_base,
            streaming: config.streaming,
            request_timeout: timeouts.request,
            auxiliary_timeout: timeouts.auxiliary,
            embedding_model: crate::config::CacheConfig::default().embedding_model,
            client: http_client(timeouts)?,
        })
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    fn build_request(
        &self,
        system_prompt: &str,
        message: &str,
        model: &str,
        options: &GenerationOptions,
        stream: bool,
    ) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: message.to_string(),
                },
            ],
            temperature: options.temperature,
            max_tokens: Some(options.max_tokens),
            stream,
        }
    }

    async fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.api_base, path);
        let mut request = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| failure_from_transport(e, &self.id))?;

        if !response.status().is_success() {
            return Err(failure_from_response(response, &self.id).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.id
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn chat(
        &self,
        system_prompt: &str,
        message: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<Generation> {
        debug!(provider = %self.id, model = %model, "Sending chat completion request");
        let start = Instant::now();

        let request = self.build_request(system_prompt, message, model, options, false);
        let response = self
            .post("chat/completions", &request, Some(self.request_timeout))
            .await?;

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| failure_from_transport(e, &self.id))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                BackendFailure::new(
                    ErrorCategory::Unknown,
                    "No content in chat completion response",
                    &self.id,
                )
            })?;

        debug!(
            provider = %self.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Chat completion received"
        );

        let generation = Generation::new(text);
        Ok(match body.usage {
            Some(u) => generation.with_usage(TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            None => generation,
        })
    }

    async fn stream(
        &self,
        system_prompt: &str,
        message: &str,
        model: &str,
        options: &GenerationOptions,
    ) -> Result<FragmentStream> {
        if !self.streaming {
            return Err(RouterError::unavailable(&self.id, "streaming disabled"));
        }
        debug!(provider = %self.id, model = %model, "Opening chat completion stream");

        let request = self.build_request(system_prompt, message, model, options, true);
        // No total timeout: the caller bounds the gap between fragments
        let response = self.post("chat/completions", &request, None).await?;

        let provider = self.id.clone();
        Ok(sse_fragment_stream(
            response.bytes_stream(),
            self.id.clone(),
            move |event| parse_stream_event(&event, &provider),
        ))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: text.to_string(),
        };

        let response = self
            .post("embeddings", &request, Some(self.auxiliary_timeout))
            .await
            .map_err(|e| RouterError::EmbeddingUnavailable(e.to_string()))?;

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RouterError::EmbeddingUnavailable(e.to_string()))?;

        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                RouterError::EmbeddingUnavailable(format!("{} returned no embedding", self.id))
            })
    }
}

/// Map one SSE event of a chat completion stream
fn parse_stream_event(event: &SseEvent, provider: &str) -> Result<Frame> {
    let data = event.data.trim();
    if data == "[DONE]" {
        return Ok(Frame::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| RouterError::StreamInterrupted {
        provider: provider.to_string(),
        reason: format!("malformed stream chunk: {}", e),
    })?;

    if let Some(error) = chunk.error {
        return Err(RouterError::StreamInterrupted {
            provider: provider.to_string(),
            reason: error.message,
        });
    }

    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();

    Ok(if text.is_empty() {
        Frame::Ignore
    } else {
        Frame::Text(text)
    })
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let config = ProviderEndpointConfig {
            api_key_env: Some("COPILOT_ROUTER_TEST_UNSET_KEY".to_string()),
            ..Default::default()
        };
        let err = OpenAiBackend::new("openai", &config, &Timeouts::default()).unwrap_err();
        assert!(matches!(err, RouterError::Configuration(_)));
    }

    #[test]
    fn test_api_base_trailing_slash_trimmed() {
        let config = ProviderEndpointConfig {
            api_key: Some("sk-test".to_string()),
            api_base: Some("https://example.test/v1/".to_string()),
            ..Default::default()
        };
        let backend = OpenAiBackend::new("gemini", &config, &Timeouts::default()).unwrap();
        assert_eq!(backend.api_base, "https://example.test/v1");
        assert!(!format!("{:?}", backend).contains("sk-test"));
    }

    #[test]
    fn test_request_omits_stream_flag_when_buffered() {
        let config = ProviderEndpointConfig {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let backend = OpenAiBackend::new("openai", &config, &Timeouts::default()).unwrap();
        let options = GenerationOptions::default();

        let buffered = serde_json::to_value(backend.build_request("sys", "hola", "gpt-4o", &options, false)).unwrap();
        assert!(buffered.get("stream").is_none());
        assert_eq!(buffered["messages"][0]["role"], "system");
        assert_eq!(buffered["messages"][1]["content"], "hola");

        let streamed = serde_json::to_value(backend.build_request("sys", "hola", "gpt-4o", &options, true)).unwrap();
        assert_eq!(streamed["stream"], true);
    }

    #[test]
    fn test_parse_stream_event() {
        let text = parse_stream_event(
            &event(r#"{"choices":[{"delta":{"content":"Hola"}}]}"#),
            "openai",
        )
        .unwrap();
        assert_eq!(text, Frame::Text("Hola".to_string()));

        let role_only = parse_stream_event(
            &event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            "openai",
        )
        .unwrap();
        assert_eq!(role_only, Frame::Ignore);

        assert_eq!(parse_stream_event(&event("[DONE]"), "openai").unwrap(), Frame::Done);
        assert!(parse_stream_event(&event("{not json"), "openai").is_err());
        assert!(
            parse_stream_event(&event(r#"{"error":{"message":"overloaded"}}"#), "openai").is_err()
        );
    }
}
