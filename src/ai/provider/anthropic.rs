//! Anthropic Messages API Backend
//!
//! Buffered calls read `content[].text` and `usage`; streamed calls consume
//! the SSE event sequence (`message_start`, `content_block_delta`,
//! `message_delta`, `message_stop`, `error`).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::sse::{Frame, SseEvent, sse_fragment_stream};
use super::{
    ChatBackend, FragmentStream, Generation, GenerationOptions, TokenUsage, failure_from_response,
    failure_from_transport, http_client,
};
use crate::ai::timeout::Timeouts;
use crate::config::ProviderEndpointConfig;
use crate::types::{BackendFailure, ErrorCategory, Result, RouterError};

const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Anthropic backend with secure API key handling
pub struct AnthropicBackend {
    id: String,
    api_key: SecretString,
    api_base: String,
    streaming: bool,
    request_timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBackend")
            .field("id", &self.id)
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("streaming", &self.streaming)
            .finish()
    }
}

impl AnthropicBackend {
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
            client: http_client(timeouts)?,
        })
    }

    fn build_request(
        &self,
        system_prompt: &str,
        message: &str,
        model: &str,
        options: &GenerationOptions,
        stream: bool,
    ) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            system: (!system_prompt.is_empty()).then(|| system_prompt.to_string()),
            messages: vec![MessageParam {
                role: "user".to_string(),
                content: message.to_string(),
            }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            stream,
        }
    }

    async fn send(
        &self,
        request: &MessagesRequest,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/messages", self.api_base);
        let mut builder = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
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
impl ChatBackend for AnthropicBackend {
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
        debug!(provider = %self.id, model = %model, "Sending messages request");

        let request = self.build_request(system_prompt, message, model, options, false);
        let response = self.send(&request, Some(self.request_timeout)).await?;

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| failure_from_transport(e, &self.id))?;

        let text: String = body
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        if text.is_empty() && body.content.is_empty() {
            return Err(BackendFailure::new(
                ErrorCategory::Unknown,
                "No content in messages response",
                &self.id,
            )
            .into());
        }

        Ok(Generation::new(text).with_usage(TokenUsage::new(
            body.usage.input_tokens,
            body.usage.output_tokens,
        )))
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
        debug!(provider = %self.id, model = %model, "Opening messages stream");

        let request = self.build_request(system_prompt, message, model, options, true);
        let response = self.send(&request, None).await?;

        let provider = self.id.clone();
        Ok(sse_fragment_stream(
            response.bytes_stream(),
            self.id.clone(),
            move |event| parse_stream_event(&event, &provider),
        ))
    }
}

/// Map one SSE event of a messages stream
fn parse_stream_event(event: &SseEvent, provider: &str) -> Result<Frame> {
    let malformed = |e: serde_json::Error| RouterError::StreamInterrupted {
        provider: provider.to_string(),
        reason: format!("malformed stream event: {}", e),
    };

    // The event name is duplicated in the payload's `type`; prefer the field
    let kind = match event.event.as_deref() {
        Some(kind) => kind.to_string(),
        None => serde_json::from_str::<EventType>(&event.data)
            .map_err(malformed)?
            .event_type,
    };

    match kind.as_str() {
        "content_block_delta" => {
            let delta: ContentBlockDelta = serde_json::from_str(&event.data).map_err(malformed)?;
            Ok(delta.delta.text.map(Frame::Text).unwrap_or(Frame::Ignore))
        }
        "message_stop" => Ok(Frame::Done),
        "error" => {
            let error: StreamError = serde_json::from_str(&event.data).map_err(malformed)?;
            Err(RouterError::StreamInterrupted {
                provider: provider.to_string(),
                reason: error.error.message,
            })
        }
        // message_start, content_block_start/stop, message_delta, ping
        _ => Ok(Frame::Ignore),
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<MessageParam>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct MessageParam {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct EventType {
    #[serde(rename = "type")]
    event_type: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: TextDelta,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    error: StreamErrorContent,
}

#[derive(Debug, Deserialize)]
struct StreamErrorContent {
    message: String,
}
