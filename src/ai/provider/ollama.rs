//! Ollama Local Backend
//!
//! Chat generation through `/api/chat` (newline-delimited JSON when
//! streaming) and embeddings through `/api/embeddings`. Local models report
//! token counts as `prompt_eval_count` / `eval_count`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::sse::{Frame, line_fragment_stream};
use super::{
    ChatBackend, FragmentStream, Generation, GenerationOptions, TokenUsage, failure_from_response,
    failure_from_transport, http_client,
};
use crate::ai::cache::EmbeddingProvider;
use crate::ai::timeout::Timeouts;
use crate::config::ProviderEndpointConfig;
use crate::types::{BackendFailure, ErrorCategory, Result, RouterError};

const DEFAULT_API_BASE: &str = "http://localhost:11434";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";

/// Ollama backend
#[derive(Debug)]
pub struct OllamaBackend {
    id: String,
    api_base: String,
    streaming: bool,
    request_timeout: Duration,
    auxiliary_timeout: Duration,
    embedding_model: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(id: &str, config: &ProviderEndpointConfig, timeouts: &Timeouts) -> Result<Self> {
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        // Validate endpoint URL for security (SSRF prevention)
        let api_base = Self::validate_endpoint(&api_base)?;

        Ok(Self {
            id: id.to_string(),
            api_base,
            streaming: config.streaming,
            request_timeout: timeouts.request,
            auxiliary_timeout: timeouts.auxiliary,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            client: http_client(timeouts)?,
        })
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    /// Only allows http/https schemes and warns for non-localhost endpoints.
    fn validate_endpoint(endpoint: &str) -> Result<String> {
        let url = url::Url::parse(endpoint).map_err(|e| {
            RouterError::Configuration(format!(
                "Invalid Ollama endpoint URL '{}': {}",
                endpoint, e
            ))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(RouterError::Configuration(format!(
                "Ollama endpoint must use http or https scheme, got: {}",
                url.scheme()
            )));
        }

        if let Some(host) = url.host_str()
            && !matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
        {
            warn!(host = %host, "Ollama endpoint is not localhost. Ensure this is intentional.");
        }

        let mut result = url.to_string();
        if result.ends_with('/') {
            result.pop();
        }
        Ok(result)
    }

    fn build_request(
        &self,
        system_prompt: &str,
        message: &str,
        model: &str,
        options: &GenerationOptions,
        stream: bool,
    ) -> OllamaChatRequest {
        OllamaChatRequest {
            model: model.to_string(),
            messages: vec![
                OllamaMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                OllamaMessage {
                    role: "user".to_string(),
                    content: message.to_string(),
                },
            ],
            stream,
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        }
    }

    async fn send_chat(
        &self,
        request: &OllamaChatRequest,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.api_base);
        let mut builder = self.client.post(&url).json(request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                BackendFailure::new(
                    ErrorCategory::Network,
                    format!(
                        "Failed to connect to Ollama at {}. Is Ollama running? Start with: ollama serve",
                        self.api_base
                    ),
                    &self.id,
                )
                .into()
            } else {
                failure_from_transport(e, &self.id)
            }
        })?;

        if !response.status().is_success() {
            return Err(failure_from_response(response, &self.id).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
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
        debug!(provider = %self.id, model = %model, "Sending Ollama chat request");

        let request = self.build_request(system_prompt, message, model, options, false);
        let response = self.send_chat(&request, Some(self.request_timeout)).await?;

        let body: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| failure_from_transport(e, &self.id))?;

        if let Some(error) = body.error {
            return Err(BackendFailure::new(ErrorCategory::Unknown, error, &self.id).into());
        }

        let text = body.message.map(|m| m.content).unwrap_or_default();
        let generation = Generation::new(text);
        Ok(match (body.prompt_eval_count, body.eval_count) {
            (Some(input), Some(output)) => generation.with_usage(TokenUsage::new(input, output)),
            _ => generation,
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
        debug!(provider = %self.id, model = %model, "Opening Ollama chat stream");

        let request = self.build_request(system_prompt, message, model, options, true);
        let response = self.send_chat(&request, None).await?;

        let provider = self.id.clone();
        Ok(line_fragment_stream(
            response.bytes_stream(),
            self.id.clone(),
            move |line| parse_stream_line(&line, &provider),
        ))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.api_base);
        let request = OllamaEmbeddingRequest {
            model: self.embedding_model.clone(),
            prompt: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .timeout(self.auxiliary_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| RouterError::EmbeddingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RouterError::EmbeddingUnavailable(format!(
                "{} returned HTTP {}",
                self.id,
                response.status().as_u16()
            )));
        }

        let body: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RouterError::EmbeddingUnavailable(e.to_string()))?;

        if body.embedding.is_empty() {
            return Err(RouterError::EmbeddingUnavailable(format!(
                "{} returned no embedding",
                self.id
            )));
        }
        Ok(body.embedding)
    }
}

/// Map one ndjson line of a chat stream
fn parse_stream_line(line: &str, provider: &str) -> Result<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Frame::Ignore);
    }

    let chunk: OllamaChatResponse =
        serde_json::from_str(line).map_err(|e| RouterError::StreamInterrupted {
            provider: provider.to_string(),
            reason: format!("malformed stream line: {}", e),
        })?;

    if let Some(error) = chunk.error {
        return Err(RouterError::StreamInterrupted {
            provider: provider.to_string(),
            reason: error,
        });
    }

    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    if !text.is_empty() {
        // A final line may carry both the last text and `done: true`; the
        // stream ends on its own after it
        return Ok(Frame::Text(text));
    }
    Ok(if chunk.done { Frame::Done } else { Frame::Ignore })
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        let backend =
            OllamaBackend::new("ollama", &ProviderEndpointConfig::default(), &Timeouts::default())
                .unwrap();
        assert_eq!(backend.api_base, DEFAULT_API_BASE);
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        let config = ProviderEndpointConfig {
            api_base: Some("file:///etc/passwd".to_string()),
            ..Default::default()
        };
        let err = OllamaBackend::new("ollama", &config, &Timeouts::default()).unwrap_err();
        assert!(matches!(err, RouterError::Configuration(_)));
    }

    #[test]
    fn test_parse_stream_line() {
        assert_eq!(
            parse_stream_line(r#"{"message":{"role":"assistant","content":"Hola"},"done":false}"#, "ollama")
                .unwrap(),
            Frame::Text("Hola".to_string())
        );
        assert_eq!(
            parse_stream_line(r#"{"message":{"role":"assistant","content":""},"done":true,"eval_count":3}"#, "ollama")
                .unwrap(),
            Frame::Done
        );
        assert_eq!(parse_stream_line("", "ollama").unwrap(), Frame::Ignore);
        assert!(parse_stream_line(r#"{"error":"model not found"}"#, "ollama").is_err());
    }

    #[test]
    fn test_request_carries_sampling_options() {
        let backend =
            OllamaBackend::new("ollama", &ProviderEndpointConfig::default(), &Timeouts::default())
                .unwrap();
        let options = GenerationOptions {
            max_tokens: 256,
            temperature: 0.2,
        };
        let value =
            serde_json::to_value(backend.build_request("sys", "hola", "llama3", &options, true)).unwrap();
        assert_eq!(value["options"]["num_predict"], 256);
        assert_eq!(value["stream"], true);
        assert_eq!(value["messages"][0]["role"], "system");
    }
}
