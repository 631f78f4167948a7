//! Chat Orchestrator
//!
//! Composes classification, caching, routing, failover and usage tracking
//! into two entry points:
//!
//! - [`Orchestrator::chat`]: buffered request/response
//! - [`Orchestrator::stream_chat`]: ordered `mode → chunk* → done|error` events
//!
//! ## Failover
//!
//! ```text
//! select_next(mode) ──► [p1, p2, …]
//!        │
//!        ├─ breaker re-checked before each attempt
//!        ├─ success: record_success, latency, cache, usage
//!        └─ failure/timeout: record_failure, fallback event, next candidate
//!
//! exhausted ──► static fallback response (provider "fallback", error = true)
//! ```
//!
//! Neither entry point surfaces an error to the caller.

mod streaming;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::ai::cache::{InMemoryVectorStore, ResponseCache, SharedResponseCache};
use crate::ai::classifier::{ModeClassifier, SharedClassifier};
use crate::ai::prompt::{fallback_response, format_response, system_prompt};
use crate::ai::provider::{
    BackendMap, ErrorClassifier, GenerationOptions, ProviderRouter, SharedBackend,
    SharedCircuitBreakers, SharedRouter, build_backends, create_embedding_provider,
    create_shared_breakers,
};
use crate::ai::stream::{RegexPiiMasker, SharedPiiMasker};
use crate::ai::timeout::{Timeouts, with_timeout};
use crate::ai::usage::{SharedUsageTracker, UsageTracker};
use crate::config::{Config, PromptConfig, StreamConfig, UsageConfig};
use crate::storage::{MemoryStateStore, SharedStateStore, create_state_store};
use crate::types::{
    ChatRequest, ChatResponse, Mode, ModeDecision, Result, RouterError, SharedClock,
    system_clock,
};

/// Routes chat requests across generation backends.
///
/// Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct Orchestrator {
    classifier: SharedClassifier,
    router: SharedRouter,
    backends: Arc<BackendMap>,
    cache: SharedResponseCache,
    usage: SharedUsageTracker,
    masker: Option<SharedPiiMasker>,
    timeouts: Timeouts,
    stream: StreamConfig,
    prompt: PromptConfig,
}

impl Orchestrator {
    pub fn builder(router: ProviderRouter) -> OrchestratorBuilder {
        OrchestratorBuilder::new(router)
    }

    /// Wire every collaborator from configuration, opening the configured state store
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let store = create_state_store(&config.storage)?;
        Self::from_config_with(config, store, system_clock())
    }

    /// Wire every collaborator from configuration over an existing store and clock
    pub fn from_config_with(config: &Config, store: SharedStateStore, clock: SharedClock) -> Result<Self> {
        let breakers = create_shared_breakers(&config.circuit_breaker, clock.clone(), store.clone());
        let router = ProviderRouter::from_config(config, breakers)?;
        let timeouts = Timeouts::from(&config.timeouts);

        let mut cache = ResponseCache::new(&config.cache, store.clone())
            .with_clock(clock.clone())
            .with_auxiliary_timeout(timeouts.auxiliary);
        if config.cache.semantic_enabled {
            match create_embedding_provider(config) {
                Ok(Some(embedder)) => {
                    info!(provider = %embedder.id(), "Semantic cache enabled");
                    let vectors = InMemoryVectorStore::with_capacity(config.cache.max_entries)
                        .with_clock(clock.clone());
                    cache = cache.with_semantic(embedder, Arc::new(vectors));
                }
                Ok(None) => debug!("No embedding provider configured, semantic cache disabled"),
                Err(e) => warn!(error = %e, "Semantic cache disabled"),
            }
        }

        let classifier = ModeClassifier::from_config(&config.classifier, &config.storage)?
            .with_clock(clock.clone())
            .with_load_timeout(timeouts.auxiliary);
        let usage = UsageTracker::new(store, &config.usage).with_clock(clock);

        Ok(Self::builder(router)
            .backends(build_backends(config))
            .classifier(classifier)
            .cache(cache)
            .usage(usage)
            .timeouts(timeouts)
            .stream_config(config.stream.clone())
            .prompt_config(config.prompt.clone())
            .build())
    }

    pub fn router(&self) -> &SharedRouter {
        &self.router
    }

    pub fn breakers(&self) -> &SharedCircuitBreakers {
        self.router.breakers()
    }

    pub fn cache(&self) -> &SharedResponseCache {
        &self.cache
    }

    pub fn usage(&self) -> &SharedUsageTracker {
        &self.usage
    }

    /// Classify without generating
    pub async fn classify(&self, request: &ChatRequest) -> ModeDecision {
        self.classifier.classify(&request.message, &request.context).await
    }

    /// Buffered chat. Always answers; total exhaustion yields the static
    /// fallback response.
    #[instrument(skip(self, request), fields(request_id = %Uuid::new_v4(), requested_mode = ?request.mode))]
    pub async fn chat(&self, request: &ChatRequest) -> ChatResponse {
        let (mode, decision) = self.resolve_mode(request).await;

        if let Some(hit) = self.cache.get(&request.message, mode, &request.context).await {
            debug!(mode = %mode, layer = %hit.cache_layer, "Serving cached response");
            return with_decision(hit, decision);
        }

        let candidates = match self.router.select_next(mode) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(mode = %mode, error = %e, "No provider available");
                return with_decision(fallback_response(mode), decision);
            }
        };

        let system = system_prompt(mode, &request.context, self.prompt.max_context_chars);
        let options = self.generation_options();

        for provider in candidates {
            let Some(backend) = self.attemptable(&provider) else {
                continue;
            };
            let model = self.router.resolve_model(&provider, mode);
            debug!(provider = %provider, model = %model, mode = %mode, "Attempting provider");

            let started = Instant::now();
            let result = with_timeout(
                self.timeouts.request,
                backend.chat(&system, &request.message, &model, &options),
                "generation request",
            )
            .await;

            match result {
                Ok(generation) => {
                    self.record_attempt_success(&provider, started);
                    let response = format_response(
                        &generation.text,
                        mode,
                        &provider,
                        &model,
                        self.prompt.max_suggestions,
                    );
                    self.cache
                        .set(&request.message, mode, &request.context, &response)
                        .await;
                    self.usage.record(
                        &provider,
                        &model,
                        &request.message,
                        &response.text,
                        generation.usage,
                    );
                    info!(provider = %provider, mode = %mode, "Chat completed");
                    return with_decision(response, decision);
                }
                Err(e) => self.record_attempt_failure(&provider, &e),
            }
        }

        warn!(mode = %mode, "All providers exhausted, answering with fallback");
        with_decision(fallback_response(mode), decision)
    }

    async fn resolve_mode(&self, request: &ChatRequest) -> (Mode, Option<ModeDecision>) {
        match request.mode {
            Some(mode) => (mode, None),
            None => {
                let decision = self.classify(request).await;
                self.usage.record_mode(decision.mode);
                (decision.mode, Some(decision))
            }
        }
    }

    /// Backend for `provider` if it is built and its circuit is closed
    fn attemptable(&self, provider: &str) -> Option<SharedBackend> {
        let Some(backend) = self.backends.get(provider) else {
            debug!(provider = %provider, "No backend built for provider, skipping");
            return None;
        };
        if !self.router.is_available(provider) {
            debug!(provider = %provider, "Circuit opened since selection, skipping");
            return None;
        }
        Some(backend.clone())
    }

    fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            max_tokens: self.prompt.max_tokens,
            temperature: self.prompt.temperature,
        }
    }

    fn record_attempt_success(&self, provider: &str, started: Instant) {
        self.router.breakers().record_success(provider);
        self.usage
            .record_latency_sample(started.elapsed().as_secs_f64());
    }

    fn record_attempt_failure(&self, provider: &str, err: &RouterError) {
        let failure = ErrorClassifier::classify_router_error(err, provider);
        warn!(
            provider = %provider,
            category = %failure.category,
            recoverable = err.is_recoverable(),
            error = %err,
            "Provider attempt failed"
        );
        self.router.breakers().record_failure(provider);
        self.usage.record_fallback_event(provider);
    }
}

fn with_decision(mut response: ChatResponse, decision: Option<ModeDecision>) -> ChatResponse {
    response.mode_decision = decision;
    response
}

// =============================================================================
// Builder
// =============================================================================

pub struct OrchestratorBuilder {
    router: ProviderRouter,
    backends: BackendMap,
    classifier: Option<ModeClassifier>,
    cache: Option<ResponseCache>,
    usage: Option<UsageTracker>,
    store: Option<SharedStateStore>,
    masker: Option<SharedPiiMasker>,
    timeouts: Timeouts,
    stream: StreamConfig,
    prompt: PromptConfig,
}

impl OrchestratorBuilder {
    pub fn new(router: ProviderRouter) -> Self {
        Self {
            router,
            backends: BackendMap::new(),
            classifier: None,
            cache: None,
            usage: None,
            store: None,
            masker: None,
            timeouts: Timeouts::default(),
            stream: StreamConfig::default(),
            prompt: PromptConfig::default(),
        }
    }

    pub fn backend(mut self, backend: SharedBackend) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn backends(mut self, backends: BackendMap) -> Self {
        self.backends.extend(backends);
        self
    }

    pub fn classifier(mut self, classifier: ModeClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn usage(mut self, usage: UsageTracker) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Store backing the default cache and usage tracker
    pub fn store(mut self, store: SharedStateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Custom masker for streamed chunks
    pub fn masker(mut self, masker: SharedPiiMasker) -> Self {
        self.masker = Some(masker);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn stream_config(mut self, config: StreamConfig) -> Self {
        self.stream = config;
        self
    }

    pub fn prompt_config(mut self, config: PromptConfig) -> Self {
        self.prompt = config;
        self
    }

    pub fn build(self) -> Orchestrator {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()) as SharedStateStore);
        let cache = self
            .cache
            .unwrap_or_else(|| ResponseCache::new(&Default::default(), store.clone()));
        let usage = self
            .usage
            .unwrap_or_else(|| UsageTracker::new(store, &UsageConfig::default()));

        let masker = match (self.masker, self.stream.mask_pii) {
            (Some(masker), _) => Some(masker),
            (None, true) => Some(Arc::new(RegexPiiMasker::new()) as SharedPiiMasker),
            (None, false) => None,
        };

        Orchestrator {
            classifier: Arc::new(self.classifier.unwrap_or_default()),
            router: Arc::new(self.router),
            backends: Arc::new(self.backends),
            cache: Arc::new(cache),
            usage: Arc::new(usage),
            masker,
            timeouts: self.timeouts,
            stream: self.stream,
            prompt: self.prompt,
        }
    }
}
