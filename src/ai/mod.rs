//! AI Integration Layer
//!
//! Mode classification, provider routing with circuit breakers, response
//! caching, safe streaming and usage tracking, composed by the
//! [`Orchestrator`].

pub mod cache;
pub mod classifier;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod stream;
pub mod timeout;
pub mod tokenizer;
pub mod usage;

pub use cache::{
    CacheStats, EmbeddingProvider, InMemoryVectorStore, ResponseCache, SharedEmbeddingProvider,
    SharedResponseCache, VectorStore,
};
pub use classifier::{ModeClassifier, SharedClassifier};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use prompt::{PromptBuilder, system_prompt};
pub use provider::{
    BackendMap, ChatBackend, CircuitBreakerConfig, CircuitBreakerStats, CircuitBreakers,
    CircuitState, ErrorCategory, ErrorClassifier, Generation, GenerationOptions, ProviderRouter,
    SharedBackend, SharedCircuitBreakers, TokenUsage,
};
pub use stream::{
    ChatStream, PiiMasker, RegexPiiMasker, StreamBuffer, StreamEvent, StreamingMode,
};
pub use timeout::{Timeouts, with_timeout};
pub use tokenizer::{estimate_tokens, resolve_usage};
pub use usage::{MetricsSummary, PriceTable, SharedUsageTracker, UsageTracker};
