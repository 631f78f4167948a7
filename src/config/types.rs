//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/copilot-router/) and project (.copilot-router/)
//! level configuration.
//!
//! Mode-keyed tables use plain mode names (`coach`, `cfo`, ...) as keys and
//! are checked by [`Config::validate`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::constants::{
    cache as cache_constants, circuit_breaker as cb_constants, classifier as cls_constants,
    network, prompt as prompt_constants, stream as stream_constants, usage as usage_constants,
};
use crate::types::{Mode, Result, RouterError};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Generation backends keyed by provider id
    pub providers: BTreeMap<String, ProviderEndpointConfig>,

    /// Per-mode provider order and model table
    pub routing: RoutingConfig,

    pub circuit_breaker: CircuitBreakerSettings,

    pub cache: CacheConfig,

    pub classifier: ClassifierConfig,

    pub stream: StreamConfig,

    pub usage: UsageConfig,

    pub storage: StorageConfig,

    pub timeouts: TimeoutConfig,

    pub prompt: PromptConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            providers: default_providers(),
            routing: RoutingConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            cache: CacheConfig::default(),
            classifier: ClassifierConfig::default(),
            stream: StreamConfig::default(),
            usage: UsageConfig::default(),
            storage: StorageConfig::default(),
            timeouts: TimeoutConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `RouterError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(RouterError::Config(
                "circuit_breaker.failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.circuit_breaker.cooldown_secs == 0 {
            return Err(RouterError::Config(
                "circuit_breaker.cooldown_secs must be greater than 0".to_string(),
            ));
        }

        let similarity = self.cache.similarity_threshold;
        if !(similarity > 0.0 && similarity <= 1.0) {
            return Err(RouterError::Config(format!(
                "cache.similarity_threshold must be in (0, 1], got {}",
                similarity
            )));
        }

        if self.cache.ttl_secs == 0 {
            return Err(RouterError::Config(
                "cache.ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_entries == 0 {
            return Err(RouterError::Config(
                "cache.max_entries must be greater than 0".to_string(),
            ));
        }

        if self.stream.min_flush_chars >= self.stream.max_chunk_chars {
            return Err(RouterError::Config(format!(
                "stream.min_flush_chars ({}) must be less than stream.max_chunk_chars ({})",
                self.stream.min_flush_chars, self.stream.max_chunk_chars
            )));
        }

        if self.timeouts.request_secs == 0 {
            return Err(RouterError::Config(
                "timeouts.request_secs must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.prompt.temperature) {
            return Err(RouterError::Config(format!(
                "prompt.temperature must be between 0.0 and 2.0, got {}",
                self.prompt.temperature
            )));
        }

        for (mode, providers) in &self.routing.modes {
            parse_mode_key(mode, "routing.modes")?;
            for provider in providers {
                if !self.providers.contains_key(provider) {
                    return Err(RouterError::Config(format!(
                        "routing.modes.{} names unknown provider '{}'",
                        mode, provider
                    )));
                }
            }
        }

        for provider in &self.routing.default_providers {
            if !self.providers.contains_key(provider) {
                return Err(RouterError::Config(format!(
                    "routing.default_providers names unknown provider '{}'",
                    provider
                )));
            }
        }

        for mode in self.routing.models.keys() {
            parse_mode_key(mode, "routing.models")?;
        }

        for (track, multipliers) in &self.classifier.track_multipliers {
            for mode in multipliers.keys() {
                parse_mode_key(mode, &format!("classifier.track_multipliers.{}", track))?;
            }
        }

        if let Some(id) = &self.cache.embedding_provider
            && !self.providers.contains_key(id)
        {
            return Err(RouterError::Config(format!(
                "cache.embedding_provider names unknown provider '{}'",
                id
            )));
        }

        Ok(())
    }
}

fn parse_mode_key(key: &str, section: &str) -> Result<Mode> {
    key.parse::<Mode>()
        .map_err(|e| RouterError::Config(format!("{}: {}", section, e)))
}

// =============================================================================
// Provider Configuration
// =============================================================================

/// Wire protocol spoken by a backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible Chat Completions (OpenAI, Gemini's compatibility endpoint)
    #[default]
    OpenAi,
    /// Anthropic Messages API
    Anthropic,
    /// Local Ollama server
    Ollama,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Ollama => write!(f, "ollama"),
        }
    }
}

/// One generation backend
///
/// Note: API keys are never serialized to output and are redacted in debug
/// output. Backends convert the key to `SecretString` at construction.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderEndpointConfig {
    pub kind: ProviderKind,

    /// API key; prefer `api_key_env`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    pub api_key_env: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model name prefixes this backend serves as-is
    pub native_prefixes: Vec<String>,

    /// Translation of foreign mode models into this backend's model family.
    /// Keys are matched exactly first, then as substrings.
    pub model_map: BTreeMap<String, String>,

    /// Model used when `model_map` has no match for a foreign model
    pub default_model: Option<String>,

    /// Use incremental streaming when available
    pub streaming: bool,

    pub enabled: bool,
}

impl std::fmt::Debug for ProviderEndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEndpointConfig")
            .field("kind", &self.kind)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .field("api_base", &self.api_base)
            .field("native_prefixes", &self.native_prefixes)
            .field("model_map", &self.model_map)
            .field("default_model", &self.default_model)
            .field("streaming", &self.streaming)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl Default for ProviderEndpointConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            api_key: None,
            api_key_env: None,
            api_base: None,
            native_prefixes: Vec::new(),
            model_map: BTreeMap::new(),
            default_model: None,
            streaming: true,
            enabled: true,
        }
    }
}

impl ProviderEndpointConfig {
    /// Resolve the API key from the inline value or the configured env var
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| {
                self.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|k| !k.is_empty())
            })
    }
}

fn default_providers() -> BTreeMap<String, ProviderEndpointConfig> {
    let mut providers = BTreeMap::new();

    providers.insert(
        "anthropic".to_string(),
        ProviderEndpointConfig {
            kind: ProviderKind::Anthropic,
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            native_prefixes: vec!["claude".to_string()],
            default_model: Some("claude-sonnet-4-5-20250929".to_string()),
            ..Default::default()
        },
    );

    providers.insert(
        "openai".to_string(),
        ProviderEndpointConfig {
            kind: ProviderKind::OpenAi,
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            native_prefixes: vec!["gpt".to_string(), "o1".to_string(), "o3".to_string()],
            default_model: Some("gpt-4o".to_string()),
            ..Default::default()
        },
    );

    let gemini_map: BTreeMap<String, String> = [
        ("gpt-4o", "gemini-2.5-pro"),
        ("gpt-4", "gemini-2.5-pro"),
        ("claude-sonnet-4-5-20250929", "gemini-2.5-flash"),
        ("sonnet", "gemini-2.5-flash"),
        ("claude-haiku-4-5-20251001", "gemini-2.0-flash"),
        ("haiku", "gemini-2.0-flash"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    providers.insert(
        "google_gemini".to_string(),
        ProviderEndpointConfig {
            kind: ProviderKind::OpenAi,
            api_key_env: Some("GEMINI_API_KEY".to_string()),
            api_base: Some(
                "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            ),
            native_prefixes: vec!["gemini".to_string()],
            model_map: gemini_map,
            default_model: Some("gemini-2.5-flash".to_string()),
            ..Default::default()
        },
    );

    providers
}

// =============================================================================
// Routing Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Ordered provider ids per mode
    pub modes: BTreeMap<String, Vec<String>>,

    /// Provider order for modes without an entry
    pub default_providers: Vec<String>,

    /// Preferred model per mode
    pub models: BTreeMap<String, String>,

    /// Model for modes without an entry
    pub default_model: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let order = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let primary_anthropic = order(&["anthropic", "openai", "google_gemini"]);
        let primary_gemini = order(&["google_gemini", "anthropic", "openai"]);

        let modes: BTreeMap<String, Vec<String>> = [
            ("coach", primary_anthropic.clone()),
            ("consultor", primary_gemini.clone()),
            ("sparring", primary_anthropic.clone()),
            ("cfo", order(&["openai", "anthropic", "google_gemini"])),
            ("fiscal", order(&["anthropic", "google_gemini"])),
            ("laboral", order(&["anthropic", "google_gemini"])),
            ("devil", primary_anthropic),
            ("landing_copilot", primary_gemini),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let sonnet = "claude-sonnet-4-5-20250929";
        let models: BTreeMap<String, String> = [
            ("coach", sonnet),
            ("consultor", "gemini-2.5-flash"),
            ("sparring", sonnet),
            ("cfo", "gpt-4o"),
            ("fiscal", sonnet),
            ("laboral", sonnet),
            ("devil", sonnet),
            ("landing_copilot", "gemini-2.5-flash"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            modes,
            default_providers: vec!["anthropic".to_string()],
            models,
            default_model: sonnet.to_string(),
        }
    }
}

// =============================================================================
// Circuit Breaker Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before a provider is skipped
    pub failure_threshold: u32,

    /// Seconds a tripped provider stays skipped
    pub cooldown_secs: u64,

    /// Write breaker state through to the state store
    pub durable: bool,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: cb_constants::FAILURE_THRESHOLD,
            cooldown_secs: cb_constants::COOLDOWN_SECS,
            durable: false,
        }
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Entry lifetime in seconds
    pub ttl_secs: u64,

    /// Enable the approximate-match tier
    pub semantic_enabled: bool,

    /// Minimum cosine similarity for a semantic hit
    pub similarity_threshold: f32,

    /// Provider id used to compute embeddings (OpenAI-compatible or Ollama)
    pub embedding_provider: Option<String>,

    /// Embedding model name
    pub embedding_model: String,

    /// Vector store collection name
    pub collection: String,

    /// Cost assumed per avoided generation call (USD)
    pub average_cost_per_call: f64,

    /// Maximum entries kept per tier before the oldest are evicted
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: cache_constants::DEFAULT_TTL_SECS,
            semantic_enabled: true,
            similarity_threshold: cache_constants::SIMILARITY_THRESHOLD,
            embedding_provider: None,
            embedding_model: "text-embedding-3-small".to_string(),
            collection: cache_constants::SEMANTIC_COLLECTION.to_string(),
            average_cost_per_call: cache_constants::AVERAGE_COST_PER_CALL,
            max_entries: cache_constants::MAX_ENTRIES,
        }
    }
}

// =============================================================================
// Classifier Configuration
// =============================================================================

/// Where the trigger table comes from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSourceKind {
    /// Built-in table only
    #[default]
    Builtin,
    /// `copilot_mode_triggers` table in the SQLite state database
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub trigger_source: TriggerSourceKind,

    /// Trigger table cache lifetime in seconds
    pub trigger_cache_ttl_secs: u64,

    /// Mode used when nothing scores above the floor
    pub fallback_mode: Mode,

    pub score_floor: f64,
    pub high_confidence_gap: f64,
    pub medium_confidence_gap: f64,
    pub emotion_threshold: f64,
    pub emotion_bonus: f64,
    pub punctuation_boost: f64,
    pub uppercase_boost: f64,

    /// Score multipliers per track (upper-case track name → mode → factor)
    pub track_multipliers: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let table = |entries: &[(&str, f64)]| {
            entries
                .iter()
                .map(|(m, f)| (m.to_string(), *f))
                .collect::<BTreeMap<_, _>>()
        };

        let track_multipliers = [
            ("IMPULSO", table(&[("coach", 1.3), ("consultor", 1.0)])),
            ("LANZADERA", table(&[("consultor", 1.2), ("cfo", 1.1)])),
            ("ACELERA", table(&[("cfo", 1.3), ("sparring", 1.2)])),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            trigger_source: TriggerSourceKind::Builtin,
            trigger_cache_ttl_secs: cls_constants::TRIGGER_CACHE_TTL_SECS,
            fallback_mode: Mode::Consultor,
            score_floor: cls_constants::SCORE_FLOOR,
            high_confidence_gap: cls_constants::HIGH_CONFIDENCE_GAP,
            medium_confidence_gap: cls_constants::MEDIUM_CONFIDENCE_GAP,
            emotion_threshold: cls_constants::EMOTION_THRESHOLD,
            emotion_bonus: cls_constants::EMOTION_BONUS,
            punctuation_boost: cls_constants::PUNCTUATION_BOOST,
            uppercase_boost: cls_constants::UPPERCASE_BOOST,
            track_multipliers,
        }
    }
}

// =============================================================================
// Stream Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Buffer length that always flushes
    pub max_chunk_chars: usize,

    /// Minimum buffer length for a punctuation flush
    pub min_flush_chars: usize,

    /// Bounded event channel capacity
    pub channel_capacity: usize,

    /// Redact PII in emitted chunks
    pub mask_pii: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: stream_constants::MAX_CHUNK_CHARS,
            min_flush_chars: stream_constants::MIN_FLUSH_CHARS,
            channel_capacity: stream_constants::EVENT_CHANNEL_CAPACITY,
            mask_pii: true,
        }
    }
}

// =============================================================================
// Usage Configuration
// =============================================================================

/// Price per 1K tokens (USD)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub enabled: bool,

    /// Latency samples kept per day
    pub max_latency_samples: usize,

    /// Days covered by the metrics summary
    pub summary_window_days: i64,

    /// Additional or overriding per-model prices
    pub prices: BTreeMap<String, ModelPrice>,

    /// Rate for models missing from the price table
    pub default_price: ModelPrice,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_latency_samples: usage_constants::MAX_LATENCY_SAMPLES_PER_DAY,
            summary_window_days: usage_constants::SUMMARY_WINDOW_DAYS,
            prices: BTreeMap::new(),
            default_price: ModelPrice {
                input: usage_constants::DEFAULT_PRICE_IN,
                output: usage_constants::DEFAULT_PRICE_OUT,
            },
        }
    }
}

// =============================================================================
// Storage Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// SQLite database path (sqlite backend only)
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            path: PathBuf::from(".copilot-router/state.db"),
        }
    }
}

// =============================================================================
// Timeout Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Generation call timeout
    pub request_secs: u64,

    /// Embedding and vector store timeout
    pub auxiliary_secs: u64,

    /// TCP connect timeout
    pub connect_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: network::DEFAULT_TIMEOUT_SECS,
            auxiliary_secs: network::AUXILIARY_TIMEOUT_SECS,
            connect_secs: network::CONNECTION_TIMEOUT_SECS,
        }
    }
}

// =============================================================================
// Prompt Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Maximum characters of context in the system prompt
    pub max_context_chars: usize,

    pub max_tokens: u32,

    pub temperature: f32,

    /// Numbered-list suggestions extracted per response
    pub max_suggestions: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_context_chars: prompt_constants::MAX_CONTEXT_CHARS,
            max_tokens: prompt_constants::DEFAULT_MAX_TOKENS,
            temperature: prompt_constants::DEFAULT_TEMPERATURE,
            max_suggestions: prompt_constants::MAX_SUGGESTIONS,
        }
    }
}
