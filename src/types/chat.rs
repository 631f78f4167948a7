//! Request and response types shared by the orchestrator, cache and CLI.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::mode::{Mode, ModeDecision};

/// Context keys that participate in cache keys and semantic filters
pub const STABLE_CONTEXT_KEYS: [&str; 3] = ["tenant", "track", "phase"];

/// Per-request context (tenant id, track, phase, profile fields...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatContext(BTreeMap<String, String>);

impl ChatContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Non-empty value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn tenant(&self) -> Option<&str> {
        self.get("tenant")
    }

    /// Entrepreneur track; `carril` is accepted as an alias
    pub fn track(&self) -> Option<&str> {
        self.get("track").or_else(|| self.get("carril"))
    }

    pub fn phase(&self) -> Option<&str> {
        self.get("phase")
    }

    /// Deterministic `key=value` rendering of the stable subset
    pub fn stable_fingerprint(&self) -> String {
        STABLE_CONTEXT_KEYS
            .iter()
            .map(|key| {
                let value = match *key {
                    "track" => self.track(),
                    other => self.get(other),
                };
                format!("{}={}", key, value.unwrap_or(""))
            })
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ChatContext {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Incoming conversational request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Explicit mode; classified when absent
    pub mode: Option<Mode>,
    #[serde(default)]
    pub context: ChatContext,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            mode: None,
            context: ChatContext::default(),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_context(mut self, context: ChatContext) -> Self {
        self.context = context;
        self
    }
}

/// Tier that served a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayer {
    Exact,
    Semantic,
    #[default]
    None,
}

impl std::fmt::Display for CacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheLayer::Exact => write!(f, "exact"),
            CacheLayer::Semantic => write!(f, "semantic"),
            CacheLayer::None => write!(f, "none"),
        }
    }
}

/// Final response of a buffered chat call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    pub mode: Mode,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub cache_layer: CacheLayer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
    /// Set only on the static fallback response
    #[serde(default)]
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_decision: Option<ModeDecision>,
}

impl ChatResponse {
    /// Mark as served from a cache tier
    pub fn into_cached(mut self, layer: CacheLayer, similarity: Option<f32>) -> Self {
        self.from_cache = true;
        self.cache_layer = layer;
        self.similarity_score = similarity;
        self
    }

    /// Copy stripped of per-request fields, as stored in the cache
    pub fn cacheable(&self) -> Self {
        Self {
            from_cache: false,
            cache_layer: CacheLayer::None,
            similarity_score: None,
            mode_decision: None,
            ..self.clone()
        }
    }
}
