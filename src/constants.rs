//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// Mode classifier constants
pub mod classifier {
    /// Top score below this forces the fallback mode
    pub const SCORE_FLOOR: f64 = 5.0;

    /// Gap to runner-up above this yields `high` confidence
    pub const HIGH_CONFIDENCE_GAP: f64 = 10.0;

    /// Gap to runner-up above this yields `medium` confidence
    pub const MEDIUM_CONFIDENCE_GAP: f64 = 5.0;

    /// Emotion intensity above this boosts the empathetic mode
    pub const EMOTION_THRESHOLD: f64 = 0.7;

    /// Score added to the empathetic mode on strong emotion
    pub const EMOTION_BONUS: f64 = 15.0;

    /// Intensity added for repeated `!`/`¡`
    pub const PUNCTUATION_BOOST: f64 = 0.1;

    /// Intensity added for long uppercase runs
    pub const UPPERCASE_BOOST: f64 = 0.1;

    /// Trigger table cache lifetime (seconds)
    pub const TRIGGER_CACHE_TTL_SECS: u64 = 3600;
}

/// Circuit breaker constants
pub mod circuit_breaker {
    /// Number of consecutive failures before opening circuit
    pub const FAILURE_THRESHOLD: u32 = 5;

    /// Duration a circuit stays open before the provider is offered again (seconds)
    pub const COOLDOWN_SECS: u64 = 300;
}

/// Response cache constants
pub mod cache {
    /// Default entry lifetime (seconds)
    pub const DEFAULT_TTL_SECS: u64 = 3600;

    /// Minimum cosine similarity for a semantic hit
    pub const SIMILARITY_THRESHOLD: f32 = 0.92;

    /// Average cost of one generation call, used for savings estimates (USD)
    pub const AVERAGE_COST_PER_CALL: f64 = 0.002;

    /// Vector store collection for cached responses
    pub const SEMANTIC_COLLECTION: &str = "copilot_response_cache";

    /// Entry cap per tier; the oldest entries are evicted beyond it
    pub const MAX_ENTRIES: usize = 10_000;
}

/// Stream buffer constants
pub mod stream {
    /// Buffer length that always triggers a flush (characters)
    pub const MAX_CHUNK_CHARS: usize = 80;

    /// Minimum buffer length for a punctuation-triggered flush (characters)
    pub const MIN_FLUSH_CHARS: usize = 15;

    /// Event channel capacity between the generation task and the consumer
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}

/// Usage tracking constants
pub mod usage {
    /// Latency samples kept per day
    pub const MAX_LATENCY_SAMPLES_PER_DAY: usize = 1000;

    /// Days covered by the metrics summary
    pub const SUMMARY_WINDOW_DAYS: i64 = 7;

    /// Price per 1K input tokens for unknown models (USD)
    pub const DEFAULT_PRICE_IN: f64 = 0.001;

    /// Price per 1K output tokens for unknown models (USD)
    pub const DEFAULT_PRICE_OUT: f64 = 0.004;
}

/// Prompt assembly constants
pub mod prompt {
    /// Maximum characters of context injected into the system prompt
    pub const MAX_CONTEXT_CHARS: usize = 8000;

    /// Default generation limit
    pub const DEFAULT_MAX_TOKENS: u32 = 2048;

    /// Default sampling temperature
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;

    /// Number of numbered-list suggestions extracted from a response
    pub const MAX_SUGGESTIONS: usize = 3;
}

/// HTTP/Network constants
pub mod network {
    /// Default backend request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

    /// Embedding and vector store timeout (seconds)
    pub const AUXILIARY_TIMEOUT_SECS: u64 = 5;

    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 10;
}
