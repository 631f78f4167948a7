//! Unified Error Type System
//!
//! Centralized error types for the router.
//! Distinguishes recoverable outcomes (advance to the next provider) from
//! terminal ones (answer with the static fallback response).
//!
//! ## Error Categories
//!
//! - **RateLimit**: API rate limiting
//! - **Auth**: Authentication failures
//! - **Network**: Connectivity issues and timeouts
//! - **Unavailable**: Provider down or circuit open
//! - **BadRequest**: Request rejected by the backend
//! - **Transient**: Temporary server-side issues
//!
//! Every category advances the provider iteration; the category is carried
//! for structured logging of each failed attempt.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Categories
// =============================================================================

/// Classification of a failed backend attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rate limited by the backend
    RateLimit,
    /// Authentication failed
    Auth,
    /// Network/connectivity issues or timeout
    Network,
    /// Provider unavailable
    Unavailable,
    /// Invalid request
    BadRequest,
    /// Temporary server issues
    Transient,
    /// Unknown error
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "RATE_LIMIT"),
            Self::Auth => write!(f, "AUTH"),
            Self::Network => write!(f, "NETWORK"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::BadRequest => write!(f, "BAD_REQUEST"),
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl ErrorCategory {
    /// Whether the provider itself is likely unhealthy (as opposed to the request)
    pub fn indicates_outage(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Unavailable | Self::Transient | Self::RateLimit
        )
    }
}

// =============================================================================
// Backend Failure
// =============================================================================

/// Categorized failure reported by a generation backend
#[derive(Debug, Clone)]
pub struct BackendFailure {
    /// Error category for logging and reporting
    pub category: ErrorCategory,
    /// Detailed error message
    pub message: String,
    /// Provider that produced the error
    pub provider: String,
    /// HTTP status, when the failure came from a response
    pub status: Option<u16>,
}

impl std::fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "[{}:{}] HTTP {}: {}",
                self.provider, self.category, status, self.message
            ),
            None => write!(f, "[{}:{}] {}", self.provider, self.category, self.message),
        }
    }
}

impl std::error::Error for BackendFailure {}

impl BackendFailure {
    pub fn new(
        category: ErrorCategory,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            provider: provider.into(),
            status: None,
        }
    }

    /// Attach the HTTP status of the failed response
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Error classifier for backend failures
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an error message from any provider
    pub fn classify(message: &str, provider: &str) -> BackendFailure {
        let lower = message.to_lowercase();

        let category = if lower.contains("rate limit")
            || lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
        {
            ErrorCategory::RateLimit
        } else if lower.contains("401")
            || lower.contains("403")
            || lower.contains("api key")
            || lower.contains("unauthorized")
            || lower.contains("permission denied")
        {
            ErrorCategory::Auth
        } else if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("dns")
            || lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("unreachable")
        {
            ErrorCategory::Network
        } else if lower.contains("503")
            || lower.contains("502")
            || lower.contains("service unavailable")
            || lower.contains("circuit open")
            || lower.contains("not found")
        {
            ErrorCategory::Unavailable
        } else if lower.contains("400") || lower.contains("bad request") || lower.contains("invalid")
        {
            ErrorCategory::BadRequest
        } else if lower.contains("500")
            || lower.contains("overloaded")
            || lower.contains("temporary")
            || lower.contains("internal")
        {
            ErrorCategory::Transient
        } else {
            ErrorCategory::Unknown
        };

        BackendFailure::new(category, message, provider)
    }

    /// Classify HTTP status code directly (more accurate than string matching)
    pub fn classify_http_status(status: u16, message: &str, provider: &str) -> BackendFailure {
        let category = match status {
            429 => ErrorCategory::RateLimit,
            401 | 403 => ErrorCategory::Auth,
            400 | 422 => ErrorCategory::BadRequest,
            404 | 503 => ErrorCategory::Unavailable,
            500 | 502 | 504 | 529 => ErrorCategory::Transient,
            _ => ErrorCategory::Unknown,
        };
        BackendFailure::new(category, message, provider).with_status(status)
    }

    /// Classify any router error raised while attempting a provider
    pub fn classify_router_error(err: &RouterError, provider: &str) -> BackendFailure {
        match err {
            RouterError::Backend(failure) => failure.clone(),
            RouterError::Timeout { .. } => {
                BackendFailure::new(ErrorCategory::Network, err.to_string(), provider)
            }
            RouterError::ProviderUnavailable { .. } => {
                BackendFailure::new(ErrorCategory::Unavailable, err.to_string(), provider)
            }
            RouterError::Http(e) if e.is_timeout() || e.is_connect() => {
                BackendFailure::new(ErrorCategory::Network, err.to_string(), provider)
            }
            other => Self::classify(&other.to_string(), provider),
        }
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum RouterError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // -------------------------------------------------------------------------
    // Routing Errors
    // -------------------------------------------------------------------------
    /// No providers configured for a mode, or invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Circuit open, or the call failed or timed out
    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    /// Every candidate for the mode is open or failed
    #[error("All providers exhausted for mode {mode}")]
    AllProvidersExhausted { mode: String },

    /// Categorized failure reported by a backend
    #[error("Backend error: {0}")]
    Backend(BackendFailure),

    /// Backend failed after streaming had started
    #[error("Stream from {provider} interrupted: {reason}")]
    StreamInterrupted { provider: String, reason: String },

    /// Operation timeout with context
    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// State store failure
    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Non-fatal Collaborator Errors
    // -------------------------------------------------------------------------
    /// Cache or state backend failure
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    /// Embedding could not be computed; semantic tier skipped
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<BackendFailure> for RouterError {
    fn from(err: BackendFailure) -> Self {
        RouterError::Backend(err)
    }
}

impl From<figment::Error> for RouterError {
    fn from(err: figment::Error) -> Self {
        RouterError::Config(format!("Configuration error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl RouterError {
    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a provider-unavailable error
    pub fn unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Check whether the orchestrator should advance to the next provider
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. }
                | Self::StreamInterrupted { .. }
                | Self::Backend(_)
                | Self::Timeout { .. }
                | Self::Http(_)
                | Self::Json(_)
        )
    }
}

// =============================================================================
// Result Extension
// =============================================================================

/// Extension trait for adding context to foreign errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Add context using a closure (lazy evaluation)
    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| RouterError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| RouterError::Storage(format!("{}: {}", f().into(), e)))
    }
}

// =============================================================================
// Tests
// =============================================================================
