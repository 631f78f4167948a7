//! copilot-router - Mode-Aware LLM Request Router
//!
//! Routes conversational requests from an entrepreneurship copilot to a set of
//! interchangeable generation backends.
//!
//! ## Core Features
//!
//! - **Mode Classification**: weighted trigger phrases, track multipliers and an emotion bonus
//! - **Failover Routing**: ordered providers per mode, guarded by per-provider circuit breakers
//! - **Two-Tier Cache**: exact SHA-256 keys plus an optional embedding-similarity tier
//! - **Safe Streaming**: ordered, PII-masked chunks with a single terminal event
//! - **Usage Tracking**: tokens, cost, latency percentiles and failover rates
//!
//! ## Quick Start
//!
//! ```ignore
//! use copilot_router::{ChatRequest, ConfigLoader, Mode, Orchestrator};
//!
//! let config = ConfigLoader::load()?;
//! let orchestrator = Orchestrator::from_config(&config)?;
//! let response = orchestrator
//!     .chat(&ChatRequest::new("¿Cuándo presento el IVA?").with_mode(Mode::Fiscal))
//!     .await;
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: classifier, provider routing, cache, streaming, usage, orchestrator
//! - [`storage`]: key/value state store (in-memory or SQLite)
//! - [`config`]: layered configuration
//! - [`types`]: request/response types and errors

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod storage;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::error::{ErrorCategory, Result, RouterError};

// Request/response
pub use types::{CacheLayer, ChatContext, ChatRequest, ChatResponse, Confidence, Mode, ModeDecision};

// Storage
pub use storage::{MemoryStateStore, SharedStateStore, StateStore};

// =============================================================================
// AI Re-exports
// =============================================================================

pub use ai::{
    ChatBackend, ChatStream, ModeClassifier, Orchestrator, OrchestratorBuilder, ProviderRouter,
    ResponseCache, StreamEvent, StreamingMode, UsageTracker,
};
