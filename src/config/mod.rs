//! Configuration Management
//!
//! Unified configuration system with hierarchical resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/copilot-router/config.toml)
//! 3. Project config (.copilot-router/config.toml)
//! 4. Environment variables (COPILOT_ROUTER_*, nested keys split on `__`)
//! 5. CLI arguments (highest priority)

mod loader;
mod types;

pub use loader::ConfigLoader;
pub use types::*;
