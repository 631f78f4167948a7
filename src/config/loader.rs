//! Configuration Loader (Figment-based)
//!
//! Loads and merges configuration from multiple sources using Figment:
//! 1. Built-in defaults (Serialized)
//! 2. Global config (~/.config/copilot-router/config.toml)
//! 3. Project config (.copilot-router/config.toml)
//! 4. Environment variables (COPILOT_ROUTER_* prefix)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::Config;
use crate::types::{Result, RouterError};

const APP_DIR: &str = "copilot-router";
const ENV_PREFIX: &str = "COPILOT_ROUTER_";

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with full resolution chain:
    /// defaults → global → project → env vars
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment().extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Layered figment without extraction (used by `config show`)
    pub fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Loading global config from: {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        let project_path = Self::project_config_path();
        if project_path.exists() {
            debug!("Loading project config from: {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        // COPILOT_ROUTER_CIRCUIT_BREAKER__COOLDOWN_SECS -> circuit_breaker.cooldown_secs
        figment.merge(Env::prefixed(ENV_PREFIX).split("__").lowercase(true))
    }

    /// Load configuration from a specific file only
    pub fn load_from_file(path: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    // =========================================================================
    // Path Management
    // =========================================================================

    /// Get path to global config directory (~/.config/copilot-router/)
    pub fn global_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()))
            .map(|p| p.join(APP_DIR))
    }

    /// Get path to global config file
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_dir().map(|dir| dir.join("config.toml"))
    }

    /// Get path to project config file
    pub fn project_config_path() -> PathBuf {
        Self::project_dir().join("config.toml")
    }

    /// Get project data directory
    pub fn project_dir() -> PathBuf {
        PathBuf::from(format!(".{}", APP_DIR))
    }

    // =========================================================================
    // Config Commands
    // =========================================================================

    /// Render the effective configuration as TOML, JSON or YAML
    pub fn render(config: &Config, format: &str) -> Result<String> {
        match format {
            "json" => Ok(serde_json::to_string_pretty(config)?),
            "yaml" => serde_yaml::to_string(config).map_err(|e| RouterError::Config(e.to_string())),
            _ => toml::to_string_pretty(config).map_err(|e| RouterError::Config(e.to_string())),
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Write a starter config file, globally or for the current project.
    /// Existing files are kept unless `force` is set.
    pub fn init(global: bool, force: bool) -> Result<PathBuf> {
        let config_path = if global {
            Self::global_config_path().ok_or_else(|| {
                RouterError::Config("Cannot determine global config directory".to_string())
            })?
        } else {
            Self::project_config_path()
        };

        if let Some(dir) = config_path.parent() {
            fs::create_dir_all(dir)?;
        }

        if !config_path.exists() || force {
            fs::write(&config_path, Self::default_config_template())?;
            info!("Created config: {}", config_path.display());
        } else {
            info!("Config exists: {}", config_path.display());
        }

        Ok(config_path)
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn default_config_template() -> String {
        r#"# copilot-router configuration
# Project settings in .copilot-router/config.toml override the global file.
# Environment overrides: COPILOT_ROUTER_<SECTION>__<KEY>, e.g.
#   COPILOT_ROUTER_CIRCUIT_BREAKER__COOLDOWN_SECS=120

version = "1.0"

[circuit_breaker]
failure_threshold = 5
cooldown_secs = 300
durable = false

[cache]
enabled = true
ttl_secs = 3600
semantic_enabled = true
similarity_threshold = 0.92
# embedding_provider = "openai"

[storage]
backend = "memory"   # or "sqlite"
path = ".copilot-router/state.db"

[timeouts]
request_secs = 60

[routing]
default_providers = ["anthropic"]

[routing.modes]
coach = ["anthropic", "openai", "google_gemini"]
cfo = ["openai", "anthropic", "google_gemini"]
"#
        .to_string()
    }
}
