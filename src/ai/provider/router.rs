//! Mode-aware Provider Router
//!
//! Orders backends per mode and filters out those whose circuit is open.
//!
//! ## Strategy
//!
//! 1. Look up the ordered candidate list for the mode (or the default route)
//! 2. Drop every candidate the breaker table reports as open
//! 3. Resolve the mode's preferred model into each endpoint's model family
//!
//! The router never calls a backend itself; the orchestrator walks the
//! returned list and re-checks the breaker right before each attempt.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::circuit_breaker::{CircuitBreakers, SharedCircuitBreakers};
use crate::config::{Config, ProviderEndpointConfig};
use crate::types::{Mode, Result, RouterError};

// =============================================================================
// Provider Endpoint
// =============================================================================

/// Routing view of one configured backend
#[derive(Debug, Clone, Default)]
pub struct ProviderEndpoint {
    pub id: String,
    /// Model name prefixes passed through unchanged
    pub native_prefixes: Vec<String>,
    /// Foreign model (exact key, then substring key) to native model
    pub model_map: BTreeMap<String, String>,
    pub default_model: Option<String>,
}

impl ProviderEndpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn from_config(id: &str, config: &ProviderEndpointConfig) -> Self {
        Self {
            id: id.to_string(),
            native_prefixes: config.native_prefixes.clone(),
            model_map: config.model_map.clone(),
            default_model: config.default_model.clone(),
        }
    }

    pub fn with_native_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.native_prefixes.push(prefix.into());
        self
    }

    pub fn with_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_map.insert(from.into(), to.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Translate a mode's preferred model into this endpoint's family
    pub fn resolve_model(&self, model: &str) -> String {
        if self
            .native_prefixes
            .iter()
            .any(|prefix| model.starts_with(prefix.as_str()))
        {
            return model.to_string();
        }

        if let Some(mapped) = self.model_map.get(model) {
            return mapped.clone();
        }

        // Longest substring key wins so "gpt-4o" beats "gpt-4"
        let substring_match = self
            .model_map
            .iter()
            .filter(|(key, _)| model.contains(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, mapped)| mapped.clone());

        substring_match
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| model.to_string())
    }
}

// =============================================================================
// Provider Router
// =============================================================================

/// Shared router handle
pub type SharedRouter = Arc<ProviderRouter>;

pub struct ProviderRouter {
    endpoints: BTreeMap<String, ProviderEndpoint>,
    routes: HashMap<Mode, Vec<String>>,
    default_route: Vec<String>,
    models: HashMap<Mode, String>,
    default_model: String,
    breakers: SharedCircuitBreakers,
}

impl std::fmt::Debug for ProviderRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRouter")
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .field("routes", &self.routes)
            .field("default_route", &self.default_route)
            .field("models", &self.models)
            .field("default_model", &self.default_model)
            .finish()
    }
}

impl ProviderRouter {
    pub fn builder() -> ProviderRouterBuilder {
        ProviderRouterBuilder::default()
    }

    /// Build from the `providers` and `routing` configuration sections
    pub fn from_config(config: &Config, breakers: SharedCircuitBreakers) -> Result<Self> {
        let mut builder = Self::builder()
            .breakers(breakers)
            .default_route(config.routing.default_providers.clone())
            .default_model(config.routing.default_model.clone());

        for (id, endpoint) in &config.providers {
            builder = builder.endpoint(ProviderEndpoint::from_config(id, endpoint));
        }

        for (key, providers) in &config.routing.modes {
            let mode = parse_mode(key)?;
            builder = builder.route(mode, providers.clone());
        }

        for (key, model) in &config.routing.models {
            let mode = parse_mode(key)?;
            builder = builder.model(mode, model.clone());
        }

        Ok(builder.build())
    }

    /// Configured order for a mode, before breaker filtering
    pub fn candidates(&self, mode: Mode) -> Result<Vec<String>> {
        let route = self
            .routes
            .get(&mode)
            .filter(|route| !route.is_empty())
            .unwrap_or(&self.default_route);

        if route.is_empty() {
            return Err(RouterError::Configuration(format!(
                "No providers configured for mode {}",
                mode
            )));
        }
        Ok(route.clone())
    }

    /// Ordered candidates for a mode with open circuits filtered out
    pub fn select_next(&self, mode: Mode) -> Result<Vec<String>> {
        let candidates = self.candidates(mode)?;
        let total = candidates.len();

        let available: Vec<String> = candidates
            .into_iter()
            .filter(|provider| {
                let open = self.breakers.is_open(provider);
                if open {
                    debug!(provider = %provider, mode = %mode, "Skipping provider (circuit OPEN)");
                }
                !open
            })
            .collect();

        if available.is_empty() {
            return Err(RouterError::AllProvidersExhausted {
                mode: mode.to_string(),
            });
        }

        debug!(
            mode = %mode,
            available = available.len(),
            configured = total,
            "Selected provider candidates"
        );
        Ok(available)
    }

    /// Whether a provider may be attempted right now
    pub fn is_available(&self, provider: &str) -> bool {
        !self.breakers.is_open(provider)
    }

    /// Preferred model for a mode
    pub fn model_for(&self, mode: Mode) -> &str {
        self.models
            .get(&mode)
            .map(|m| m.as_str())
            .unwrap_or(&self.default_model)
    }

    /// Model to request from `provider` when serving `mode`
    pub fn resolve_model(&self, provider: &str, mode: Mode) -> String {
        let preferred = self.model_for(mode);
        match self.endpoints.get(provider) {
            Some(endpoint) => endpoint.resolve_model(preferred),
            None => preferred.to_string(),
        }
    }

    pub fn breakers(&self) -> &SharedCircuitBreakers {
        &self.breakers
    }

    pub fn endpoint(&self, provider: &str) -> Option<&ProviderEndpoint> {
        self.endpoints.get(provider)
    }
}

fn parse_mode(key: &str) -> Result<Mode> {
    key.parse::<Mode>().map_err(RouterError::Configuration)
}

// =============================================================================
// Builder
// =============================================================================

#[derive(Default)]
pub struct ProviderRouterBuilder {
    endpoints: BTreeMap<String, ProviderEndpoint>,
    routes: HashMap<Mode, Vec<String>>,
    default_route: Vec<String>,
    models: HashMap<Mode, String>,
    default_model: Option<String>,
    breakers: Option<SharedCircuitBreakers>,
}

impl ProviderRouterBuilder {
    pub fn endpoint(mut self, endpoint: ProviderEndpoint) -> Self {
        self.endpoints.insert(endpoint.id.clone(), endpoint);
        self
    }

    pub fn route<I, S>(mut self, mode: Mode, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes
            .insert(mode, providers.into_iter().map(Into::into).collect());
        self
    }

    pub fn default_route<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_route = providers.into_iter().map(Into::into).collect();
        self
    }

    pub fn model(mut self, mode: Mode, model: impl Into<String>) -> Self {
        self.models.insert(mode, model.into());
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn breakers(mut self, breakers: SharedCircuitBreakers) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn build(self) -> ProviderRouter {
        ProviderRouter {
            endpoints: self.endpoints,
            routes: self.routes,
            default_route: self.default_route,
            models: self.models,
            default_model: self
                .default_model
                .unwrap_or_else(|| crate::config::RoutingConfig::default().default_model),
            breakers: self
                .breakers
                .unwrap_or_else(|| Arc::new(CircuitBreakers::with_defaults())),
        }
    }
}
