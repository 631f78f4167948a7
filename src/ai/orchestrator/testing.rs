//! Scripted backends and a wired orchestrator for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::Orchestrator;
use crate::ai::cache::ResponseCache;
use crate::ai::provider::{
    ChatBackend, CircuitBreakers, FragmentStream, Generation, GenerationOptions, ProviderRouter,
    SharedCircuitBreakers, TokenUsage,
};
use crate::ai::timeout::Timeouts;
use crate::ai::usage::UsageTracker;
use crate::config::{CacheConfig, RoutingConfig, UsageConfig};
use crate::storage::MemoryStateStore;
use crate::types::{Mode, Result, RouterError};

/// Backend replaying a fixed script.
///
/// Clones share their counters.
#[derive(Clone)]
pub struct MockBackend {
    name: String,
    text: String,
    fragments: Option<Vec<String>>,
    fail_after: Option<usize>,
    failures_left: Arc<AtomicUsize>,
    delay: Duration,
    usage: Option<TokenUsage>,
    calls: Arc<AtomicUsize>,
    yielded: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            text: String::new(),
            fragments: None,
            fail_after: None,
            failures_left: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            usage: None,
            calls: Arc::new(AtomicUsize::new(0)),
            yielded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Buffered-only backend answering `text`
    pub fn reply(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Streaming backend yielding `fragments`
    pub fn fragments(mut self, fragments: &[&str]) -> Self {
        self.text = fragments.concat();
        self.fragments = Some(fragments.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Stream breaks after `n` fragments
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Every call fails
    pub fn failing(self) -> Self {
        self.fail_times(usize::MAX)
    }

    /// The first `n` calls fail
    pub fn fail_times(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Delay before answering, and between fragments
    pub fn delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.usage = Some(TokenUsage::new(input_tokens, output_tokens));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fragments_yielded(&self) -> usize {
        self.yielded.load(Ordering::SeqCst)
    }

    fn begin_call(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RouterError::unavailable(&self.name, "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        self.fragments.is_some()
    }

    async fn chat(
        &self,
        _system_prompt: &str,
        _message: &str,
        _model: &str,
        _options: &GenerationOptions,
    ) -> Result<Generation> {
        self.begin_call()?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut generation = Generation::new(self.text.clone());
        if let Some(usage) = self.usage {
            generation = generation.with_usage(usage);
        }
        Ok(generation)
    }

    async fn stream(
        &self,
        _system_prompt: &str,
        _message: &str,
        _model: &str,
        _options: &GenerationOptions,
    ) -> Result<FragmentStream> {
        self.begin_call()?;
        let fragments = self.fragments.clone().unwrap_or_default();
        let cut = self.fail_after.unwrap_or(fragments.len()).min(fragments.len());

        let mut items: Vec<Result<String>> = fragments.into_iter().take(cut).map(Ok).collect();
        if self.fail_after.is_some() {
            items.push(Err(RouterError::unavailable(&self.name, "connection reset")));
        }

        let delay = self.delay;
        let yielded = self.yielded.clone();
        let stream = futures::stream::iter(items).then(move |item| {
            let yielded = yielded.clone();
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yielded.fetch_add(1, Ordering::SeqCst);
                item
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Orchestrator over mock backends and an in-memory store
pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStateStore>,
}

impl Fixture {
    /// Route every mode through `backends` in order
    pub fn new(backends: Vec<MockBackend>) -> Self {
        let route: Vec<String> = backends.iter().map(|b| b.name.clone()).collect();
        Self::build(backends, route, Timeouts::default(), None, true)
    }

    pub fn with_route(backends: Vec<MockBackend>, route: &[&str]) -> Self {
        let route = route.iter().map(|s| s.to_string()).collect();
        Self::build(backends, route, Timeouts::default(), None, true)
    }

    pub fn with_timeouts(backends: Vec<MockBackend>, timeouts: Timeouts) -> Self {
        let route: Vec<String> = backends.iter().map(|b| b.name.clone()).collect();
        Self::build(backends, route, timeouts, None, true)
    }

    /// Custom breaker table; the cache is disabled so every call reaches a backend
    pub fn with_breakers(backends: Vec<MockBackend>, breakers: SharedCircuitBreakers) -> Self {
        let route: Vec<String> = backends.iter().map(|b| b.name.clone()).collect();
        Self::build(backends, route, Timeouts::default(), Some(breakers), false)
    }

    fn build(
        backends: Vec<MockBackend>,
        route: Vec<String>,
        timeouts: Timeouts,
        breakers: Option<SharedCircuitBreakers>,
        cache_enabled: bool,
    ) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        let routing = RoutingConfig::default();

        let mut router = ProviderRouter::builder()
            .default_route(route)
            .default_model(routing.default_model.clone())
            .breakers(breakers.unwrap_or_else(|| Arc::new(CircuitBreakers::with_defaults())));
        for (key, model) in &routing.models {
            if let Ok(mode) = key.parse::<Mode>() {
                router = router.model(mode, model.clone());
            }
        }

        let cache_config = CacheConfig {
            enabled: cache_enabled,
            ..CacheConfig::default()
        };

        let mut builder = Orchestrator::builder(router.build())
            .cache(ResponseCache::new(&cache_config, store.clone()))
            .usage(UsageTracker::new(store.clone(), &UsageConfig::default()))
            .timeouts(timeouts);
        for backend in backends {
            builder = builder.backend(Arc::new(backend));
        }

        Self {
            orchestrator: builder.build(),
            store,
        }
    }
}
