//! Response Cache
//!
//! Two tiers, consulted in order:
//!
//! 1. **Exact**: SHA-256 over the normalized message, mode and stable context
//!    (`tenant`, `track`, `phase`), expiring after the entry TTL
//! 2. **Semantic**: nearest neighbour of the message embedding within the
//!    same `{mode, tenant}`, accepted at or above the similarity threshold
//!
//! The semantic tier is optional and best-effort: embedding and vector store
//! failures are logged and treated as a miss. Error responses are never stored.
//!
//! Both tiers are bounded by `max_entries`; expired entries are swept as new
//! ones arrive and the oldest are evicted past the cap.

mod exact;
mod semantic;

pub use exact::{ExactCache, ExactEntry, cache_key};
pub use semantic::{
    EXPIRES_AT_FIELD, InMemoryVectorStore, SharedVectorStore, VectorFilter, VectorHit,
    VectorStore, cosine_similarity,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ai::timeout::{Timeouts, with_timeout};
use crate::config::CacheConfig;
use crate::storage::SharedStateStore;
use crate::types::{
    CacheLayer, ChatContext, ChatResponse, Mode, Result, RouterError, SharedClock,
    log_filter_warn, system_clock,
};

const HITS_KEY: &str = "cache_hits";
const MISSES_KEY: &str = "cache_misses";

/// Tenant tag used when the context carries none
const GLOBAL_TENANT: &str = "global";

// =============================================================================
// Embedding Provider
// =============================================================================

/// Text → vector collaborator for the semantic tier
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Shared embedding provider handle
pub type SharedEmbeddingProvider = Arc<dyn EmbeddingProvider>;

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before any lookup
    pub hit_rate: f64,
    /// Live exact-tier entries
    pub entries: usize,
    /// Estimated USD saved by avoided generation calls
    pub estimated_savings: f64,
}

impl CacheStats {
    pub fn summary(&self) -> String {
        format!(
            "{} hits, {} misses ({:.1}% hit rate), {} entries, ~${:.4} saved",
            self.hits,
            self.misses,
            self.hit_rate * 100.0,
            self.entries,
            self.estimated_savings
        )
    }
}

// =============================================================================
// Response Cache
// =============================================================================

struct SemanticTier {
    embedder: SharedEmbeddingProvider,
    vectors: SharedVectorStore,
}

/// Shared response cache handle
pub type SharedResponseCache = Arc<ResponseCache>;

pub struct ResponseCache {
    enabled: bool,
    ttl: Duration,
    similarity_threshold: f32,
    collection: String,
    average_cost_per_call: f64,
    auxiliary_timeout: std::time::Duration,
    exact: ExactCache,
    semantic: Option<SemanticTier>,
    store: SharedStateStore,
    clock: SharedClock,
}

impl ResponseCache {
    /// Exact tier only
    pub fn new(config: &CacheConfig, store: SharedStateStore) -> Self {
        Self {
            enabled: config.enabled,
            ttl: Duration::seconds(config.ttl_secs as i64),
            similarity_threshold: config.similarity_threshold,
            collection: config.collection.clone(),
            average_cost_per_call: config.average_cost_per_call,
            auxiliary_timeout: Timeouts::default().auxiliary,
            exact: ExactCache::with_capacity(config.max_entries),
            semantic: None,
            store,
            clock: system_clock(),
        }
    }

    /// Enable the semantic tier
    pub fn with_semantic(mut self, embedder: SharedEmbeddingProvider, vectors: SharedVectorStore) -> Self {
        self.semantic = Some(SemanticTier { embedder, vectors });
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Bound for embedding and vector store calls
    pub fn with_auxiliary_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.auxiliary_timeout = timeout;
        self
    }

    pub fn has_semantic_tier(&self) -> bool {
        self.semantic.is_some()
    }

    /// Look up a response, exact tier first.
    ///
    /// Hits come back marked with their tier; lookups update the hit/miss
    /// counters.
    pub async fn get(&self, message: &str, mode: Mode, context: &ChatContext) -> Option<ChatResponse> {
        if !self.enabled {
            return None;
        }
        let now = self.clock.now();
        let key = cache_key(message, mode, context);

        if let Some(response) = self.exact.get(&key, now) {
            debug!(mode = %mode, "Exact cache hit");
            self.count(HITS_KEY);
            return Some(response.into_cached(CacheLayer::Exact, None));
        }

        if let Some(tier) = &self.semantic {
            match self.semantic_lookup(tier, message, mode, context, now).await {
                Ok(Some((response, score))) => {
                    debug!(mode = %mode, similarity = score, "Semantic cache hit");
                    self.count(HITS_KEY);
                    return Some(response.into_cached(CacheLayer::Semantic, Some(score)));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Semantic cache lookup skipped"),
            }
        }

        self.count(MISSES_KEY);
        None
    }

    async fn semantic_lookup(
        &self,
        tier: &SemanticTier,
        message: &str,
        mode: Mode,
        context: &ChatContext,
        now: DateTime<Utc>,
    ) -> Result<Option<(ChatResponse, f32)>> {
        let vector = self.embed(tier, message).await?;
        let filter = scope_filter(mode, context);
        let hits = with_timeout(
            self.auxiliary_timeout,
            tier.vectors.search(
                &self.collection,
                &vector,
                &filter,
                1,
                self.similarity_threshold,
            ),
            "vector search",
        )
        .await
        .map_err(|e| RouterError::CacheBackend(e.to_string()))?;

        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        let point: SemanticPayload = serde_json::from_value(hit.payload)
            .map_err(|e| RouterError::CacheBackend(format!("malformed semantic entry: {}", e)))?;

        if now >= point.cached_at + Duration::seconds(point.ttl as i64) {
            debug!(id = %hit.id, "Semantic entry expired");
            return Ok(None);
        }
        Ok(Some((point.response, hit.score)))
    }

    async fn embed(&self, tier: &SemanticTier, text: &str) -> Result<Vec<f32>> {
        with_timeout(self.auxiliary_timeout, tier.embedder.embed(text), "embedding")
            .await
            .map_err(|e| match e {
                RouterError::EmbeddingUnavailable(_) => e,
                other => RouterError::EmbeddingUnavailable(other.to_string()),
            })
    }

    /// Store a response with the configured TTL
    pub async fn set(&self, message: &str, mode: Mode, context: &ChatContext, response: &ChatResponse) {
        self.set_with_ttl(message, mode, context, response, self.ttl).await;
    }

    /// Store a response. Error responses are ignored.
    pub async fn set_with_ttl(
        &self,
        message: &str,
        mode: Mode,
        context: &ChatContext,
        response: &ChatResponse,
        ttl: Duration,
    ) {
        if !self.enabled || response.error {
            return;
        }
        let now = self.clock.now();
        let key = cache_key(message, mode, context);
        let stored = response.cacheable();
        let tenant = context.tenant().unwrap_or(GLOBAL_TENANT);

        self.exact.insert(
            key.clone(),
            ExactEntry {
                response: stored.clone(),
                cached_at: now,
                ttl,
                tags: vec![format!("mode:{}", mode), format!("tenant:{}", tenant)],
            },
        );

        if let Some(tier) = &self.semantic {
            let payload = SemanticPayload {
                mode: mode.to_string(),
                tenant: tenant.to_string(),
                response: stored,
                cached_at: now,
                ttl: ttl.num_seconds().max(0) as u64,
                expires_at: now + ttl,
            };
            if let Err(e) = self.semantic_store(tier, &key, message, payload).await {
                warn!(error = %e, "Semantic cache write skipped");
            }
        }
    }

    async fn semantic_store(
        &self,
        tier: &SemanticTier,
        id: &str,
        message: &str,
        payload: SemanticPayload,
    ) -> Result<()> {
        let vector = self.embed(tier, message).await?;
        let payload = serde_json::to_value(payload)?;
        with_timeout(
            self.auxiliary_timeout,
            tier.vectors.upsert(&self.collection, id, vector, payload),
            "vector upsert",
        )
        .await
        .map_err(|e| RouterError::CacheBackend(e.to_string()))
    }

    /// Remove entries tagged `tag` (`mode:<mode>` or `tenant:<id>`).
    ///
    /// Returns the number of exact-tier entries removed.
    pub async fn invalidate(&self, tag: &str) -> usize {
        let removed = self.exact.invalidate_tag(tag);

        if let Some(tier) = &self.semantic
            && let Some((field, value)) = tag.split_once(':')
        {
            let filter = VectorFilter::from([(field.to_string(), value.to_string())]);
            self.semantic_delete(tier, &filter).await;
        }
        debug!(tag = %tag, removed, "Cache invalidated");
        removed
    }

    /// Clear both tiers
    pub async fn invalidate_all(&self) {
        self.exact.clear();
        if let Some(tier) = &self.semantic {
            self.semantic_delete(tier, &VectorFilter::new()).await;
        }
    }

    async fn semantic_delete(&self, tier: &SemanticTier, filter: &VectorFilter) {
        let result = with_timeout(
            self.auxiliary_timeout,
            tier.vectors.delete_by_filter(&self.collection, filter),
            "vector delete",
        )
        .await;
        log_filter_warn(result, "Semantic cache invalidation failed");
    }

    /// `hits × average_cost_per_call`
    pub fn estimate_savings(&self, hits: u64) -> f64 {
        hits as f64 * self.average_cost_per_call.max(0.0)
    }

    pub fn stats(&self) -> CacheStats {
        let read = |key: &str| {
            log_filter_warn(self.store.get_i64(key), "Cache counter read failed")
                .unwrap_or(0)
                .max(0) as u64
        };
        let hits = read(HITS_KEY);
        let misses = read(MISSES_KEY);
        let total = hits + misses;
        self.exact.purge_expired(self.clock.now());

        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            entries: self.exact.len(),
            estimated_savings: self.estimate_savings(hits),
        }
    }

    fn count(&self, key: &str) {
        log_filter_warn(self.store.increment(key, 1), "Cache counter update failed");
    }
}

/// Payload stored alongside each semantic-tier vector
#[derive(Debug, Serialize, Deserialize)]
struct SemanticPayload {
    mode: String,
    tenant: String,
    response: ChatResponse,
    cached_at: DateTime<Utc>,
    ttl: u64,
    /// Read by stores that prune expired points (see [`semantic::EXPIRES_AT_FIELD`])
    expires_at: DateTime<Utc>,
}

fn scope_filter(mode: Mode, context: &ChatContext) -> VectorFilter {
    VectorFilter::from([
        ("mode".to_string(), mode.to_string()),
        (
            "tenant".to_string(),
            context.tenant().unwrap_or(GLOBAL_TENANT).to_string(),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStateStore;
    use crate::types::ManualClock;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bag-of-letters embedding: lexically different paraphrases land close
    struct LetterEmbedder {
        calls: AtomicUsize,
    }

    impl LetterEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LetterEmbedder {
        fn id(&self) -> &str {
            "letters"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut vector = vec![0.0_f32; 26];
            for c in text.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()) {
                vector[(c as u8 - b'a') as usize] += 1.0;
            }
            Ok(vector)
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        fn id(&self) -> &str {
            "failing"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(RouterError::EmbeddingUnavailable("offline".into()))
        }
    }

    fn response(text: &str) -> ChatResponse {
        ChatResponse {
            text: text.to_string(),
            mode: Mode::Fiscal,
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            suggestions: vec!["Revisar el modelo 303".to_string()],
            from_cache: false,
            cache_layer: CacheLayer::None,
            similarity_score: None,
            error: false,
            mode_decision: None,
        }
    }

    fn cache() -> (Arc<ManualClock>, ResponseCache) {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = ResponseCache::new(&CacheConfig::default(), Arc::new(MemoryStateStore::new()))
            .with_clock(clock.clone());
        (clock, cache)
    }

    fn semantic_cache() -> (Arc<ManualClock>, ResponseCache) {
        let (clock, cache) = cache();
        let cache = cache.with_semantic(
            Arc::new(LetterEmbedder::new()),
            Arc::new(InMemoryVectorStore::new()),
        );
        (clock, cache)
    }

    #[tokio::test]
    async fn test_repeat_within_ttl_hits_exact_tier() {
        let (_clock, cache) = cache();
        let context = ChatContext::new().with("tenant", "t1").with("track", "IMPULSO");

        assert!(cache.get("¿Cuándo presento el IVA?", Mode::Fiscal, &context).await.is_none());
        cache
            .set("¿Cuándo presento el IVA?", Mode::Fiscal, &context, &response("En abril."))
            .await;

        let hit = cache
            .get("¿cuándo  presento el IVA?", Mode::Fiscal, &context)
            .await
            .unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.cache_layer, CacheLayer::Exact);
        assert_eq!(hit.text, "En abril.");
        assert_eq!(hit.suggestions, vec!["Revisar el modelo 303"]);
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let (clock, cache) = cache();
        let context = ChatContext::new();
        cache
            .set_with_ttl("hola", Mode::Fiscal, &context, &response("a"), Duration::seconds(10))
            .await;

        clock.advance_secs(9);
        assert!(cache.get("hola", Mode::Fiscal, &context).await.is_some());
        clock.advance_secs(1);
        assert!(cache.get("hola", Mode::Fiscal, &context).await.is_none());
    }

    #[tokio::test]
    async fn test_error_responses_are_not_cached() {
        let (_clock, cache) = semantic_cache();
        let mut failed = response("fallback");
        failed.error = true;

        cache.set("hola", Mode::Fiscal, &ChatContext::new(), &failed).await;
        assert!(cache.get("hola", Mode::Fiscal, &ChatContext::new()).await.is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_paraphrase_hits_semantic_tier() {
        let (_clock, cache) = semantic_cache();
        let context = ChatContext::new().with("tenant", "t1");

        cache
            .set("como presento el iva trimestral", Mode::Fiscal, &context, &response("Con el 303."))
            .await;

        let hit = cache
            .get("el iva trimestral como lo presento", Mode::Fiscal, &context)
            .await
            .unwrap();
        assert_eq!(hit.cache_layer, CacheLayer::Semantic);
        assert!(hit.similarity_score.unwrap() >= 0.92);
        assert_eq!(hit.text, "Con el 303.");

        // Other tenants and modes are out of scope
        let other_tenant = ChatContext::new().with("tenant", "t2");
        assert!(
            cache
                .get("el iva trimestral como lo presento", Mode::Fiscal, &other_tenant)
                .await
                .is_none()
        );
        assert!(
            cache
                .get("el iva trimestral como lo presento", Mode::Cfo, &context)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_semantic_entry_respects_stored_ttl() {
        let (clock, cache) = semantic_cache();
        let context = ChatContext::new();
        cache
            .set_with_ttl("abc abc", Mode::Fiscal, &context, &response("x"), Duration::seconds(5))
            .await;

        clock.advance_secs(6);
        assert!(cache.get("cab cab", Mode::Fiscal, &context).await.is_none());
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades_to_exact_only() {
        let (_clock, cache) = cache();
        let cache = cache.with_semantic(Arc::new(FailingEmbedder), Arc::new(InMemoryVectorStore::new()));
        let context = ChatContext::new();

        cache.set("hola", Mode::Fiscal, &context, &response("a")).await;
        assert_eq!(
            cache.get("hola", Mode::Fiscal, &context).await.unwrap().cache_layer,
            CacheLayer::Exact
        );
        assert!(cache.get("adios", Mode::Fiscal, &context).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_by_tag_covers_both_tiers() {
        let (_clock, cache) = semantic_cache();
        let t1 = ChatContext::new().with("tenant", "t1");
        let t2 = ChatContext::new().with("tenant", "t2");
        cache.set("hola mundo", Mode::Fiscal, &t1, &response("a")).await;
        cache.set("hola mundo", Mode::Fiscal, &t2, &response("b")).await;

        assert_eq!(cache.invalidate("tenant:t1").await, 1);
        assert!(cache.get("mundo hola", Mode::Fiscal, &t1).await.is_none());
        assert!(cache.get("hola mundo", Mode::Fiscal, &t2).await.is_some());

        cache.invalidate_all().await;
        assert!(cache.get("hola mundo", Mode::Fiscal, &t2).await.is_none());
        assert!(cache.get("mundo hola", Mode::Fiscal, &t2).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_leave_stats_and_store() {
        let (clock, cache) = cache();
        let vectors = Arc::new(InMemoryVectorStore::new().with_clock(clock.clone()));
        let cache = cache.with_semantic(Arc::new(LetterEmbedder::new()), vectors.clone());
        let context = ChatContext::new();

        for i in 0..20 {
            cache
                .set_with_ttl(&format!("pregunta {i}"), Mode::Fiscal, &context, &response("a"), Duration::seconds(1))
                .await;
        }
        assert_eq!(cache.stats().entries, 20);
        assert_eq!(vectors.len(&cache.collection), 20);

        clock.advance_secs(86_400);
        assert_eq!(cache.stats().entries, 0);

        cache.set("otra pregunta", Mode::Fiscal, &context, &response("b")).await;
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(vectors.len(&cache.collection), 1);
    }

    #[tokio::test]
    async fn test_capacity_bounds_both_tiers() {
        let config = CacheConfig {
            max_entries: 5,
            ..Default::default()
        };
        let vectors = Arc::new(InMemoryVectorStore::with_capacity(config.max_entries));
        let cache = ResponseCache::new(&config, Arc::new(MemoryStateStore::new()))
            .with_semantic(Arc::new(LetterEmbedder::new()), vectors.clone());
        let context = ChatContext::new();

        for i in 0..30 {
            cache
                .set(&format!("pregunta numero {i}"), Mode::Cfo, &context, &response("a"))
                .await;
        }
        assert!(cache.stats().entries <= 5);
        assert!(vectors.len(&config.collection) <= 5);
        assert!(cache.get("pregunta numero 29", Mode::Cfo, &context).await.is_some());
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let (_clock, cache) = cache();
        let context = ChatContext::new();
        cache.get("hola", Mode::Coach, &context).await;
        cache.set("hola", Mode::Coach, &context, &response("a")).await;
        cache.get("hola", Mode::Coach, &context).await;
        cache.get("hola", Mode::Coach, &context).await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.entries, 1);
        assert!((stats.estimated_savings - 0.004).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_a_no_op() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        let cache = ResponseCache::new(&config, Arc::new(MemoryStateStore::new()));
        cache.set("hola", Mode::Coach, &ChatContext::new(), &response("a")).await;
        assert!(cache.get("hola", Mode::Coach, &ChatContext::new()).await.is_none());
        assert_eq!(cache.stats().misses, 0);
    }

    proptest! {
        #[test]
        fn prop_savings_monotonic_in_hits(a in 0u64..1_000_000, b in 0u64..1_000_000) {
            let (_clock, cache) = cache();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(cache.estimate_savings(lo) <= cache.estimate_savings(hi));
        }
    }
}
