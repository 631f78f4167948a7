//! Circuit Breaker Pattern for Provider Resilience
//!
//! Skips backends that keep failing so a request does not wait on a provider
//! that is already known to be down.
//!
//! ## States
//!
//! - **Closed**: Normal operation, requests flow through
//! - **Open**: `failure_threshold` consecutive failures; the provider is skipped
//!   until `opened_at + cooldown`
//!
//! ## Transitions
//!
//! ```text
//! Closed --[failure_threshold reached]--> Open
//! Open   --[cooldown elapsed, next check]--> Closed (failures = 0)
//! any    --[success]--> Closed (failures = 0)
//! ```
//!
//! There is no half-open probe budget: once the cooldown has elapsed the state
//! is cleared lazily on the next check and the provider competes normally.
//!
//! Time comes from an injected [`Clock`] and is stored as wall-clock UTC, so
//! with `durable` enabled the state written to the [`StateStore`] under
//! `circuit_breaker_<provider>` stays meaningful across restarts.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::CircuitBreakerSettings;
use crate::constants::circuit_breaker as cb_constants;
use crate::storage::SharedStateStore;
use crate::types::{SharedClock, log_filter_warn, system_clock};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitState {
    /// Normal operation - requests flow through
    Closed,
    /// Provider is failing - skipped until the cooldown elapses
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Duration a circuit stays open
    pub cooldown: Duration,
    /// Write state through to the state store
    pub durable: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: cb_constants::FAILURE_THRESHOLD,
            cooldown: Duration::seconds(cb_constants::COOLDOWN_SECS as i64),
            durable: false,
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            cooldown: Duration::seconds(settings.cooldown_secs as i64),
            durable: settings.durable,
        }
    }
}

/// Persisted breaker state.
///
/// Invariant: `opened_at.is_some()` iff `failures >= failure_threshold`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    snapshot: BreakerSnapshot,
    blocked_count: u64,
}

/// Breaker for a single provider.
///
/// All state sits behind one lock so the failure count and `opened_at` always
/// change together.
pub struct CircuitBreaker {
    provider_name: String,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    fn new(provider_name: impl Into<String>, snapshot: BreakerSnapshot) -> Self {
        Self {
            provider_name: provider_name.into(),
            inner: RwLock::new(BreakerInner {
                snapshot,
                blocked_count: 0,
            }),
        }
    }
}

/// Statistics for monitoring circuit breaker state
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub provider_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub blocked_count: u64,
    /// Seconds until the provider is offered again
    pub remaining_cooldown_secs: Option<i64>,
}

impl CircuitBreakerStats {
    /// Format as human-readable summary
    pub fn summary(&self) -> String {
        let remaining = self
            .remaining_cooldown_secs
            .map(|s| format!(" reopens in {}s", s))
            .unwrap_or_default();

        format!(
            "[{}] {} | failures={} blocked={}{}",
            self.provider_name, self.state, self.failure_count, self.blocked_count, remaining
        )
    }
}

/// Process-wide table of per-provider breakers.
///
/// Uses DashMap so providers never contend with each other; each provider's
/// read-modify-write runs under that provider's own lock.
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: SharedClock,
    store: Option<SharedStateStore>,
}

/// Shared breaker table
pub type SharedCircuitBreakers = Arc<CircuitBreakers>;

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            clock: system_clock(),
            store: None,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Attach the state store used when `durable` is enabled
    pub fn with_store(mut self, store: SharedStateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn state_key(provider: &str) -> String {
        format!("circuit_breaker_{}", provider)
    }

    fn durable_store(&self) -> Option<&SharedStateStore> {
        if self.config.durable {
            self.store.as_ref()
        } else {
            None
        }
    }

    /// Get or create the breaker, loading durable state on first access
    fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(provider) {
            return Arc::clone(existing.value());
        }

        let entry = self
            .breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                let snapshot = self
                    .durable_store()
                    .and_then(|store| {
                        log_filter_warn(
                            store.get(&Self::state_key(provider)),
                            "Failed to load circuit breaker state",
                        )
                    })
                    .flatten()
                    .and_then(|value| serde_json::from_value(value).ok())
                    .unwrap_or_default();
                Arc::new(CircuitBreaker::new(provider, snapshot))
            });
        Arc::clone(entry.value())
    }

    fn persist(&self, provider: &str, snapshot: &BreakerSnapshot) {
        let Some(store) = self.durable_store() else {
            return;
        };
        let key = Self::state_key(provider);
        let result = if *snapshot == BreakerSnapshot::default() {
            store.delete(&key)
        } else {
            match serde_json::to_value(snapshot) {
                Ok(value) => store.set(&key, value),
                Err(e) => Err(e.into()),
            }
        };
        log_filter_warn(result, "Failed to persist circuit breaker state");
    }

    /// Clear an open state whose cooldown has elapsed. Returns true if cleared.
    fn expire_if_elapsed(&self, snapshot: &mut BreakerSnapshot, now: DateTime<Utc>) -> bool {
        match snapshot.opened_at {
            Some(opened_at) if now >= opened_at + self.config.cooldown => {
                *snapshot = BreakerSnapshot::default();
                true
            }
            _ => false,
        }
    }

    /// True iff the provider tripped and its cooldown has not elapsed.
    ///
    /// An elapsed cooldown is cleared here, making the provider eligible again.
    pub fn is_open(&self, provider: &str) -> bool {
        let breaker = self.breaker(provider);
        let now = self.clock.now();

        let mut inner = breaker
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if inner.snapshot.opened_at.is_none() {
            return false;
        }

        if self.expire_if_elapsed(&mut inner.snapshot, now) {
            tracing::info!(
                provider = %breaker.provider_name,
                "Circuit breaker cooldown elapsed, provider eligible again"
            );
            self.persist(provider, &inner.snapshot);
            return false;
        }

        inner.blocked_count += 1;
        true
    }

    /// Record a failed attempt (including timeouts)
    pub fn record_failure(&self, provider: &str) {
        let breaker = self.breaker(provider);
        let now = self.clock.now();

        let mut inner = breaker
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        self.expire_if_elapsed(&mut inner.snapshot, now);
        inner.snapshot.failures = inner.snapshot.failures.saturating_add(1);

        if inner.snapshot.opened_at.is_none()
            && inner.snapshot.failures >= self.config.failure_threshold
        {
            inner.snapshot.opened_at = Some(now);
            tracing::warn!(
                provider = %breaker.provider_name,
                failures = inner.snapshot.failures,
                cooldown_secs = self.config.cooldown.num_seconds(),
                "Circuit breaker opened"
            );
        } else {
            tracing::debug!(
                provider = %breaker.provider_name,
                failures = inner.snapshot.failures,
                "Circuit breaker recorded failure"
            );
        }

        self.persist(provider, &inner.snapshot);
    }

    /// Record a successful attempt; fully resets the provider
    pub fn record_success(&self, provider: &str) {
        let breaker = self.breaker(provider);
        let mut inner = breaker
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if inner.snapshot == BreakerSnapshot::default() {
            return;
        }

        if inner.snapshot.opened_at.is_some() {
            tracing::info!(provider = %breaker.provider_name, "Circuit breaker closed (provider recovered)");
        }
        inner.snapshot = BreakerSnapshot::default();
        self.persist(provider, &inner.snapshot);
    }

    /// Force reset to closed state (for manual intervention)
    pub fn reset(&self, provider: &str) {
        let breaker = self.breaker(provider);
        let mut inner = breaker
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        inner.snapshot = BreakerSnapshot::default();
        inner.blocked_count = 0;
        self.persist(provider, &inner.snapshot);

        tracing::info!(provider = %provider, "Circuit breaker manually reset to CLOSED");
    }

    /// Current state without side effects
    pub fn state(&self, provider: &str) -> CircuitState {
        self.stats_for(provider).state
    }

    /// Current persisted-shape state of a provider
    pub fn snapshot(&self, provider: &str) -> BreakerSnapshot {
        self.breaker(provider)
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .snapshot
            .clone()
    }

    /// Statistics for one provider
    pub fn stats_for(&self, provider: &str) -> CircuitBreakerStats {
        let breaker = self.breaker(provider);
        let now = self.clock.now();
        let inner = breaker
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let reopen_at = inner.snapshot.opened_at.map(|t| t + self.config.cooldown);
        let open = reopen_at.is_some_and(|t| now < t);

        CircuitBreakerStats {
            provider_name: breaker.provider_name.clone(),
            state: if open {
                CircuitState::Open
            } else {
                CircuitState::Closed
            },
            failure_count: inner.snapshot.failures,
            opened_at: inner.snapshot.opened_at,
            blocked_count: inner.blocked_count,
            remaining_cooldown_secs: reopen_at
                .filter(|_| open)
                .map(|t| (t - now).num_seconds()),
        }
    }

    /// Statistics for every provider seen so far, sorted by name
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names.iter().map(|name| self.stats_for(name)).collect()
    }
}

/// Create a shared breaker table from settings
pub fn create_shared_breakers(
    settings: &CircuitBreakerSettings,
    clock: SharedClock,
    store: SharedStateStore,
) -> SharedCircuitBreakers {
    Arc::new(
        CircuitBreakers::new(CircuitBreakerConfig::from(settings))
            .with_clock(clock)
            .with_store(store),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStateStore, StateStore};
    use crate::types::ManualClock;

    fn breakers_with_clock(threshold: u32, cooldown_secs: i64) -> (Arc<ManualClock>, CircuitBreakers) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::seconds(cooldown_secs),
            durable: false,
        };
        let breakers = CircuitBreakers::new(config).with_clock(clock.clone());
        (clock, breakers)
    }

    #[test]
    fn test_initial_state_is_closed() {
        let cb = CircuitBreakers::with_defaults();
        assert_eq!(cb.state("test"), CircuitState::Closed);
        assert!(!cb.is_open("test"));
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let (_clock, cb) = breakers_with_clock(3, 300);

        cb.record_failure("a");
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Closed);
        assert!(cb.snapshot("a").opened_at.is_none());

        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Open);
        assert!(cb.is_open("a"));
        assert!(cb.snapshot("a").opened_at.is_some());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (_clock, cb) = breakers_with_clock(3, 300);

        cb.record_failure("a");
        cb.record_failure("a");
        cb.record_success("a");
        assert_eq!(cb.snapshot("a").failures, 0);

        cb.record_failure("a");
        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitState::Closed);
    }

    #[test]
    fn test_open_for_exactly_the_cooldown() {
        let (clock, cb) = breakers_with_clock(5, 300);
        for _ in 0..5 {
            cb.record_failure("a");
        }

        clock.advance_secs(299);
        assert!(cb.is_open("a"));

        clock.advance_secs(2);
        assert!(!cb.is_open("a"));
        // Lazy reset cleared the state
        assert_eq!(cb.snapshot("a"), BreakerSnapshot::default());
    }

    #[test]
    fn test_failure_while_open_keeps_opened_at() {
        let (clock, cb) = breakers_with_clock(2, 300);
        cb.record_failure("a");
        cb.record_failure("a");
        let opened_at = cb.snapshot("a").opened_at;

        clock.advance_secs(10);
        cb.record_failure("a");
        assert_eq!(cb.snapshot("a").opened_at, opened_at);
        assert_eq!(cb.snapshot("a").failures, 3);
    }

    #[test]
    fn test_failure_after_cooldown_starts_fresh_count() {
        let (clock, cb) = breakers_with_clock(2, 60);
        cb.record_failure("a");
        cb.record_failure("a");
        clock.advance_secs(61);

        cb.record_failure("a");
        let snapshot = cb.snapshot("a");
        assert_eq!(snapshot.failures, 1);
        assert!(snapshot.opened_at.is_none());
    }

    #[test]
    fn test_blocked_count_and_summary() {
        let (_clock, cb) = breakers_with_clock(1, 300);
        cb.record_failure("a");
        assert!(cb.is_open("a"));
        assert!(cb.is_open("a"));

        let stats = cb.stats_for("a");
        assert_eq!(stats.blocked_count, 2);
        assert_eq!(stats.remaining_cooldown_secs, Some(300));
        assert!(stats.summary().contains("OPEN"));
    }

    #[test]
    fn test_manual_reset() {
        let (_clock, cb) = breakers_with_clock(1, 300);
        cb.record_failure("a");
        assert!(cb.is_open("a"));

        cb.reset("a");
        assert!(!cb.is_open("a"));
        assert_eq!(cb.stats_for("a").blocked_count, 0);
    }

    #[test]
    fn test_providers_are_independent() {
        let (_clock, cb) = breakers_with_clock(1, 300);
        cb.record_failure("a");
        assert!(cb.is_open("a"));
        assert!(!cb.is_open("b"));
        let names: Vec<_> = cb.stats().into_iter().map(|s| s.provider_name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_failures_open_consistently() {
        let cb = Arc::new(CircuitBreakers::new(CircuitBreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        }));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = Arc::clone(&cb);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        cb.record_failure("shared");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = cb.snapshot("shared");
        assert_eq!(snapshot.failures, 160);
        assert!(snapshot.opened_at.is_some());
        assert!(cb.is_open("shared"));
    }

    #[test]
    fn test_durable_state_survives_new_table() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::new());
        let clock: SharedClock = Arc::new(ManualClock::starting_now());
        let settings = CircuitBreakerSettings {
            failure_threshold: 2,
            cooldown_secs: 300,
            durable: true,
        };

        let first = create_shared_breakers(&settings, clock.clone(), store.clone());
        first.record_failure("openai");
        first.record_failure("openai");
        assert!(store.get("circuit_breaker_openai").unwrap().is_some());

        let second = create_shared_breakers(&settings, clock, store.clone());
        assert!(second.is_open("openai"));

        second.record_success("openai");
        assert!(store.get("circuit_breaker_openai").unwrap().is_none());
    }

    #[test]
    fn test_non_durable_does_not_write_store() {
        let store: SharedStateStore = Arc::new(MemoryStateStore::new());
        let settings = CircuitBreakerSettings {
            failure_threshold: 1,
            cooldown_secs: 300,
            durable: false,
        };
        let cb = create_shared_breakers(&settings, system_clock(), store.clone());
        cb.record_failure("openai");
        assert!(store.get("circuit_breaker_openai").unwrap().is_none());
    }
}
