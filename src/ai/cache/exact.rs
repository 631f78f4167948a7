//! Exact-match tier.
//!
//! Entries are keyed by a SHA-256 digest of the normalized message, the mode
//! and the stable context subset. Expired entries are dropped on read and
//! swept on insert once the earliest known expiry has passed. Past
//! `max_entries`, the oldest entries are evicted.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::constants::cache as cache_constants;
use crate::types::{ChatContext, ChatResponse, Mode, normalize_text};

/// Digest over `normalize(message) ++ mode ++ stable context`
pub fn cache_key(message: &str, mode: Mode, context: &ChatContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(message).as_bytes());
    hasher.update(b"\n");
    hasher.update(mode.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(context.stable_fingerprint().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct ExactEntry {
    pub response: ChatResponse,
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
    pub tags: Vec<String>,
}

impl ExactEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.cached_at + self.ttl
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Concurrent exact-match store; same-key writes are last-writer-wins
pub struct ExactCache {
    entries: DashMap<String, ExactEntry>,
    max_entries: usize,
    /// Earliest expiry among stored entries (epoch millis), `i64::MAX` when none
    next_expiry: AtomicI64,
}

impl Default for ExactCache {
    fn default() -> Self {
        Self::with_capacity(cache_constants::MAX_ENTRIES)
    }
}

impl ExactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            next_expiry: AtomicI64::new(i64::MAX),
        }
    }

    /// Live entry for `key`, removing it when expired
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<ChatResponse> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.response.clone()),
            Some(_) => {}
            None => return None,
        }
        // A fresh write may have replaced the expired entry since the read
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Store `entry`, sweeping expired entries and enforcing the cap.
    ///
    /// The entry's `cached_at` is taken as the current time.
    pub fn insert(&self, key: String, entry: ExactEntry) {
        let now = entry.cached_at;
        self.next_expiry
            .fetch_min(entry.expires_at().timestamp_millis(), Ordering::AcqRel);
        self.entries.insert(key, entry);

        if now.timestamp_millis() >= self.next_expiry.load(Ordering::Acquire) {
            self.purge_expired(now);
        }
        if self.entries.len() > self.max_entries {
            self.evict_oldest(now);
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.next_expiry.store(i64::MAX, Ordering::Release);
        let mut removed = 0;
        let mut earliest = i64::MAX;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                earliest = earliest.min(entry.expires_at().timestamp_millis());
                true
            }
        });
        self.next_expiry.fetch_min(earliest, Ordering::AcqRel);
        removed
    }

    /// Evict the oldest entries down to 90% of the cap
    fn evict_oldest(&self, now: DateTime<Utc>) {
        self.purge_expired(now);
        let target = self.max_entries - self.max_entries / 10;
        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.cached_at, entry.key().clone()))
            .collect();
        by_age.sort();
        for (cached_at, key) in by_age.into_iter().take(excess) {
            self.entries
                .remove_if(&key, |_, entry| entry.cached_at == cached_at);
        }
        debug!(evicted = excess, cap = self.max_entries, "Exact cache over capacity");
    }

    /// Remove every entry carrying `tag`, returning how many were removed
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let tagged = entry.tags.iter().any(|t| t == tag);
            removed += usize::from(tagged);
            !tagged
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.next_expiry.store(i64::MAX, Ordering::Release);
    }

    /// Stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CacheLayer;

    fn response(text: &str) -> ChatResponse {
        ChatResponse {
            text: text.to_string(),
            mode: Mode::Coach,
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            suggestions: vec![],
            from_cache: false,
            cache_layer: CacheLayer::None,
            similarity_score: None,
            error: false,
            mode_decision: None,
        }
    }

    fn entry(text: &str, at: DateTime<Utc>, tags: &[&str]) -> ExactEntry {
        ExactEntry {
            response: response(text),
            cached_at: at,
            ttl: Duration::seconds(60),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn test_key_ignores_case_whitespace_and_unstable_context() {
        let a = cache_key(
            "  Hola   Mundo ",
            Mode::Coach,
            &ChatContext::new().with("tenant", "t1").with("name", "Ana"),
        );
        let b = cache_key(
            "hola mundo",
            Mode::Coach,
            &ChatContext::new().with("tenant", "t1").with("name", "Luis"),
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_mode = cache_key("hola mundo", Mode::Cfo, &ChatContext::new().with("tenant", "t1"));
        let other_tenant = cache_key("hola mundo", Mode::Coach, &ChatContext::new().with("tenant", "t2"));
        assert_ne!(a, other_mode);
        assert_ne!(a, other_tenant);
    }

    #[test]
    fn test_expired_entries_are_removed_on_read() {
        let cache = ExactCache::new();
        let now = Utc::now();
        cache.insert("k".into(), entry("hola", now, &["mode:coach"]));

        assert!(cache.get("k", now + Duration::seconds(59)).is_some());
        assert!(cache.get("k", now + Duration::seconds(60)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_tag_is_selective() {
        let cache = ExactCache::new();
        let now = Utc::now();
        cache.insert("a".into(), entry("a", now, &["mode:coach", "tenant:t1"]));
        cache.insert("b".into(), entry("b", now, &["mode:coach", "tenant:t2"]));
        cache.insert("c".into(), entry("c", now, &["mode:cfo", "tenant:t1"]));

        assert_eq!(cache.invalidate_tag("tenant:t1"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b", now).is_some());
        assert_eq!(cache.invalidate_tag("tenant:t1"), 0);
        assert_eq!(cache.invalidate_tag("mode:coach"), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_sweeps_expired_entries() {
        let cache = ExactCache::new();
        let start = Utc::now();
        for i in 0..1000 {
            let mut stale = entry("viejo", start, &["mode:coach"]);
            stale.ttl = Duration::seconds(1);
            cache.insert(format!("k{i}"), stale);
        }
        assert_eq!(cache.len(), 1000);

        let later = start + Duration::days(1);
        cache.insert("fresh".into(), entry("nuevo", later, &["mode:coach"]));
        assert_eq!(cache.get("fresh", later).unwrap().text, "nuevo");
        assert_eq!(cache.len(), 1);

        // Nothing else has expired, so the next insert keeps both
        cache.insert("other".into(), entry("otro", later, &[]));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_purge_expired_reports_removed() {
        let cache = ExactCache::new();
        let now = Utc::now();
        cache.insert("a".into(), entry("a", now, &[]));
        let mut short = entry("b", now, &[]);
        short.ttl = Duration::seconds(5);
        cache.insert("b".into(), short);

        assert_eq!(cache.purge_expired(now + Duration::seconds(4)), 0);
        assert_eq!(cache.purge_expired(now + Duration::seconds(5)), 1);
        assert!(cache.get("a", now + Duration::seconds(5)).is_some());
        assert_eq!(cache.purge_expired(now + Duration::seconds(60)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest_entries() {
        let cache = ExactCache::with_capacity(3);
        assert_eq!(cache.capacity(), 3);
        let now = Utc::now();
        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            cache.insert(key.to_string(), entry(key, now + Duration::seconds(i as i64), &[]));
        }

        let at = now + Duration::seconds(4);
        assert_eq!(cache.len(), 3);
        assert!(cache.get("a", at).is_none());
        for key in ["b", "c", "d"] {
            assert!(cache.get(key, at).is_some(), "{key} should survive");
        }
    }

    #[test]
    fn test_expired_read_keeps_fresh_replacement() {
        let cache = std::sync::Arc::new(ExactCache::new());
        let start = Utc::now();
        let later = start + Duration::seconds(120);

        // Readers race writers that replace an expired entry with a fresh one
        for round in 0..200 {
            cache.insert("k".into(), entry("old", start, &[]));
            let reader = {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        cache.get("k", later);
                    }
                })
            };
            cache.insert("k".into(), entry(&format!("new {round}"), later, &[]));
            reader.join().unwrap();
            assert_eq!(cache.get("k", later).unwrap().text, format!("new {round}"));
        }
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = ExactCache::new();
        let now = Utc::now();
        cache.insert("k".into(), entry("first", now, &[]));
        cache.insert("k".into(), entry("second", now, &[]));
        assert_eq!(cache.get("k", now).unwrap().text, "second");
    }
}
