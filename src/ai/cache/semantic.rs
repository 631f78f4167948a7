//! Semantic tier: nearest-neighbour lookup over message embeddings.
//!
//! Points whose payload carries an RFC 3339 [`EXPIRES_AT_FIELD`] in the past
//! are pruned by the in-memory store on every upsert and search.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants::cache as cache_constants;
use crate::types::{Result, SharedClock, system_clock};

/// Payload field holding a point's expiry timestamp
pub const EXPIRES_AT_FIELD: &str = "expires_at";

/// Exact-match filter over string payload fields
pub type VectorFilter = BTreeMap<String, String>;

/// Shared vector store handle
pub type SharedVectorStore = Arc<dyn VectorStore>;

/// Ranked search result
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

/// Vector-similarity store
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, collection: &str, id: &str, vector: Vec<f32>, payload: Value) -> Result<()>;

    /// Hits with `score >= min_score`, best first, at most `top_k`
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &VectorFilter,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>>;

    /// Remove every point matching `filter`; an empty filter clears the collection
    async fn delete_by_filter(&self, collection: &str, filter: &VectorFilter) -> Result<usize>;
}

/// Cosine similarity; 0.0 for empty, mismatched or zero-norm vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0_f32, 0.0_f32, 0.0_f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn matches(payload: &Value, filter: &VectorFilter) -> bool {
    filter
        .iter()
        .all(|(key, expected)| payload.get(key).and_then(Value::as_str) == Some(expected.as_str()))
}

#[derive(Debug, Clone)]
struct Point {
    vector: Vec<f32>,
    payload: Value,
    seq: u64,
    expires_at: Option<DateTime<Utc>>,
}

impl Point {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

fn expires_at(payload: &Value) -> Option<DateTime<Utc>> {
    payload
        .get(EXPIRES_AT_FIELD)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
}

fn prune_expired(points: &mut BTreeMap<String, Point>, now: DateTime<Utc>) -> usize {
    let before = points.len();
    points.retain(|_, point| !point.is_expired(now));
    before - points.len()
}

/// In-process store with brute-force cosine search, capped per collection
pub struct InMemoryVectorStore {
    collections: DashMap<String, BTreeMap<String, Point>>,
    max_points: usize,
    next_seq: AtomicU64,
    clock: SharedClock,
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::with_capacity(cache_constants::MAX_ENTRIES)
    }
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping at most `max_points` per collection, oldest upserts evicted first
    pub fn with_capacity(max_points: usize) -> Self {
        Self {
            collections: DashMap::new(),
            max_points: max_points.max(1),
            next_seq: AtomicU64::new(0),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, collection: &str, id: &str, vector: Vec<f32>, payload: Value) -> Result<()> {
        let point = Point {
            vector,
            expires_at: expires_at(&payload),
            payload,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };

        let mut points = self.collections.entry(collection.to_string()).or_default();
        prune_expired(&mut points, self.clock.now());
        points.insert(id.to_string(), point);

        let excess = points.len().saturating_sub(self.max_points);
        if excess > 0 {
            let mut by_age: Vec<(u64, String)> =
                points.iter().map(|(id, point)| (point.seq, id.clone())).collect();
            by_age.sort();
            for (_, id) in by_age.into_iter().take(excess) {
                points.remove(&id);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &VectorFilter,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<VectorHit>> {
        let Some(mut points) = self.collections.get_mut(collection) else {
            return Ok(Vec::new());
        };
        prune_expired(&mut points, self.clock.now());

        let mut hits: Vec<VectorHit> = points
            .iter()
            .filter(|(_, point)| matches(&point.payload, filter))
            .map(|(id, point)| VectorHit {
                id: id.clone(),
                score: cosine_similarity(vector, &point.vector),
                payload: point.payload.clone(),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_filter(&self, collection: &str, filter: &VectorFilter) -> Result<usize> {
        let Some(mut points) = self.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = points.len();
        points.retain(|_, point| !matches(&point.payload, filter));
        Ok(before - points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Clock, ManualClock};
    use chrono::Duration;
    use serde_json::json;

    fn filter(pairs: &[(&str, &str)]) -> VectorFilter {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn test_search_respects_filter_and_threshold() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("c", "a", vec![1.0, 0.0], json!({"mode": "coach", "tenant": "t1"}))
            .await
            .unwrap();
        store
            .upsert("c", "b", vec![1.0, 0.1], json!({"mode": "coach", "tenant": "t2"}))
            .await
            .unwrap();
        store
            .upsert("c", "d", vec![0.0, 1.0], json!({"mode": "coach", "tenant": "t1"}))
            .await
            .unwrap();

        let hits = store
            .search("c", &[1.0, 0.0], &filter(&[("tenant", "t1")]), 5, 0.9)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");

        let all = store.search("c", &[1.0, 0.0], &VectorFilter::new(), 5, 0.0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[1].id, "b");

        assert!(store.search("missing", &[1.0], &VectorFilter::new(), 1, 0.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_filter() {
        let store = InMemoryVectorStore::new();
        store.upsert("c", "a", vec![1.0], json!({"mode": "coach"})).await.unwrap();
        store.upsert("c", "b", vec![1.0], json!({"mode": "cfo"})).await.unwrap();

        assert_eq!(store.delete_by_filter("c", &filter(&[("mode", "cfo")])).await.unwrap(), 1);
        assert_eq!(store.len("c"), 1);
        assert_eq!(store.delete_by_filter("c", &VectorFilter::new()).await.unwrap(), 1);
        assert_eq!(store.len("c"), 0);
    }

    #[tokio::test]
    async fn test_expired_points_are_pruned() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryVectorStore::new().with_clock(clock.clone());
        let soon = (clock.now() + Duration::seconds(10)).to_rfc3339();
        let later = (clock.now() + Duration::seconds(100)).to_rfc3339();

        for i in 0..50 {
            store
                .upsert("c", &format!("old{i}"), vec![1.0, 0.0], json!({ "expires_at": soon }))
                .await
                .unwrap();
        }
        store
            .upsert("c", "keep", vec![0.0, 1.0], json!({ "expires_at": later }))
            .await
            .unwrap();
        store.upsert("c", "forever", vec![1.0, 1.0], json!({})).await.unwrap();
        assert_eq!(store.len("c"), 52);

        clock.advance_secs(10);
        let hits = store.search("c", &[1.0, 0.0], &VectorFilter::new(), 10, 0.0).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| !hit.id.starts_with("old")));
        assert_eq!(store.len("c"), 2);

        clock.advance_secs(90);
        store.upsert("c", "new", vec![1.0, 0.0], json!({})).await.unwrap();
        assert_eq!(store.len("c"), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_upserts() {
        let store = InMemoryVectorStore::with_capacity(2);
        store.upsert("c", "a", vec![1.0], json!({})).await.unwrap();
        store.upsert("c", "b", vec![1.0], json!({})).await.unwrap();
        // Re-upserting refreshes a point's age
        store.upsert("c", "a", vec![1.0], json!({})).await.unwrap();
        store.upsert("c", "d", vec![1.0], json!({})).await.unwrap();

        assert_eq!(store.len("c"), 2);
        let ids: Vec<String> = store
            .search("c", &[1.0], &VectorFilter::new(), 10, 0.0)
            .await
            .unwrap()
            .into_iter()
            .map(|hit| hit.id)
            .collect();
        assert!(ids.contains(&"a".to_string()));
        assert!(ids.contains(&"d".to_string()));
    }
}
