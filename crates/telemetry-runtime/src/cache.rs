//! In-memory artifact cache, at most one record per key.

use std::collections::HashMap;
use telemetry_core::{ArtifactKey, ArtifactRecord};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ArtifactCache {
    entries: RwLock<HashMap<ArtifactKey, ArtifactRecord>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &ArtifactKey) -> Option<ArtifactRecord> {
        self.entries.read().await.get(key).cloned()
    }

    /// Store a record, returning the one it overwrote.
    pub async fn replace(&self, key: ArtifactKey, record: ArtifactRecord) -> Option<ArtifactRecord> {
        self.entries.write().await.insert(key, record)
    }

    pub async fn evict(&self, key: &ArtifactKey) -> Option<ArtifactRecord> {
        self.entries.write().await.remove(key)
    }

    /// Drop the record under `key` if it was not produced by `expected_tag`.
    pub async fn evict_invalid(&self, key: &ArtifactKey, expected_tag: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(record) if !record.is_valid(expected_tag) => {
                entries.remove(key);
                debug!(key = %key, tag = %expected_tag, "evicted artifact from another engine");
                true
            }
            _ => false,
        }
    }

    /// Newest valid record for another key in the same locale.
    ///
    /// Records of that locale produced by a different engine are evicted on
    /// the way; the second value counts them.
    pub async fn latest_related(
        &self,
        key: &ArtifactKey,
        expected_tag: &str,
    ) -> (Option<ArtifactRecord>, usize) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, record| !(k.same_locale(key) && k != key && !record.is_valid(expected_tag)));
        let evicted = before - entries.len();
        let newest = entries
            .iter()
            .filter(|(k, _)| k.same_locale(key) && *k != key)
            .map(|(_, record)| record)
            .max_by_key(|record| record.fetched_at)
            .cloned();
        (newest, evicted)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use telemetry_core::{LocaleId, RunId, SourceTier};

    fn record(tag: &str, minute: u32) -> ArtifactRecord {
        ArtifactRecord {
            engine_tag: tag.into(),
            payload: serde_json::json!({"minute": minute}),
            fetched_at: Utc.with_ymd_and_hms(2024, 6, 1, 9, minute, 0).unwrap(),
            source_tier: SourceTier::Authoritative,
        }
    }

    fn key(locale: &str, run: Option<&str>) -> ArtifactKey {
        ArtifactKey::new(&LocaleId(locale.into()), run.map(|r| RunId(r.into())))
    }

    #[tokio::test]
    async fn one_record_per_key() {
        let cache = ArtifactCache::new();
        assert!(cache.replace(key("Camden", None), record("v2", 1)).await.is_none());
        let old = cache.replace(key("camden", None), record("v2", 2)).await;
        assert_eq!(old, Some(record("v2", 1)));
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&key("CAMDEN", None)).await, Some(record("v2", 2)));
    }

    #[tokio::test]
    async fn evict_invalid_keeps_matching_records() {
        let cache = ArtifactCache::new();
        cache.replace(key("Camden", None), record("v2", 1)).await;
        assert!(!cache.evict_invalid(&key("Camden", None), "v2").await);
        assert!(cache.evict_invalid(&key("Camden", None), "v3").await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn related_picks_newest_valid_and_purges_foreign_engines() {
        let cache = ArtifactCache::new();
        cache.replace(key("Camden", Some("r-1")), record("v2", 5)).await;
        cache.replace(key("Camden", Some("r-2")), record("v2", 9)).await;
        cache.replace(key("Camden", Some("r-3")), record("v1", 30)).await;
        cache.replace(key("Hackney", Some("r-4")), record("v2", 40)).await;
        cache.replace(key("Camden", None), record("v2", 50)).await;

        let (found, evicted) = cache.latest_related(&key("Camden", None), "v2").await;
        assert_eq!(found, Some(record("v2", 9)));
        assert_eq!(evicted, 1);
        assert_eq!(cache.len().await, 4);

        let (found, _) = cache.latest_related(&key("Islington", None), "v2").await;
        assert!(found.is_none());
    }
}
