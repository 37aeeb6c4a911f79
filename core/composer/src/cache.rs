//! Memory cache layer.
//!
//! Per-topic summaries are regenerated lazily by the first `get` that sees a
//! stale entry. A per-key lock keeps regeneration single-flight, and the
//! commit is a compare-and-swap on the entry's invalidation epoch so an
//! invalidation racing a regeneration is never lost.

use async_trait::async_trait;
use deal_memory_ingestion::{
    CacheConfig, CacheInvalidator, EngineError, FactStore, Invalidation, MemoryFileRecord, Result,
    SharedStore,
};
use deal_memory_schemas::{
    ChunkId, FactId, FactStatus, MemoryFile, NodeRef, RelationKind, SourceKind,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::templates::{TemplateRenderer, TopicSnapshot};

type CacheKey = (String, String);

pub struct MemoryCache {
    store: SharedStore,
    config: CacheConfig,
    pipeline_version: String,
    renderer: TemplateRenderer,
    locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    regenerations: AtomicU64,
    #[cfg(test)]
    before_commit: std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MemoryCache {
    pub fn new(store: SharedStore, config: CacheConfig, pipeline_version: impl Into<String>) -> Self {
        let renderer = TemplateRenderer::new(config.max_facts_per_summary);
        Self {
            store,
            config,
            pipeline_version: pipeline_version.into(),
            renderer,
            locks: Mutex::new(HashMap::new()),
            regenerations: AtomicU64::new(0),
            #[cfg(test)]
            before_commit: std::sync::Mutex::new(None),
        }
    }

    /// Completed regenerations since startup.
    pub fn regenerations(&self) -> u64 {
        self.regenerations.load(Ordering::SeqCst)
    }

    /// Current summary for `(deal_id, topic)`, regenerating it first when stale.
    ///
    /// If every regeneration attempt loses its commit to a concurrent
    /// invalidation, the last committed content is returned with `stale=true`.
    pub async fn get(&self, deal_id: &str, topic: &str) -> Result<MemoryFile> {
        if deal_id.trim().is_empty() || topic.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "deal_id and topic are required".into(),
            ));
        }

        let record = self.store.lock().await.ensure_memory_file(deal_id, topic)?;
        if !needs_regeneration(&record) {
            return Ok(record.file);
        }

        let key = (deal_id.to_string(), topic.to_string());
        let key_lock = self.key_lock(&key).await;
        let result = {
            let _guard = key_lock.lock().await;
            self.regenerate(deal_id, topic, record).await
        };
        self.release_key(&key, key_lock).await;
        result
    }

    async fn regenerate(
        &self,
        deal_id: &str,
        topic: &str,
        record: MemoryFileRecord,
    ) -> Result<MemoryFile> {
        let max_attempts = self.config.max_regeneration_attempts.max(1);
        let mut latest = record;
        for attempt in 1..=max_attempts {
            let (record, snapshot) = {
                let store = self.store.lock().await;
                let record = store.ensure_memory_file(deal_id, topic)?;
                // Another caller regenerated while this one waited for the key.
                if !needs_regeneration(&record) {
                    return Ok(record.file);
                }
                let snapshot = self.snapshot(&store, deal_id, topic)?;
                (record, snapshot)
            };

            let content = self.renderer.render(&snapshot);
            #[cfg(test)]
            self.run_before_commit();
            let committed = self.store.lock().await.commit_memory_file(
                deal_id,
                topic,
                &content,
                record.epoch,
                &snapshot.dependencies(),
            )?;

            match committed {
                Some(file) => {
                    self.regenerations.fetch_add(1, Ordering::SeqCst);
                    info!(
                        "Regenerated memory {}/{} at version {} ({} facts)",
                        deal_id,
                        topic,
                        file.version,
                        snapshot.facts.len()
                    );
                    return Ok(file);
                }
                None => {
                    debug!(
                        "Memory {}/{} invalidated during regeneration (attempt {}/{})",
                        deal_id, topic, attempt, max_attempts
                    );
                    latest = record;
                }
            }
        }

        let current = self
            .store
            .lock()
            .await
            .get_memory_file(deal_id, topic)?
            .unwrap_or(latest);
        warn!(
            "StaleCacheServed: memory {}/{} at version {} after {} regeneration attempts",
            deal_id, topic, current.file.version, max_attempts
        );
        Ok(current.file)
    }

    /// Mark topics stale. Entries that were never generated are left alone.
    pub async fn invalidate(&self, deal_id: &str, topics: &[String]) -> Result<usize> {
        let count = self.store.lock().await.invalidate_topics(deal_id, topics)?;
        if count > 0 {
            debug!("Invalidated {} memory files for deal {}", count, deal_id);
        }
        Ok(count)
    }

    /// Mark stale every memory file built from any of `fact_ids`.
    pub async fn invalidate_facts(&self, fact_ids: &[FactId]) -> Result<Vec<(String, String)>> {
        let keys = self.store.lock().await.invalidate_by_facts(fact_ids)?;
        if !keys.is_empty() {
            debug!("Invalidated {} memory files by dependency", keys.len());
        }
        Ok(keys)
    }

    async fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the key's lock entry once no other caller holds or awaits it.
    async fn release_key(&self, key: &CacheKey, key_lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&key_lock) == 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    async fn lock_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    #[cfg(test)]
    fn before_next_commit(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_commit.lock().unwrap() = Some(Box::new(hook));
    }

    #[cfg(test)]
    fn run_before_commit(&self) {
        let hook = self.before_commit.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn snapshot(&self, store: &FactStore, deal_id: &str, topic: &str) -> Result<TopicSnapshot> {
        let facts = store.facts_by_topic(deal_id, topic)?;

        let mut contradictions = BTreeSet::new();
        let mut supersessions = Vec::new();
        for fact in &facts {
            match fact.status {
                FactStatus::Contradicted => {
                    let resolved: Vec<FactId> = store
                        .resolutions_for(&fact.id)?
                        .into_iter()
                        .flat_map(|r| [r.fact_a, r.fact_b])
                        .collect();
                    for rel in store.relationships_for(&NodeRef::Fact(fact.id.clone()))? {
                        if rel.kind != RelationKind::Contradicts {
                            continue;
                        }
                        let other = match (&rel.source, &rel.target) {
                            (NodeRef::Fact(s), NodeRef::Fact(t)) if s == &fact.id => t.clone(),
                            (NodeRef::Fact(s), NodeRef::Fact(_)) => s.clone(),
                            _ => continue,
                        };
                        if resolved.contains(&other) {
                            continue;
                        }
                        let pair = if fact.id < other {
                            (fact.id.clone(), other)
                        } else {
                            (other, fact.id.clone())
                        };
                        contradictions.insert(pair);
                    }
                }
                FactStatus::Superseded => {
                    for newer in store.incoming_supersedes(&fact.id)? {
                        supersessions.push((newer, fact.id.clone()));
                    }
                }
                _ => {}
            }
        }

        // Pending chunks count only for documents that already feed this topic.
        let documents: BTreeSet<&str> = facts
            .iter()
            .filter(|f| f.source.kind == SourceKind::Document)
            .map(|f| f.source.document_id.as_str())
            .collect();
        let mut chunk_ids: Vec<ChunkId> = Vec::new();
        for document_id in documents {
            chunk_ids.extend(
                store
                    .chunks_for_document(document_id)?
                    .into_iter()
                    .map(|c| c.chunk_id),
            );
        }
        let unverified_chunks = store
            .incomplete_chunks(&chunk_ids, &self.pipeline_version)?
            .len();

        Ok(TopicSnapshot {
            deal_id: deal_id.to_string(),
            topic: topic.to_string(),
            facts,
            contradictions: contradictions.into_iter().collect(),
            supersessions,
            unverified_chunks,
        })
    }
}

fn needs_regeneration(record: &MemoryFileRecord) -> bool {
    record.file.stale || record.file.version == 0
}

#[async_trait]
impl CacheInvalidator for MemoryCache {
    async fn invalidate(&self, invalidation: &Invalidation) -> Result<()> {
        for (deal_id, topics) in invalidation.topics_by_deal() {
            MemoryCache::invalidate(self, &deal_id, &topics).await?;
        }
        let facts: Vec<FactId> = invalidation.facts.iter().cloned().collect();
        if !facts.is_empty() {
            self.invalidate_facts(&facts).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deal_memory_ingestion::FactInsert;
    use deal_memory_schemas::{generate_chunk_id, generate_fact_id, Chunk, Fact, Locator, Source};
    use tempfile::NamedTempFile;

    fn fact(content: &str) -> Fact {
        Fact {
            id: generate_fact_id(),
            deal_id: "deal_1".into(),
            content: content.into(),
            entity_ref: None,
            attribute: Some("revenue".into()),
            value: None,
            period: None,
            topic: "financials".into(),
            confidence: 0.7,
            source: Source::document("deck", Locator::Page { page: 1 }),
            chunk_id: None,
            extraction_key: None,
            discovered_at: Utc::now().to_rfc3339(),
            status: FactStatus::Unvalidated,
        }
    }

    fn cache() -> (SharedStore, Arc<MemoryCache>) {
        let store = FactStore::open_in_memory().unwrap().into_shared();
        let cache = Arc::new(MemoryCache::new(
            store.clone(),
            CacheConfig::default(),
            "v1",
        ));
        (store, cache)
    }

    #[tokio::test]
    async fn test_first_get_generates() {
        let (store, cache) = cache();
        store
            .lock()
            .await
            .insert_fact(&fact("FY2023 revenue = 4M"))
            .unwrap();

        let file = cache.get("deal_1", "financials").await.unwrap();
        assert_eq!(file.version, 1);
        assert!(!file.stale);
        assert!(file.content.contains("FY2023 revenue = 4M"));
        assert!(file.last_regenerated_at.is_some());

        // Fresh entries are served without regenerating.
        let again = cache.get("deal_1", "financials").await.unwrap();
        assert_eq!(again.version, 1);
        assert_eq!(cache.regenerations(), 1);
        assert_eq!(cache.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalidation_bumps_version_on_next_get() {
        let temp = NamedTempFile::new().unwrap();
        let store = FactStore::open(temp.path()).unwrap().into_shared();
        let cache = MemoryCache::new(store.clone(), CacheConfig::default(), "v1");

        let first = cache.get("deal_1", "financials").await.unwrap();
        let inserted = store
            .lock()
            .await
            .insert_fact(&fact("FY2024 revenue = 5M"))
            .unwrap();
        assert!(matches!(inserted, FactInsert::Inserted(_)));

        cache
            .invalidate("deal_1", &["financials".to_string()])
            .await
            .unwrap();
        let stale = store
            .lock()
            .await
            .get_memory_file("deal_1", "financials")
            .unwrap()
            .unwrap();
        assert!(stale.file.stale);

        let second = cache.get("deal_1", "financials").await.unwrap();
        assert!(second.version > first.version);
        assert!(!second.stale);
        assert!(second.content.contains("FY2024 revenue = 5M"));
    }

    #[tokio::test]
    async fn test_dependency_invalidation() {
        let (store, cache) = cache();
        let f = fact("FY2023 revenue = 4M");
        store.lock().await.insert_fact(&f).unwrap();
        cache.get("deal_1", "financials").await.unwrap();

        let keys = cache.invalidate_facts(&[f.id.clone()]).await.unwrap();
        assert_eq!(keys, vec![("deal_1".to_string(), "financials".to_string())]);
        assert_eq!(cache.get("deal_1", "financials").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_gets_regenerate_once() {
        let (store, cache) = cache();
        store
            .lock()
            .await
            .insert_fact(&fact("FY2023 revenue = 4M"))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("deal_1", "financials").await.unwrap() })
            })
            .collect();
        for handle in handles {
            let file = handle.await.unwrap();
            assert_eq!(file.version, 1);
            assert!(!file.stale);
        }
        assert_eq!(cache.regenerations(), 1);
        assert_eq!(cache.lock_count().await, 0);
    }

    /// Regenerate once, then add a fact and invalidate so the next get must regenerate.
    async fn stale_after_first_render(store: &SharedStore, cache: &MemoryCache) {
        store
            .lock()
            .await
            .insert_fact(&fact("FY2023 revenue = 4M"))
            .unwrap();
        assert_eq!(cache.get("deal_1", "financials").await.unwrap().version, 1);

        store
            .lock()
            .await
            .insert_fact(&fact("FY2024 revenue = 5M"))
            .unwrap();
        cache
            .invalidate("deal_1", &["financials".to_string()])
            .await
            .unwrap();
    }

    fn invalidate_before_commit(store: &SharedStore, cache: &MemoryCache) {
        let store = store.clone();
        cache.before_next_commit(move || {
            store
                .try_lock()
                .unwrap()
                .invalidate_topics("deal_1", &["financials".to_string()])
                .unwrap();
        });
    }

    #[tokio::test]
    async fn test_lost_commit_serves_stale_content() {
        let store = FactStore::open_in_memory().unwrap().into_shared();
        let config = CacheConfig {
            max_regeneration_attempts: 1,
            ..CacheConfig::default()
        };
        let cache = MemoryCache::new(store.clone(), config, "v1");
        stale_after_first_render(&store, &cache).await;

        invalidate_before_commit(&store, &cache);
        let served = cache.get("deal_1", "financials").await.unwrap();
        assert!(served.stale);
        assert_eq!(served.version, 1);
        assert!(served.content.contains("FY2023 revenue = 4M"));
        assert!(!served.content.contains("FY2024 revenue = 5M"));
        assert_eq!(cache.regenerations(), 1);

        // The bumped epoch is picked up by the next reader.
        let fresh = cache.get("deal_1", "financials").await.unwrap();
        assert!(!fresh.stale);
        assert_eq!(fresh.version, 2);
        assert!(fresh.content.contains("FY2024 revenue = 5M"));
    }

    #[tokio::test]
    async fn test_lost_commit_is_retried() {
        let (store, cache) = cache();
        stale_after_first_render(&store, &cache).await;

        invalidate_before_commit(&store, &cache);
        let file = cache.get("deal_1", "financials").await.unwrap();
        assert!(!file.stale);
        assert_eq!(file.version, 2);
        assert!(file.content.contains("FY2024 revenue = 5M"));
        assert_eq!(cache.regenerations(), 2);
        assert_eq!(cache.lock_count().await, 0);

        let record = store
            .lock()
            .await
            .get_memory_file("deal_1", "financials")
            .unwrap()
            .unwrap();
        assert!(!record.file.stale);
    }

    #[tokio::test]
    async fn test_pending_chunks_are_counted_per_topic() {
        let (store, cache) = cache();
        {
            let store = store.lock().await;
            for document_id in ["deck", "deck", "hr_memo"] {
                store
                    .insert_chunk(&Chunk {
                        chunk_id: generate_chunk_id(),
                        deal_id: "deal_1".into(),
                        document_id: document_id.into(),
                        document_name: None,
                        locator: Locator::Page { page: 1 },
                        text: "pending".into(),
                        mime: None,
                        supersedes_document: None,
                        received_at: Utc::now().to_rfc3339(),
                    })
                    .unwrap();
            }
            store.insert_fact(&fact("FY2023 revenue = 4M")).unwrap();
        }

        let file = cache.get("deal_1", "financials").await.unwrap();
        assert!(file.content.contains("_2 chunk(s)"));

        // Nothing has been extracted for the team topic yet.
        let team = cache.get("deal_1", "team").await.unwrap();
        assert!(!team.content.contains("chunk(s)"));
    }

    #[tokio::test]
    async fn test_rejects_blank_key() {
        let (_, cache) = cache();
        let err = cache.get("", "financials").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
