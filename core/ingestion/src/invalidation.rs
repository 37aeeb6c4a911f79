use async_trait::async_trait;
use deal_memory_schemas::{Fact, FactId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::database::SharedStore;
use crate::error::Result;

/// Memory-file keys and facts touched by a write, to be invalidated once the
/// fact store lock has been released.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invalidation {
    /// `(deal_id, topic)` pairs.
    pub topics: BTreeSet<(String, String)>,
    pub facts: BTreeSet<FactId>,
}

impl Invalidation {
    pub fn touch(&mut self, fact: &Fact) {
        self.topics
            .insert((fact.deal_id.clone(), fact.topic.clone()));
        self.facts.insert(fact.id.clone());
    }

    pub fn merge(&mut self, other: Invalidation) {
        self.topics.extend(other.topics);
        self.facts.extend(other.facts);
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty() && self.facts.is_empty()
    }

    /// Topics grouped by deal.
    pub fn topics_by_deal(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (deal_id, topic) in &self.topics {
            grouped
                .entry(deal_id.clone())
                .or_default()
                .push(topic.clone());
        }
        grouped
    }
}

/// Receives dependency changes from graph writes and the consistency engine.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, invalidation: &Invalidation) -> Result<()>;
}

/// Invalidator that marks memory files stale directly in the fact store.
pub struct StoreInvalidator {
    store: SharedStore,
}

impl StoreInvalidator {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CacheInvalidator for StoreInvalidator {
    async fn invalidate(&self, invalidation: &Invalidation) -> Result<()> {
        if invalidation.is_empty() {
            return Ok(());
        }

        let store = self.store.lock().await;
        let mut marked = 0;
        for (deal_id, topics) in invalidation.topics_by_deal() {
            marked += store.invalidate_topics(&deal_id, &topics)?;
        }
        let facts: Vec<FactId> = invalidation.facts.iter().cloned().collect();
        marked += store.invalidate_by_facts(&facts)?.len();

        debug!("Marked {} memory files stale", marked);
        Ok(())
    }
}
