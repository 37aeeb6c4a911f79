//! Deep graph tier: semantic extraction, entity resolution and graph query.
//!
//! Writes facts, entities and typed edges into the fact store, runs every
//! written fact through the consistency engine and reports per-chunk
//! completion on a broadcast channel. Nothing here sits on the query path's
//! critical section for longer than a store call.

use chrono::Utc;
use deal_memory_schemas::{
    generate_entity_id, generate_fact_id, periods_overlap, Chunk, ChunkId, Entity, EntityId,
    ExtractionJob, Fact, FactId, FactStatus, NodeRef, QueryFilters, RelationKind, Relationship,
    Source, Tier, TierEvent, TierStatus,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::consistency::ConsistencyEngine;
use crate::database::{FactStore, SharedStore};
use crate::embedding::{cosine_similarity, Embedder, HashingEmbedder};
use crate::error::{EngineError, Result};
use crate::extractor::{ExtractionContext, FactExtractor};
use crate::heuristic::{ExtractedEntity, Extraction};
use crate::invalidation::{CacheInvalidator, Invalidation};
use crate::scoring::ScoringService;
use crate::text;

/// File-name tokens that mark a document as a correction of an earlier one.
const CORRECTION_MARKERS: &[&str] = &[
    "corrected", "correction", "revised", "restated", "restatement", "amended", "erratum",
];

const KEYWORD_WEIGHT: f32 = 0.5;
const VECTOR_WEIGHT: f32 = 0.35;
const TRAVERSAL_WEIGHT: f32 = 0.15;
const MIN_VECTOR_SIMILARITY: f32 = 0.1;

/// A fact or entity returned by the graph tier.
#[derive(Debug, Clone)]
pub enum GraphNode {
    Fact(Fact),
    Entity(Entity),
}

#[derive(Debug, Clone)]
pub struct GraphHit {
    pub node: GraphNode,
    pub score: f32,
    /// Sources backing the node: the fact's own source, or those of an entity's facts.
    pub provenance: Vec<Source>,
    pub relationships: Vec<Relationship>,
}

impl GraphHit {
    pub fn fact(&self) -> Option<&Fact> {
        match &self.node {
            GraphNode::Fact(fact) => Some(fact),
            GraphNode::Entity(_) => None,
        }
    }
}

/// What one `ingest` call did.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub chunk_id: Option<ChunkId>,
    /// The chunk was already extracted under this pipeline version.
    pub skipped: bool,
    pub facts: Vec<FactId>,
    pub new_facts: usize,
    pub entities: usize,
    /// Earlier document this chunk's document was found to correct.
    pub corrects_document: Option<String>,
    pub invalidation: Invalidation,
}

pub struct GraphTier {
    store: SharedStore,
    extractor: Arc<dyn FactExtractor>,
    consistency: Arc<ConsistencyEngine>,
    scorer: Arc<dyn ScoringService>,
    embedder: Arc<dyn Embedder>,
    invalidator: Arc<dyn CacheInvalidator>,
    events: broadcast::Sender<TierEvent>,
}

impl GraphTier {
    pub fn new(
        store: SharedStore,
        extractor: Arc<dyn FactExtractor>,
        consistency: Arc<ConsistencyEngine>,
        scorer: Arc<dyn ScoringService>,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            extractor,
            consistency,
            scorer,
            embedder: Arc::new(HashingEmbedder::default()),
            invalidator,
            events,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Publish on a channel shared with the other tier.
    pub fn with_events(mut self, events: broadcast::Sender<TierEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn consistency(&self) -> &Arc<ConsistencyEngine> {
        &self.consistency
    }

    pub fn invalidator(&self) -> &Arc<dyn CacheInvalidator> {
        &self.invalidator
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Per-chunk completion events for this tier.
    pub fn subscribe(&self) -> broadcast::Receiver<TierEvent> {
        self.events.subscribe()
    }

    fn emit(&self, chunk_id: &ChunkId, status: TierStatus) {
        // No subscribers is fine.
        let _ = self.events.send(TierEvent {
            chunk_id: chunk_id.clone(),
            tier: Tier::DeepGraph,
            status,
            at: Utc::now().to_rfc3339(),
        });
    }

    /// Store the chunk and register its extraction job as pending.
    pub async fn register(&self, chunk: &Chunk, ctx: &ExtractionContext) -> Result<ExtractionJob> {
        let store = self.store.lock().await;
        store.insert_chunk(chunk)?;
        let known = store.get_job(&chunk.chunk_id, &ctx.pipeline_version)?.is_some();
        let job = store.enqueue_job(&chunk.chunk_id, &ctx.pipeline_version, &chunk.document_id)?;
        if !known {
            self.emit(&chunk.chunk_id, TierStatus::Pending);
        }
        Ok(job)
    }

    /// Extract and write the chunk's facts, entities and edges.
    ///
    /// Idempotent per `(chunk_id, pipeline_version)`: a completed job is
    /// skipped, and a retried one reuses facts already written by extraction key.
    /// On failure the job goes back to `pending` with the error recorded.
    pub async fn ingest(&self, chunk: &Chunk, ctx: &ExtractionContext) -> Result<IngestReport> {
        if chunk.deal_id != ctx.deal_id {
            return Err(EngineError::InvalidInput(format!(
                "chunk {} belongs to deal {}, not {}",
                chunk.chunk_id, chunk.deal_id, ctx.deal_id
            )));
        }

        let job = self.register(chunk, ctx).await?;
        if job.status == TierStatus::Completed {
            debug!(
                "Chunk {} already extracted with pipeline {}",
                chunk.chunk_id, ctx.pipeline_version
            );
            return Ok(IngestReport {
                chunk_id: Some(chunk.chunk_id.clone()),
                skipped: true,
                ..Default::default()
            });
        }

        let attempt = self
            .store
            .lock()
            .await
            .start_job(&chunk.chunk_id, &ctx.pipeline_version)?;
        self.emit(&chunk.chunk_id, TierStatus::Running);
        debug!("Extracting chunk {} (attempt {})", chunk.chunk_id, attempt);

        match self.run_extraction(chunk, ctx).await {
            Ok(report) => {
                self.store.lock().await.finish_job(
                    &chunk.chunk_id,
                    &ctx.pipeline_version,
                    TierStatus::Completed,
                    None,
                )?;
                self.emit(&chunk.chunk_id, TierStatus::Completed);
                info!(
                    "Deep extraction of chunk {} wrote {} facts ({} new)",
                    chunk.chunk_id,
                    report.facts.len(),
                    report.new_facts
                );
                Ok(report)
            }
            Err(e) => {
                let reason = e.to_string();
                if let Err(store_err) = self.store.lock().await.finish_job(
                    &chunk.chunk_id,
                    &ctx.pipeline_version,
                    TierStatus::Pending,
                    Some(&reason),
                ) {
                    warn!("Could not record failure of chunk {}: {}", chunk.chunk_id, store_err);
                }
                Err(e)
            }
        }
    }

    /// Give up on a chunk after retries ran out.
    pub async fn mark_failed(&self, chunk_id: &ChunkId, pipeline_version: &str, reason: &str) -> Result<()> {
        self.store
            .lock()
            .await
            .finish_job(chunk_id, pipeline_version, TierStatus::Failed, Some(reason))?;
        self.emit(chunk_id, TierStatus::Failed);
        Ok(())
    }

    async fn run_extraction(&self, chunk: &Chunk, ctx: &ExtractionContext) -> Result<IngestReport> {
        let extraction = self.extractor.extract(chunk, ctx).await?;

        let corrects_document = {
            let store = self.store.lock().await;
            detect_correction(&store, chunk, &extraction)?
        };

        let wanted: Vec<ExtractedEntity> = extraction
            .facts
            .iter()
            .flat_map(|fact| fact.subject.iter().chain(fact.mentions.iter()))
            .cloned()
            .collect();
        let entities = self.resolve_entities(&chunk.deal_id, &wanted).await?;

        let written = {
            let store = self.store.lock().await;
            store.transaction(|store| self.write_facts(store, chunk, ctx, &extraction, &entities))?
        };

        let mut invalidation = Invalidation::default();
        for fact_id in &written.facts {
            let outcome = self.consistency.check_fact(&self.store, fact_id).await?;
            invalidation.merge(outcome.invalidation);
        }

        self.invalidator.invalidate(&invalidation).await?;

        Ok(IngestReport {
            chunk_id: Some(chunk.chunk_id.clone()),
            skipped: false,
            facts: written.facts,
            new_facts: written.new_facts,
            entities: entities.len(),
            corrects_document,
            invalidation,
        })
    }

    /// Map every extracted entity to a stored one, merging by exact name or
    /// alias first, then by scored similarity within the same type.
    pub(crate) async fn resolve_entities(
        &self,
        deal_id: &str,
        wanted: &[ExtractedEntity],
    ) -> Result<HashMap<String, EntityId>> {
        let mut unique: Vec<&ExtractedEntity> = Vec::new();
        let mut seen = HashSet::new();
        for entity in wanted {
            let key = text::normalize_name(&entity.name);
            if !key.is_empty() && seen.insert(key) {
                unique.push(entity);
            }
        }

        let mut resolved = HashMap::new();
        let mut pending = Vec::new();
        {
            let store = self.store.lock().await;
            for entity in unique {
                match store.find_entity_by_name(deal_id, &entity.name)? {
                    Some(existing) => {
                        resolved.insert(text::normalize_name(&entity.name), existing.id);
                    }
                    None => {
                        let candidates = store.find_entities(deal_id, Some(&entity.entity_type))?;
                        pending.push((entity, candidates));
                    }
                }
            }
        }

        let threshold = self.consistency.config().entity_merge_threshold;
        let mut decisions = Vec::with_capacity(pending.len());
        for (entity, candidates) in pending {
            let mut best: Option<(EntityId, f32)> = None;
            for candidate in &candidates {
                for name in std::iter::once(&candidate.name).chain(candidate.aliases.iter()) {
                    let score = self.scorer.similarity(&entity.name, name).await?;
                    if best.as_ref().map_or(true, |(_, s)| score > *s) {
                        best = Some((candidate.id.clone(), score));
                    }
                }
            }
            let merge_into = best.filter(|(_, score)| *score >= threshold).map(|(id, _)| id);
            decisions.push((entity, merge_into));
        }

        let store = self.store.lock().await;
        for (entity, merge_into) in decisions {
            let key = text::normalize_name(&entity.name);
            // Another writer may have created it while we were scoring.
            if let Some(existing) = store.find_entity_by_name(deal_id, &entity.name)? {
                resolved.insert(key, existing.id);
                continue;
            }
            match merge_into {
                Some(id) => {
                    store.add_entity_alias(&id, &entity.name)?;
                    debug!("Merged entity '{}' into {}", entity.name, id);
                    resolved.insert(key, id);
                }
                None => {
                    let created = Entity {
                        id: generate_entity_id(),
                        deal_id: deal_id.to_string(),
                        name: entity.name.clone(),
                        entity_type: entity.entity_type.clone(),
                        aliases: Vec::new(),
                        created_at: Utc::now().to_rfc3339(),
                    };
                    store.insert_entity(&created)?;
                    resolved.insert(key, created.id);
                }
            }
        }

        Ok(resolved)
    }

    fn write_facts(
        &self,
        store: &FactStore,
        chunk: &Chunk,
        ctx: &ExtractionContext,
        extraction: &Extraction,
        entities: &HashMap<String, EntityId>,
    ) -> Result<WrittenFacts> {
        let mut written = WrittenFacts::default();
        let discovered_at = Utc::now().to_rfc3339();
        let lookup = |entity: &ExtractedEntity| entities.get(&text::normalize_name(&entity.name)).cloned();

        for (ordinal, extracted) in extraction.facts.iter().enumerate() {
            let fact = Fact {
                id: generate_fact_id(),
                deal_id: chunk.deal_id.clone(),
                content: extracted.content.clone(),
                entity_ref: extracted.subject.as_ref().and_then(lookup),
                attribute: extracted.attribute.clone(),
                value: extracted.value.clone(),
                period: extracted.period.clone(),
                topic: extracted.topic.clone(),
                confidence: extracted.confidence.score(),
                source: Source::document(chunk.document_id.clone(), chunk.locator.clone()),
                chunk_id: Some(chunk.chunk_id.clone()),
                extraction_key: Some(format!(
                    "{}:{}:{}",
                    chunk.chunk_id, ctx.pipeline_version, ordinal
                )),
                discovered_at: discovered_at.clone(),
                status: FactStatus::Unvalidated,
            };

            let insert = store.insert_fact(&fact)?;
            let fact_id = insert.fact_id().clone();
            written.facts.push(fact_id.clone());
            if !insert.is_new() {
                continue;
            }
            written.new_facts += 1;

            let fact_node = NodeRef::Fact(fact_id.clone());
            store.insert_relationship(
                RelationKind::ExtractedFrom,
                &fact_node,
                &NodeRef::Chunk(chunk.chunk_id.clone()),
                None,
            )?;

            let related: HashSet<EntityId> = extracted
                .subject
                .iter()
                .chain(extracted.mentions.iter())
                .filter_map(lookup)
                .collect();
            for entity_id in related {
                store.insert_relationship(
                    RelationKind::RelatedTo,
                    &fact_node,
                    &NodeRef::Entity(entity_id),
                    None,
                )?;
            }

            store.store_fact_embedding(&fact_id, &self.embedder.embed(&fact.content))?;
        }

        Ok(written)
    }

    /// Rank facts and entities for `query` by keyword rank, embedding
    /// similarity and one-hop traversal from matched entities.
    ///
    /// Returns up to `limit` facts plus up to `limit` entities, so entity
    /// matches never take the place of facts.
    pub async fn query(
        &self,
        query: &str,
        filters: &QueryFilters,
        limit: usize,
    ) -> Result<Vec<GraphHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let store = self.store.lock().await;
        let deal_id = filters.deal_id.as_deref();
        let fetch = limit.saturating_mul(3).max(10);

        let mut facts: HashMap<FactId, Fact> = HashMap::new();
        let mut keyword: HashMap<FactId, f32> = HashMap::new();
        for (fact, score) in store.search_facts(query, deal_id, fetch)? {
            keyword.insert(fact.id.clone(), score);
            facts.insert(fact.id.clone(), fact);
        }

        let query_vector = self.embedder.embed(query);
        let mut vector: Vec<(FactId, f32)> = store
            .fact_embeddings(deal_id)?
            .into_iter()
            .map(|(id, v)| {
                let score = cosine_similarity(&query_vector, &v);
                (id, score)
            })
            .filter(|(_, score)| *score >= MIN_VECTOR_SIMILARITY)
            .collect();
        vector.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        vector.truncate(fetch);
        let vector: HashMap<FactId, f32> = vector.into_iter().collect();

        let matched_entities = store.search_entities(query, deal_id)?;
        let mut traversal: HashMap<FactId, f32> = HashMap::new();
        for entity in &matched_entities {
            let strength = entity_match_strength(query, entity);
            for fact in store.facts_by_entity(&entity.id, fetch)? {
                let slot = traversal.entry(fact.id.clone()).or_insert(0.0);
                *slot = slot.max(strength);
                facts.entry(fact.id.clone()).or_insert(fact);
            }
        }

        for id in vector.keys() {
            if !facts.contains_key(id) {
                if let Some(fact) = store.get_fact(id)? {
                    facts.insert(id.clone(), fact);
                }
            }
        }

        let allowed = match &filters.entity {
            Some(name) => Some(facts_about_entity(&store, deal_id, name)?),
            None => None,
        };

        let mut hits = Vec::new();
        for (id, fact) in facts {
            if !fact_matches_filters(&fact, filters) {
                continue;
            }
            if let Some(allowed) = &allowed {
                if !allowed.contains(&id) {
                    continue;
                }
            }
            let score = KEYWORD_WEIGHT * keyword.get(&id).copied().unwrap_or(0.0)
                + VECTOR_WEIGHT * vector.get(&id).copied().unwrap_or(0.0)
                + TRAVERSAL_WEIGHT * traversal.get(&id).copied().unwrap_or(0.0);
            if score <= 0.0 {
                continue;
            }

            let relationships = store.relationships_for(&NodeRef::Fact(id.clone()))?;
            hits.push(GraphHit {
                provenance: vec![fact.source.clone()],
                node: GraphNode::Fact(fact),
                score,
                relationships,
            });
        }

        sort_hits(&mut hits);
        hits.truncate(limit);
        let fact_count = hits.len();

        if filters.entity.is_none() && filters.domain.is_none() && filters.document_id.is_none() {
            let mut entities: Vec<_> = matched_entities
                .into_iter()
                .map(|entity| (TRAVERSAL_WEIGHT * entity_match_strength(query, &entity), entity))
                .collect();
            entities.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            entities.truncate(limit);
            for (score, entity) in entities {
                let provenance = entity_provenance(&store, &entity.id)?;
                let relationships = store.relationships_for(&NodeRef::Entity(entity.id.clone()))?;
                hits.push(GraphHit {
                    score,
                    node: GraphNode::Entity(entity),
                    provenance,
                    relationships,
                });
            }
            sort_hits(&mut hits);
        }

        debug!(
            "Graph query '{}' returned {} facts, {} entities",
            query,
            fact_count,
            hits.len() - fact_count
        );
        Ok(hits)
    }
}

fn sort_hits(hits: &mut [GraphHit]) {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

#[derive(Debug, Default)]
struct WrittenFacts {
    facts: Vec<FactId>,
    new_facts: usize,
}

fn fact_matches_filters(fact: &Fact, filters: &QueryFilters) -> bool {
    if fact.is_superseded() && !filters.include_superseded {
        return false;
    }
    if let Some(deal_id) = &filters.deal_id {
        if &fact.deal_id != deal_id {
            return false;
        }
    }
    if let Some(domain) = &filters.domain {
        if !fact.topic.eq_ignore_ascii_case(domain) {
            return false;
        }
    }
    if let Some(document_id) = &filters.document_id {
        if &fact.source.document_id != document_id {
            return false;
        }
    }
    if filters.time_range.is_some()
        && !periods_overlap(fact.period.as_ref(), filters.time_range.as_ref())
    {
        return false;
    }
    true
}

/// Facts linked to the named entity (as subject or mention).
fn facts_about_entity(store: &FactStore, deal_id: Option<&str>, name: &str) -> Result<HashSet<FactId>> {
    let normalized = text::normalize_name(name);
    let entities = match deal_id {
        Some(deal_id) => store.find_entity_by_name(deal_id, name)?.into_iter().collect(),
        None => store
            .search_entities(name, None)?
            .into_iter()
            .filter(|e| {
                text::normalize_name(&e.name) == normalized
                    || e.aliases.iter().any(|a| text::normalize_name(a) == normalized)
            })
            .collect::<Vec<_>>(),
    };

    let mut ids = HashSet::new();
    for entity in entities {
        for rel in store.relationships_for(&NodeRef::Entity(entity.id.clone()))? {
            if let (RelationKind::RelatedTo, NodeRef::Fact(fact_id)) = (rel.kind, &rel.source) {
                ids.insert(fact_id.clone());
            }
        }
    }
    Ok(ids)
}

fn entity_provenance(store: &FactStore, entity_id: &EntityId) -> Result<Vec<Source>> {
    let mut sources: Vec<Source> = Vec::new();
    for fact in store.facts_by_entity(entity_id, 5)? {
        if !sources.contains(&fact.source) {
            sources.push(fact.source);
        }
    }
    Ok(sources)
}

fn entity_match_strength(query: &str, entity: &Entity) -> f32 {
    std::iter::once(&entity.name)
        .chain(entity.aliases.iter())
        .map(|name| {
            let name_tokens = text::tokenize(name);
            if name_tokens.is_empty() {
                return 0.0;
            }
            let query_tokens: HashSet<String> = text::tokenize(query).into_iter().collect();
            let hit = name_tokens.iter().filter(|t| query_tokens.contains(*t)).count();
            hit as f32 / name_tokens.len() as f32
        })
        .fold(0.0, f32::max)
}

/// Lowercased file stem with correction markers removed, and whether any were present.
pub fn document_stem(name: &str) -> (String, bool) {
    let lowered = name.to_lowercase();
    let stem = match lowered.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= 5 => stem.to_string(),
        _ => lowered,
    };

    let mut marked = false;
    let tokens: Vec<&str> = stem
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| {
            let is_marker = CORRECTION_MARKERS.contains(t);
            marked |= is_marker;
            !is_marker
        })
        .collect();

    (tokens.join("_"), marked)
}

/// Find the earlier document this chunk's document corrects, and record the
/// document supersession. Signals: an explicit `supersedes_document` hint, a
/// correction marker in the file name, or a correction statement in the text;
/// the latter two only when an earlier document of the deal has the same stem.
fn detect_correction(store: &FactStore, chunk: &Chunk, extraction: &Extraction) -> Result<Option<String>> {
    let target = match &chunk.supersedes_document {
        Some(old) => Some((old.clone(), "supersedes hint")),
        None => {
            let (stem, marked) = chunk
                .document_name
                .as_deref()
                .map(document_stem)
                .unwrap_or_default();
            if stem.is_empty() || !(marked || extraction.correction_signal) {
                None
            } else {
                let reason = if marked {
                    "correction marker in file name"
                } else {
                    "correction statement in text"
                };
                store
                    .documents_for_deal(&chunk.deal_id)?
                    .into_iter()
                    .filter(|doc| doc.document_id != chunk.document_id)
                    .find(|doc| {
                        doc.name
                            .as_deref()
                            .map(|name| document_stem(name).0 == stem)
                            .unwrap_or(false)
                    })
                    .map(|doc| (doc.document_id, reason))
            }
        }
    };

    let Some((old_document, reason)) = target else {
        return Ok(None);
    };

    match store.record_document_supersession(&chunk.deal_id, &chunk.document_id, &old_document, Some(reason)) {
        Ok(_) => Ok(Some(old_document)),
        Err(EngineError::InvariantViolation(msg)) | Err(EngineError::InvalidInput(msg)) => {
            warn!("Ignoring correction signal on {}: {}", chunk.document_id, msg);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
