//! Contradiction and supersession detection.
//!
//! Runs after every fact write. Candidates are the active facts about the
//! same deal, entity and attribute; each pair is classified in order:
//!
//! 1. periods do not overlap: both facts are valid
//! 2. a document supersession path links the sources: the older side is superseded
//! 3. values differ beyond tolerance and sources differ: CONTRADICTS
//! 4. otherwise: SUPPORTS
//!
//! Contradictions are never resolved here. They stay `contradicted` until
//! [`ConsistencyEngine::resolve_contradiction`] is called.

use chrono::Utc;
use deal_memory_schemas::{
    generate_resolution_id, periods_overlap, ContradictionResolution, Fact, FactId, FactStatus,
    NodeRef, RelationKind, ResolutionDecision, SourceKind,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ConsistencyConfig;
use crate::database::{FactStore, SharedStore};
use crate::error::{EngineError, Result};
use crate::invalidation::Invalidation;
use crate::scoring::ScoringService;

/// How the source documents of two facts are ordered by corrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentOrder {
    Unrelated,
    FirstSupersedesSecond,
    SecondSupersedesFirst,
}

/// Classification of one fact pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PairVerdict {
    /// Different time windows.
    ValidBoth,
    Supersedes { newer: FactId, older: FactId },
    Contradicts,
    /// `corroborates` is false when the values differ but come from one source.
    Supports { corroborates: bool },
}

/// Result of checking one fact against its candidates.
#[derive(Debug, Clone)]
pub struct ConsistencyOutcome {
    pub fact_id: FactId,
    pub status: FactStatus,
    pub verdicts: Vec<(FactId, PairVerdict)>,
    pub invalidation: Invalidation,
}

#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub resolution: ContradictionResolution,
    pub invalidation: Invalidation,
}

pub struct ConsistencyEngine {
    config: ConsistencyConfig,
    scorer: Arc<dyn ScoringService>,
}

impl ConsistencyEngine {
    pub fn new(config: ConsistencyConfig, scorer: Arc<dyn ScoringService>) -> Self {
        Self { config, scorer }
    }

    pub fn config(&self) -> &ConsistencyConfig {
        &self.config
    }

    /// Classify a pair of facts about the same subject.
    pub async fn classify(
        &self,
        first: &Fact,
        second: &Fact,
        order: DocumentOrder,
    ) -> Result<PairVerdict> {
        if !periods_overlap(first.period.as_ref(), second.period.as_ref()) {
            return Ok(PairVerdict::ValidBoth);
        }

        match order {
            DocumentOrder::FirstSupersedesSecond => {
                return Ok(PairVerdict::Supersedes {
                    newer: first.id.clone(),
                    older: second.id.clone(),
                })
            }
            DocumentOrder::SecondSupersedesFirst => {
                return Ok(PairVerdict::Supersedes {
                    newer: second.id.clone(),
                    older: first.id.clone(),
                })
            }
            DocumentOrder::Unrelated => {}
        }

        let differ = self.values_differ(first, second).await?;
        if differ && !same_source(first, second) {
            Ok(PairVerdict::Contradicts)
        } else {
            Ok(PairVerdict::Supports {
                corroborates: !differ,
            })
        }
    }

    async fn values_differ(&self, a: &Fact, b: &Fact) -> Result<bool> {
        if let (Some(x), Some(y)) = (&a.value, &b.value) {
            if let Some(diff) = x.relative_difference(y) {
                return Ok(diff > self.config.numeric_tolerance);
            }
        }
        let score = self.scorer.conflict_score(a, b).await?;
        Ok(score >= self.config.text_conflict_threshold)
    }

    /// Check a freshly written fact against existing facts about its subject.
    ///
    /// Candidates are gathered under the store lock, scored without it, and the
    /// resulting edges are written in one transaction after re-reading state.
    pub async fn check_fact(
        &self,
        store: &SharedStore,
        fact_id: &FactId,
    ) -> Result<ConsistencyOutcome> {
        let (fact, candidates) = {
            let store = store.lock().await;
            let fact = store.require_fact(fact_id)?;
            let candidates = gather_candidates(&store, &fact)?;
            (fact, candidates)
        };

        if fact.is_superseded() || fact.entity_ref.is_none() {
            return Ok(ConsistencyOutcome {
                fact_id: fact.id.clone(),
                status: fact.status,
                verdicts: Vec::new(),
                invalidation: Invalidation::default(),
            });
        }

        let mut verdicts = Vec::with_capacity(candidates.len());
        for (candidate, order) in &candidates {
            let verdict = self.classify(&fact, candidate, *order).await?;
            debug!(
                "Consistency {} vs {}: {:?}",
                fact.id, candidate.id, verdict
            );
            verdicts.push((candidate.id.clone(), verdict));
        }

        let store = store.lock().await;
        let (status, invalidation) =
            store.transaction(|store| self.apply_verdicts(store, fact_id, &verdicts))?;

        Ok(ConsistencyOutcome {
            fact_id: fact_id.clone(),
            status,
            verdicts,
            invalidation,
        })
    }

    fn apply_verdicts(
        &self,
        store: &FactStore,
        fact_id: &FactId,
        verdicts: &[(FactId, PairVerdict)],
    ) -> Result<(FactStatus, Invalidation)> {
        let mut invalidation = Invalidation::default();
        let mut contradicted = false;

        let fact = store.require_fact(fact_id)?;
        invalidation.touch(&fact);

        for (candidate_id, verdict) in verdicts {
            let fact = store.require_fact(fact_id)?;
            if fact.is_superseded() {
                break;
            }
            let candidate = store.require_fact(candidate_id)?;
            if candidate.is_superseded() {
                continue;
            }

            match verdict {
                PairVerdict::ValidBoth => {}
                PairVerdict::Supersedes { newer, older } => {
                    let (newer, older) = if newer == &fact.id {
                        (&fact, &candidate)
                    } else {
                        (&candidate, &fact)
                    };
                    if self.supersede_by_document(store, newer, older)? {
                        invalidation.touch(newer);
                        invalidation.touch(older);
                    }
                }
                PairVerdict::Contradicts => {
                    if already_resolved(store, &fact.id, &candidate.id)? {
                        continue;
                    }
                    self.flag_contradiction(store, &fact, &candidate)?;
                    contradicted = true;
                    invalidation.touch(&candidate);
                }
                PairVerdict::Supports { corroborates } => {
                    let existing =
                        store.relationships_between(RelationKind::Supports, &fact.id, &candidate.id)?;
                    if !existing.is_empty() {
                        continue;
                    }
                    store.insert_relationship(
                        RelationKind::Supports,
                        &NodeRef::Fact(fact.id.clone()),
                        &NodeRef::Fact(candidate.id.clone()),
                        Some("same subject and period, values agree"),
                    )?;
                    if *corroborates {
                        let boost = self.config.corroboration_boost;
                        store.update_fact_confidence(&fact.id, fact.confidence + boost)?;
                        store.update_fact_confidence(&candidate.id, candidate.confidence + boost)?;
                    }
                    invalidation.touch(&candidate);
                }
            }
        }

        let fact = store.require_fact(fact_id)?;
        let status = match fact.status {
            FactStatus::Superseded => FactStatus::Superseded,
            FactStatus::Contradicted => FactStatus::Contradicted,
            _ if contradicted => FactStatus::Contradicted,
            _ => FactStatus::Validated,
        };
        if status != fact.status {
            store.update_fact_status(&fact.id, status)?;
        }

        Ok((status, invalidation))
    }

    /// Supersession triggered by a document correction. Contradicted facts are
    /// left alone, as are facts that already have a superseding parent.
    fn supersede_by_document(&self, store: &FactStore, newer: &Fact, older: &Fact) -> Result<bool> {
        if older.status == FactStatus::Contradicted {
            info!(
                "Fact {} is contradicted; not superseding it automatically by {}",
                older.id, newer.id
            );
            return Ok(false);
        }
        if !store.incoming_supersedes(&older.id)?.is_empty() {
            debug!("Fact {} already has a superseding fact", older.id);
            return Ok(false);
        }
        if store.supersedes_path_exists(&older.id, &newer.id)? {
            warn!(
                "Skipping supersession of {} by {}: would create a cycle",
                older.id, newer.id
            );
            return Ok(false);
        }

        let rationale = format!(
            "document {} corrects {}",
            newer.source.document_id, older.source.document_id
        );
        store.insert_relationship(
            RelationKind::Supersedes,
            &NodeRef::Fact(newer.id.clone()),
            &NodeRef::Fact(older.id.clone()),
            Some(&rationale),
        )?;
        Ok(true)
    }

    fn flag_contradiction(&self, store: &FactStore, fact: &Fact, other: &Fact) -> Result<()> {
        let existing = store.relationships_between(RelationKind::Contradicts, &fact.id, &other.id)?;
        if existing.is_empty() {
            let rationale = format!(
                "{} ({}) vs {} ({})",
                describe_value(fact),
                fact.source.document_id,
                describe_value(other),
                other.source.document_id
            );
            store.insert_relationship(
                RelationKind::Contradicts,
                &NodeRef::Fact(fact.id.clone()),
                &NodeRef::Fact(other.id.clone()),
                Some(&rationale),
            )?;

            let penalty = self.config.contest_penalty;
            store.update_fact_confidence(&fact.id, fact.confidence * penalty)?;
            store.update_fact_confidence(&other.id, other.confidence * penalty)?;
            info!("Contradiction flagged between {} and {}", fact.id, other.id);
        }

        store.update_fact_status(&fact.id, FactStatus::Contradicted)?;
        store.update_fact_status(&other.id, FactStatus::Contradicted)?;
        Ok(())
    }

    /// Mark `older` as superseded by `newer` on an explicit signal: an analyst
    /// correction or a contradiction resolution.
    pub async fn supersede(
        &self,
        store: &SharedStore,
        newer: &FactId,
        older: &FactId,
        rationale: &str,
    ) -> Result<Invalidation> {
        let store = store.lock().await;
        store.transaction(|store| supersede_explicit(store, newer, older, rationale))
    }

    /// Apply an external decision to a contradicted pair and record it.
    pub async fn resolve_contradiction(
        &self,
        store: &SharedStore,
        fact_a: &FactId,
        fact_b: &FactId,
        decision: ResolutionDecision,
        note: Option<String>,
    ) -> Result<ResolutionOutcome> {
        let store = store.lock().await;
        store.transaction(|store| {
            let a = store.require_fact(fact_a)?;
            let b = store.require_fact(fact_b)?;
            if store
                .relationships_between(RelationKind::Contradicts, &a.id, &b.id)?
                .is_empty()
            {
                return Err(EngineError::InvalidInput(format!(
                    "facts {} and {} are not in contradiction",
                    a.id, b.id
                )));
            }
            if already_resolved(store, &a.id, &b.id)? {
                return Err(EngineError::InvalidInput(format!(
                    "contradiction between {} and {} is already resolved",
                    a.id, b.id
                )));
            }

            let (newer, older) = if (a.discovered_at.as_str(), a.id.0.as_str())
                >= (b.discovered_at.as_str(), b.id.0.as_str())
            {
                (&a, &b)
            } else {
                (&b, &a)
            };

            let resolution = ContradictionResolution {
                id: generate_resolution_id(),
                fact_a: a.id.clone(),
                fact_b: b.id.clone(),
                decision,
                note: note.clone(),
                resolved_at: Utc::now().to_rfc3339(),
            };
            store.record_resolution(&resolution)?;

            let mut invalidation = Invalidation::default();
            invalidation.touch(&a);
            invalidation.touch(&b);

            match decision {
                ResolutionDecision::AcceptNew => {
                    supersede_explicit(store, &newer.id, &older.id, "analyst accepted newer value")?;
                    settle_status(store, &newer.id)?;
                }
                ResolutionDecision::KeepOld => {
                    supersede_explicit(store, &older.id, &newer.id, "analyst kept earlier value")?;
                    settle_status(store, &older.id)?;
                }
                ResolutionDecision::AcceptableDifference => {
                    store.insert_relationship(
                        RelationKind::RelatedTo,
                        &NodeRef::Fact(a.id.clone()),
                        &NodeRef::Fact(b.id.clone()),
                        Some(note.as_deref().unwrap_or("acceptable difference")),
                    )?;
                    settle_status(store, &a.id)?;
                    settle_status(store, &b.id)?;
                }
            }

            info!(
                "Resolved contradiction {} / {} as {}",
                a.id,
                b.id,
                decision.as_str()
            );
            Ok(ResolutionOutcome {
                resolution,
                invalidation,
            })
        })
    }
}

fn gather_candidates(store: &FactStore, fact: &Fact) -> Result<Vec<(Fact, DocumentOrder)>> {
    let Some(entity_id) = &fact.entity_ref else {
        return Ok(Vec::new());
    };

    let mut candidates = Vec::new();
    for candidate in store.facts_for_subject(&fact.deal_id, entity_id, fact.attribute.as_deref())? {
        if candidate.id == fact.id || candidate.is_superseded() {
            continue;
        }
        let order = document_order(store, fact, &candidate)?;
        candidates.push((candidate, order));
    }
    Ok(candidates)
}

fn document_order(store: &FactStore, first: &Fact, second: &Fact) -> Result<DocumentOrder> {
    let (a, b) = (&first.source.document_id, &second.source.document_id);
    if first.source.kind != SourceKind::Document
        || second.source.kind != SourceKind::Document
        || a == b
    {
        return Ok(DocumentOrder::Unrelated);
    }
    if store.document_supersedes(a, b)? {
        Ok(DocumentOrder::FirstSupersedesSecond)
    } else if store.document_supersedes(b, a)? {
        Ok(DocumentOrder::SecondSupersedesFirst)
    } else {
        Ok(DocumentOrder::Unrelated)
    }
}

/// Two conversation assertions are distinct sources unless they came from one message.
fn same_source(a: &Fact, b: &Fact) -> bool {
    a.source.kind == b.source.kind
        && a.source.document_id == b.source.document_id
        && (a.source.kind == SourceKind::Document || a.source.locator == b.source.locator)
}

fn already_resolved(store: &FactStore, a: &FactId, b: &FactId) -> Result<bool> {
    Ok(store
        .resolutions_for(a)?
        .iter()
        .any(|r| (&r.fact_a == a && &r.fact_b == b) || (&r.fact_a == b && &r.fact_b == a)))
}

fn supersede_explicit(
    store: &FactStore,
    newer: &FactId,
    older: &FactId,
    rationale: &str,
) -> Result<Invalidation> {
    let newer_fact = store.require_fact(newer)?;
    let older_fact = store.require_fact(older)?;
    if newer_fact.deal_id != older_fact.deal_id {
        return Err(EngineError::InvalidInput(format!(
            "facts {} and {} belong to different deals",
            newer, older
        )));
    }

    store.insert_relationship(
        RelationKind::Supersedes,
        &NodeRef::Fact(newer.clone()),
        &NodeRef::Fact(older.clone()),
        Some(rationale),
    )?;

    let mut invalidation = Invalidation::default();
    invalidation.touch(&newer_fact);
    invalidation.touch(&older_fact);
    Ok(invalidation)
}

/// Validate a fact unless it is superseded or still has an open contradiction.
fn settle_status(store: &FactStore, fact_id: &FactId) -> Result<()> {
    let fact = store.require_fact(fact_id)?;
    if fact.is_superseded() {
        return Ok(());
    }

    for rel in store.relationships_for(&NodeRef::Fact(fact_id.clone()))? {
        if rel.kind != RelationKind::Contradicts {
            continue;
        }
        let other = if rel.source == NodeRef::Fact(fact_id.clone()) {
            &rel.target
        } else {
            &rel.source
        };
        let NodeRef::Fact(other_id) = other else {
            continue;
        };
        let other_fact = store.require_fact(other_id)?;
        if !other_fact.is_superseded() && !already_resolved(store, fact_id, other_id)? {
            debug!("Fact {} still contradicts {}", fact_id, other_id);
            return Ok(());
        }
    }

    store.update_fact_status(fact_id, FactStatus::Validated)
}

fn describe_value(fact: &Fact) -> String {
    match &fact.value {
        Some(value) => value.to_string(),
        None => fact.content.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::HeuristicScorer;
    use deal_memory_schemas::{
        generate_entity_id, generate_fact_id, Entity, EntityId, EntityType, FactValue,
        KnownEntityType, Locator, Period, Source,
    };

    fn engine() -> ConsistencyEngine {
        ConsistencyEngine::new(ConsistencyConfig::default(), Arc::new(HeuristicScorer::new()))
    }

    fn store_with_entity() -> (SharedStore, EntityId) {
        let store = FactStore::open_in_memory().unwrap();
        let entity = Entity {
            id: generate_entity_id(),
            deal_id: "deal_1".into(),
            name: "revenue".into(),
            entity_type: EntityType::known(KnownEntityType::Metric),
            aliases: vec![],
            created_at: Utc::now().to_rfc3339(),
        };
        store.insert_entity(&entity).unwrap();
        (store.into_shared(), entity.id)
    }

    fn revenue_fact(
        entity: &EntityId,
        amount: f64,
        period: Option<Period>,
        document: &str,
        discovered_at: &str,
    ) -> Fact {
        let value = FactValue::Numeric {
            amount,
            unit: None,
        };
        Fact {
            id: generate_fact_id(),
            deal_id: "deal_1".into(),
            content: format!("revenue = {}", value),
            entity_ref: Some(entity.clone()),
            attribute: Some("revenue".into()),
            value: Some(value),
            period,
            topic: "financials".into(),
            confidence: 0.7,
            source: Source::document(document, Locator::Page { page: 1 }),
            chunk_id: None,
            extraction_key: None,
            discovered_at: discovered_at.into(),
            status: FactStatus::Unvalidated,
        }
    }

    async fn insert(store: &SharedStore, fact: &Fact) {
        store.lock().await.insert_fact(fact).unwrap();
    }

    #[tokio::test]
    async fn test_contradiction_flags_both_facts() {
        let (store, entity) = store_with_entity();
        let engine = engine();
        let q3 = Period::quarter(3, Some(2024));

        let deck = revenue_fact(&entity, 5_200_000.0, q3.clone(), "deck", "2025-01-01T00:00:00Z");
        insert(&store, &deck).await;
        let first = engine.check_fact(&store, &deck.id).await.unwrap();
        assert_eq!(first.status, FactStatus::Validated);

        let audit = revenue_fact(&entity, 5_000_000.0, q3, "audit", "2025-01-02T00:00:00Z");
        insert(&store, &audit).await;
        let outcome = engine.check_fact(&store, &audit.id).await.unwrap();

        assert_eq!(outcome.status, FactStatus::Contradicted);
        assert_eq!(outcome.verdicts, vec![(deck.id.clone(), PairVerdict::Contradicts)]);
        assert!(outcome.invalidation.facts.contains(&deck.id));

        let guard = store.lock().await;
        assert_eq!(guard.require_fact(&deck.id).unwrap().status, FactStatus::Contradicted);
        let edges = guard
            .relationships_between(RelationKind::Contradicts, &deck.id, &audit.id)
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert!(guard.require_fact(&deck.id).unwrap().confidence < 0.7);
    }

    #[tokio::test]
    async fn test_different_periods_are_both_valid() {
        let (store, entity) = store_with_entity();
        let engine = engine();

        let fy23 = revenue_fact(&entity, 4_000_000.0, Period::year(2023), "deck", "2025-01-01T00:00:00Z");
        let fy24 = revenue_fact(&entity, 5_000_000.0, Period::year(2024), "audit", "2025-01-02T00:00:00Z");
        insert(&store, &fy23).await;
        engine.check_fact(&store, &fy23.id).await.unwrap();
        insert(&store, &fy24).await;
        let outcome = engine.check_fact(&store, &fy24.id).await.unwrap();

        assert_eq!(outcome.status, FactStatus::Validated);
        assert_eq!(outcome.verdicts[0].1, PairVerdict::ValidBoth);
        let guard = store.lock().await;
        assert!(guard
            .relationships_between(RelationKind::Contradicts, &fy23.id, &fy24.id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_document_correction_supersedes() {
        let (store, entity) = store_with_entity();
        let engine = engine();
        let q3 = Period::quarter(3, Some(2024));

        let old = revenue_fact(&entity, 5_200_000.0, q3.clone(), "report", "2025-01-01T00:00:00Z");
        insert(&store, &old).await;
        engine.check_fact(&store, &old.id).await.unwrap();

        store
            .lock()
            .await
            .record_document_supersession("deal_1", "report_corrected", "report", None)
            .unwrap();

        let new = revenue_fact(&entity, 5_000_000.0, q3, "report_corrected", "2025-01-02T00:00:00Z");
        insert(&store, &new).await;
        let outcome = engine.check_fact(&store, &new.id).await.unwrap();

        assert_eq!(outcome.status, FactStatus::Validated);
        let guard = store.lock().await;
        assert_eq!(guard.require_fact(&old.id).unwrap().status, FactStatus::Superseded);
        assert_eq!(guard.incoming_supersedes(&old.id).unwrap(), vec![new.id.clone()]);
        assert!(guard.check_invariants().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_late_arriving_older_document_is_superseded() {
        let (store, entity) = store_with_entity();
        let engine = engine();
        let q3 = Period::quarter(3, Some(2024));

        store
            .lock()
            .await
            .record_document_supersession("deal_1", "report_corrected", "report", None)
            .unwrap();

        let new = revenue_fact(&entity, 5_000_000.0, q3.clone(), "report_corrected", "2025-01-01T00:00:00Z");
        insert(&store, &new).await;
        engine.check_fact(&store, &new.id).await.unwrap();

        let old = revenue_fact(&entity, 5_200_000.0, q3, "report", "2025-01-02T00:00:00Z");
        insert(&store, &old).await;
        let outcome = engine.check_fact(&store, &old.id).await.unwrap();

        assert_eq!(outcome.status, FactStatus::Superseded);
    }

    #[tokio::test]
    async fn test_contradicted_fact_is_not_auto_superseded() {
        let (store, entity) = store_with_entity();
        let engine = engine();
        let q3 = Period::quarter(3, Some(2024));

        let deck = revenue_fact(&entity, 5_200_000.0, q3.clone(), "deck", "2025-01-01T00:00:00Z");
        let audit = revenue_fact(&entity, 5_000_000.0, q3.clone(), "audit", "2025-01-02T00:00:00Z");
        for fact in [&deck, &audit] {
            insert(&store, fact).await;
            engine.check_fact(&store, &fact.id).await.unwrap();
        }

        store
            .lock()
            .await
            .record_document_supersession("deal_1", "deck_v2", "deck", None)
            .unwrap();
        let corrected = revenue_fact(&entity, 5_100_000.0, q3, "deck_v2", "2025-01-03T00:00:00Z");
        insert(&store, &corrected).await;
        engine.check_fact(&store, &corrected.id).await.unwrap();

        let guard = store.lock().await;
        assert_eq!(guard.require_fact(&deck.id).unwrap().status, FactStatus::Contradicted);
        assert!(guard.incoming_supersedes(&deck.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agreeing_facts_support_each_other() {
        let (store, entity) = store_with_entity();
        let engine = engine();
        let q3 = Period::quarter(3, Some(2024));

        let a = revenue_fact(&entity, 5_200_000.0, q3.clone(), "deck", "2025-01-01T00:00:00Z");
        let b = revenue_fact(&entity, 5_210_000.0, q3, "audit", "2025-01-02T00:00:00Z");
        insert(&store, &a).await;
        engine.check_fact(&store, &a.id).await.unwrap();
        insert(&store, &b).await;
        let outcome = engine.check_fact(&store, &b.id).await.unwrap();

        assert_eq!(outcome.status, FactStatus::Validated);
        assert_eq!(
            outcome.verdicts[0].1,
            PairVerdict::Supports { corroborates: true }
        );

        // Re-running the check must not boost twice.
        engine.check_fact(&store, &b.id).await.unwrap();
        let guard = store.lock().await;
        let boosted = guard.require_fact(&a.id).unwrap().confidence;
        assert!((boosted - 0.75).abs() < 1e-5);
        assert_eq!(
            guard
                .relationships_between(RelationKind::Supports, &a.id, &b.id)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_resolve_accept_new() {
        let (store, entity) = store_with_entity();
        let engine = engine();
        let q3 = Period::quarter(3, Some(2024));

        let deck = revenue_fact(&entity, 5_200_000.0, q3.clone(), "deck", "2025-01-01T00:00:00Z");
        let audit = revenue_fact(&entity, 5_000_000.0, q3, "audit", "2025-01-02T00:00:00Z");
        for fact in [&deck, &audit] {
            insert(&store, fact).await;
            engine.check_fact(&store, &fact.id).await.unwrap();
        }

        let outcome = engine
            .resolve_contradiction(&store, &deck.id, &audit.id, ResolutionDecision::AcceptNew, None)
            .await
            .unwrap();
        assert_eq!(outcome.resolution.decision, ResolutionDecision::AcceptNew);

        let guard = store.lock().await;
        assert_eq!(guard.require_fact(&deck.id).unwrap().status, FactStatus::Superseded);
        assert_eq!(guard.require_fact(&audit.id).unwrap().status, FactStatus::Validated);
        assert_eq!(guard.resolutions_for(&deck.id).unwrap().len(), 1);
        assert!(guard.check_invariants().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_acceptable_difference() {
        let (store, entity) = store_with_entity();
        let engine = engine();
        let q3 = Period::quarter(3, Some(2024));

        let deck = revenue_fact(&entity, 5_200_000.0, q3.clone(), "deck", "2025-01-01T00:00:00Z");
        let audit = revenue_fact(&entity, 5_000_000.0, q3, "audit", "2025-01-02T00:00:00Z");
        for fact in [&deck, &audit] {
            insert(&store, fact).await;
            engine.check_fact(&store, &fact.id).await.unwrap();
        }

        engine
            .resolve_contradiction(
                &store,
                &audit.id,
                &deck.id,
                ResolutionDecision::AcceptableDifference,
                Some("audit adjustment".into()),
            )
            .await
            .unwrap();

        // A repeated check must not re-flag a resolved pair.
        engine.check_fact(&store, &audit.id).await.unwrap();

        let guard = store.lock().await;
        assert_eq!(guard.require_fact(&deck.id).unwrap().status, FactStatus::Validated);
        assert_eq!(guard.require_fact(&audit.id).unwrap().status, FactStatus::Validated);
        assert_eq!(
            guard
                .relationships_between(RelationKind::RelatedTo, &deck.id, &audit.id)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_resolve_requires_contradiction() {
        let (store, entity) = store_with_entity();
        let engine = engine();

        let a = revenue_fact(&entity, 4_000_000.0, Period::year(2023), "deck", "2025-01-01T00:00:00Z");
        let b = revenue_fact(&entity, 5_000_000.0, Period::year(2024), "audit", "2025-01-02T00:00:00Z");
        insert(&store, &a).await;
        insert(&store, &b).await;

        let err = engine
            .resolve_contradiction(&store, &a.id, &b.id, ResolutionDecision::KeepOld, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_explicit_supersede_refuses_second_parent() {
        let (store, entity) = store_with_entity();
        let engine = engine();
        let q3 = Period::quarter(3, Some(2024));

        let old = revenue_fact(&entity, 5.0, q3.clone(), "deck", "2025-01-01T00:00:00Z");
        let first = revenue_fact(&entity, 5.1, q3.clone(), "conversation", "2025-01-02T00:00:00Z");
        let second = revenue_fact(&entity, 5.2, q3, "audit", "2025-01-03T00:00:00Z");
        for fact in [&old, &first, &second] {
            insert(&store, fact).await;
        }

        engine.supersede(&store, &first.id, &old.id, "correction").await.unwrap();
        let err = engine
            .supersede(&store, &second.id, &old.id, "correction")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_same_document_variance_is_not_a_contradiction() {
        let engine = engine();
        let entity = generate_entity_id();
        let q3 = Period::quarter(3, Some(2024));
        let a = revenue_fact(&entity, 5_200_000.0, q3.clone(), "deck", "2025-01-01T00:00:00Z");
        let b = revenue_fact(&entity, 5_000_000.0, q3, "deck", "2025-01-01T00:00:00Z");

        let verdict = engine.classify(&a, &b, DocumentOrder::Unrelated).await.unwrap();
        assert_eq!(verdict, PairVerdict::Supports { corroborates: false });
    }
}
