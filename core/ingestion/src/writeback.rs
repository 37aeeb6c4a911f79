//! Write-back path for facts asserted in conversation.
//!
//! An asserted fact goes through the same entity resolution and consistency
//! checks as an extracted one. There is no confirmation gate; the fact is
//! distinguishable only by its `conversation` source.

use chrono::{DateTime, Utc};
use deal_memory_schemas::{
    generate_fact_id, periods_overlap, AssertFactRequest, AssertFactResponse, Fact, FactId,
    FactStatus, NodeRef, RelationKind, Source,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::graph::GraphTier;
use crate::heuristic::{ExtractedEntity, HeuristicExtractor};
use crate::invalidation::Invalidation;
use crate::text;

/// Result of one asserted fact.
#[derive(Debug, Clone)]
pub struct AssertOutcome {
    pub fact_id: FactId,
    pub status: FactStatus,
    /// Earlier fact this assertion explicitly corrected.
    pub superseded: Option<FactId>,
    pub invalidation: Invalidation,
}

impl AssertOutcome {
    pub fn to_response(&self) -> AssertFactResponse {
        AssertFactResponse {
            fact_id: self.fact_id.clone(),
            status: self.status,
        }
    }
}

pub struct WriteBackPath {
    graph: Arc<GraphTier>,
    heuristic: HeuristicExtractor,
}

impl WriteBackPath {
    pub fn new(graph: Arc<GraphTier>) -> Self {
        Self {
            graph,
            heuristic: HeuristicExtractor::new(),
        }
    }

    /// Persist an analyst-asserted fact and run it through consistency checks.
    ///
    /// Correction phrasing ("actually", "should be") supersedes the latest
    /// active fact about the same subject and period.
    pub async fn ingest_asserted_fact(&self, request: &AssertFactRequest) -> Result<AssertOutcome> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(EngineError::InvalidInput("asserted fact has no content".into()));
        }
        if request.deal_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("asserted fact has no deal".into()));
        }
        if !(0.0..=1.0).contains(&request.confidence) {
            return Err(EngineError::InvalidInput(format!(
                "confidence {} out of range",
                request.confidence
            )));
        }
        let discovered_at = match &request.discovered_at {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| EngineError::InvalidInput(format!("discovered_at '{}': {}", raw, e)))?
                .with_timezone(&Utc)
                .to_rfc3339(),
            None => Utc::now().to_rfc3339(),
        };

        let parsed = self.heuristic.extract_statement(content);
        let is_correction = self.heuristic.is_correction_statement(content);

        let wanted: Vec<ExtractedEntity> = parsed
            .iter()
            .flat_map(|fact| fact.subject.iter().chain(fact.mentions.iter()))
            .cloned()
            .collect();
        let entities = self.graph.resolve_entities(&request.deal_id, &wanted).await?;
        let lookup = |entity: &ExtractedEntity| entities.get(&text::normalize_name(&entity.name)).cloned();

        let message_id = request
            .message_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", ulid::Ulid::new()));
        let topic = request
            .topic
            .clone()
            .or_else(|| parsed.as_ref().map(|p| p.topic.clone()))
            .unwrap_or_else(|| "general".to_string());

        let fact = Fact {
            id: generate_fact_id(),
            deal_id: request.deal_id.clone(),
            content: content.to_string(),
            entity_ref: parsed.as_ref().and_then(|p| p.subject.as_ref()).and_then(lookup),
            attribute: parsed.as_ref().and_then(|p| p.attribute.clone()),
            value: parsed.as_ref().and_then(|p| p.value.clone()),
            period: parsed.as_ref().and_then(|p| p.period.clone()),
            topic,
            confidence: request.confidence,
            source: Source::conversation(message_id),
            chunk_id: None,
            extraction_key: None,
            discovered_at,
            status: FactStatus::Unvalidated,
        };

        let related: HashSet<_> = parsed
            .iter()
            .flat_map(|p| p.subject.iter().chain(p.mentions.iter()))
            .filter_map(lookup)
            .collect();

        let store = self.graph.store().clone();
        let target = {
            let store = store.lock().await;
            store.transaction(|store| {
                store.insert_fact(&fact)?;
                let node = NodeRef::Fact(fact.id.clone());
                for entity_id in &related {
                    store.insert_relationship(
                        RelationKind::RelatedTo,
                        &node,
                        &NodeRef::Entity(entity_id.clone()),
                        None,
                    )?;
                }
                store.store_fact_embedding(&fact.id, &self.graph.embedder().embed(&fact.content))?;

                if is_correction {
                    correction_target(store, &fact)
                } else {
                    Ok(None)
                }
            })?
        };

        let consistency = self.graph.consistency();
        let mut invalidation = Invalidation::default();
        invalidation.touch(&fact);

        let mut superseded = None;
        if let Some(target) = target {
            match consistency
                .supersede(&store, &fact.id, &target, "analyst correction")
                .await
            {
                Ok(changed) => {
                    invalidation.merge(changed);
                    superseded = Some(target);
                }
                // A concurrent writer got there first; the consistency check relates the two.
                Err(EngineError::InvariantViolation(msg)) => {
                    warn!("Correction by {} not applied: {}", fact.id, msg)
                }
                Err(e) => return Err(e),
            }
        }

        let outcome = consistency.check_fact(&store, &fact.id).await?;
        invalidation.merge(outcome.invalidation);
        self.graph.invalidator().invalidate(&invalidation).await?;

        info!(
            "Asserted fact {} stored as {} (deal {})",
            fact.id,
            outcome.status.as_str(),
            fact.deal_id
        );
        Ok(AssertOutcome {
            fact_id: fact.id,
            status: outcome.status,
            superseded,
            invalidation,
        })
    }
}

/// Latest active fact about the same subject whose period overlaps.
fn correction_target(store: &crate::database::FactStore, fact: &Fact) -> Result<Option<FactId>> {
    let Some(entity_id) = &fact.entity_ref else {
        return Ok(None);
    };
    let target = store
        .facts_for_subject(&fact.deal_id, entity_id, fact.attribute.as_deref())?
        .into_iter()
        .filter(|other| other.id != fact.id && !other.is_superseded())
        .filter(|other| periods_overlap(other.period.as_ref(), fact.period.as_ref()))
        .last()
        .map(|other| other.id);
    Ok(target)
}
