#![allow(dead_code)]

use chrono::Utc;
use deal_memory_composer::KnowledgeEngine;
use deal_memory_indexing::FastPathIndex;
use deal_memory_ingestion::{
    DealFactExtractor, EngineConfig, ExtractionConfig, ExtractionWorker, FactStore,
    HeuristicScorer, SharedStore,
};
use deal_memory_schemas::{generate_chunk_id, Chunk, QueryFilters, QueryRequest};
use std::sync::Arc;

pub const DEAL: &str = "deal_acme";

/// Engine over in-memory stores with the deterministic heuristic scorer.
pub fn engine() -> (KnowledgeEngine, ExtractionWorker) {
    engine_with_store(FactStore::open_in_memory().unwrap().into_shared())
}

pub fn engine_with_store(store: SharedStore) -> (KnowledgeEngine, ExtractionWorker) {
    let config = EngineConfig {
        extraction: ExtractionConfig {
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            use_llm: false,
        },
        ..EngineConfig::default()
    };
    KnowledgeEngine::from_parts(
        config,
        store,
        FastPathIndex::open_in_memory().unwrap().into_shared(),
        Arc::new(DealFactExtractor::heuristic_only()),
        Arc::new(HeuristicScorer::new()),
    )
}

pub fn chunk(document_id: &str, name: &str, text: &str) -> Chunk {
    Chunk {
        chunk_id: generate_chunk_id(),
        deal_id: DEAL.into(),
        document_id: document_id.into(),
        document_name: Some(name.into()),
        locator: deal_memory_schemas::Locator::Page { page: 1 },
        text: text.into(),
        mime: Some("application/pdf".into()),
        supersedes_document: None,
        received_at: Utc::now().to_rfc3339(),
    }
}

pub fn query(text: &str) -> QueryRequest {
    QueryRequest {
        text: text.into(),
        filters: QueryFilters {
            deal_id: Some(DEAL.into()),
            ..Default::default()
        },
        limit: 10,
    }
}

/// Ingest on both tiers and run deep extraction to completion.
pub async fn ingest_and_extract(
    engine: &KnowledgeEngine,
    worker: &mut ExtractionWorker,
    chunk: Chunk,
) -> anyhow::Result<()> {
    engine.ingest_chunk(chunk).await?;
    worker.drain().await;
    Ok(())
}
