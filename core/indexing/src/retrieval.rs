use chrono::Utc;
use deal_memory_ingestion::{
    EngineError, GraphHit, GraphTier, Result, RetrievalConfig, ScoringService,
};
use deal_memory_schemas::{
    ChunkId, Coverage, QueryRequest, QueryResponse, QueryResultItem, Source, Tier,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ranking::{rank_order, RankingFunction, RecencyWeightedRanking};
use crate::search::{ScoredChunk, SharedFastPath};

const RERANK_WEIGHT: f32 = 0.5;

/// Answers queries from the graph tier first and fills coverage gaps with
/// unverified fast-path hits.
pub struct HybridRetriever {
    graph: Arc<GraphTier>,
    fast_path: SharedFastPath,
    scorer: Arc<dyn ScoringService>,
    ranking: Arc<dyn RankingFunction>,
    config: RetrievalConfig,
    pipeline_version: String,
}

/// A candidate before final scoring.
struct Candidate {
    item: QueryResultItem,
    relevance: f32,
}

impl HybridRetriever {
    pub fn new(
        graph: Arc<GraphTier>,
        fast_path: SharedFastPath,
        scorer: Arc<dyn ScoringService>,
        config: RetrievalConfig,
        pipeline_version: impl Into<String>,
    ) -> Self {
        let ranking = Arc::new(RecencyWeightedRanking::new(config.recency_half_life_days));
        Self {
            graph,
            fast_path,
            scorer,
            ranking,
            config,
            pipeline_version: pipeline_version.into(),
        }
    }

    pub fn with_ranking(mut self, ranking: Arc<dyn RankingFunction>) -> Self {
        self.ranking = ranking;
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(EngineError::InvalidInput("query text is empty".into()));
        }
        let limit = request.limit;
        if limit == 0 {
            return Ok(empty_response());
        }
        let filters = &request.filters;
        let fetch = limit.saturating_mul(self.config.candidate_multiplier.max(1));

        if filters.fast_path_only {
            let chunks = self.fast_path.lock().await.query(text, filters, fetch)?;
            // The fact store is optional on this path: without it chunks are served unfiltered.
            let (superseded, degraded) = match self.superseded_documents(&chunks).await {
                Ok(superseded) => (superseded, false),
                Err(e) => {
                    warn!("Could not check document corrections: {}", e);
                    (HashSet::new(), true)
                }
            };
            let candidates = self.unverified_all(chunks, &superseded, filters.include_superseded);
            let coverage = if candidates.is_empty() {
                Coverage::Empty
            } else {
                Coverage::FastPath
            };
            return Ok(self
                .finish(text, candidates, coverage, 0, degraded, limit)
                .await);
        }

        // Fail closed when the fact store is unreachable.
        self.graph.store().lock().await.ping()?;

        let graph_hits = self.graph.query(text, filters, fetch).await?;
        let mut candidates: Vec<Candidate> = graph_hits
            .into_iter()
            .filter_map(|hit| self.verified(hit))
            .collect();
        let graph_count = candidates.len();

        let mut degraded = false;
        let chunks = match self.fast_path.lock().await.query(text, filters, fetch) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("Fast-path query failed, answering from the graph only: {}", e);
                degraded = true;
                Vec::new()
            }
        };

        let (pending, superseded) = if chunks.is_empty() {
            (HashSet::new(), HashSet::new())
        } else {
            let chunk_ids: Vec<ChunkId> =
                chunks.iter().map(|c| c.chunk.chunk_id.clone()).collect();
            let store = self.graph.store().lock().await;
            let pending = store.incomplete_chunks(&chunk_ids, &self.pipeline_version)?;
            let superseded = store
                .superseded_documents(chunks.iter().map(|c| c.chunk.document_id.as_str()))?;
            (pending, superseded)
        };

        let gap: Vec<ScoredChunk> = if graph_count < self.config.min_graph_results {
            chunks
        } else {
            chunks
                .into_iter()
                .filter(|c| pending.contains(&c.chunk.chunk_id))
                .collect()
        };
        let gap = self.unverified_all(gap, &superseded, filters.include_superseded);
        let gap_count = gap.len();
        candidates.extend(gap);

        let coverage = match (graph_count > 0, gap_count > 0) {
            (true, false) => Coverage::Graph,
            (true, true) => Coverage::Merged,
            (false, true) => Coverage::FastPath,
            (false, false) => Coverage::Empty,
        };
        debug!(
            "Query '{}': {} graph hits, {} fast-path hits, {} chunks pending, {} corrected documents",
            text,
            graph_count,
            gap_count,
            pending.len(),
            superseded.len()
        );

        Ok(self
            .finish(text, candidates, coverage, pending.len(), degraded, limit)
            .await)
    }

    async fn superseded_documents(&self, chunks: &[ScoredChunk]) -> Result<HashSet<String>> {
        if chunks.is_empty() {
            return Ok(HashSet::new());
        }
        self.graph
            .store()
            .lock()
            .await
            .superseded_documents(chunks.iter().map(|c| c.chunk.document_id.as_str()))
    }

    /// Chunks from corrected documents are dropped, or kept and marked
    /// superseded in audit mode.
    fn unverified_all(
        &self,
        chunks: Vec<ScoredChunk>,
        superseded: &HashSet<String>,
        include_superseded: bool,
    ) -> Vec<Candidate> {
        chunks
            .into_iter()
            .filter_map(|c| {
                let corrected = superseded.contains(&c.chunk.document_id);
                if corrected && !include_superseded {
                    return None;
                }
                Some(self.unverified(c, corrected))
            })
            .collect()
    }

    fn verified(&self, hit: GraphHit) -> Option<Candidate> {
        let fact = hit.fact()?.clone();
        let superseded = fact.is_superseded();
        Some(Candidate {
            relevance: hit.score,
            item: QueryResultItem {
                content: fact.content,
                confidence: fact.confidence,
                source: fact.source,
                superseded,
                relationships: hit.relationships,
                fact_id: Some(fact.id),
                chunk_id: fact.chunk_id,
                status: Some(fact.status),
                tier: Tier::DeepGraph,
                verified: true,
                score: 0.0,
                discovered_at: fact.discovered_at,
            },
        })
    }

    fn unverified(&self, hit: ScoredChunk, superseded: bool) -> Candidate {
        let chunk = hit.chunk;
        Candidate {
            relevance: hit.score,
            item: QueryResultItem {
                content: chunk.text,
                confidence: self.config.unverified_confidence,
                source: Source::document(chunk.document_id, chunk.locator),
                superseded,
                relationships: Vec::new(),
                fact_id: None,
                chunk_id: Some(chunk.chunk_id),
                status: None,
                tier: Tier::FastPath,
                verified: false,
                score: 0.0,
                discovered_at: chunk.received_at,
            },
        }
    }

    /// Score, rerank under the timeout, order and truncate.
    async fn finish(
        &self,
        text: &str,
        candidates: Vec<Candidate>,
        coverage: Coverage,
        pending_chunks: usize,
        mut degraded: bool,
        limit: usize,
    ) -> QueryResponse {
        let now = Utc::now();
        let mut items: Vec<QueryResultItem> = candidates
            .into_iter()
            .map(|c| {
                let mut item = c.item;
                item.score = self.ranking.score(&item, c.relevance, now);
                item
            })
            .collect();

        if !items.is_empty() {
            let contents: Vec<String> = items.iter().map(|i| i.content.clone()).collect();
            let timeout = self.config.rerank_timeout();
            match tokio::time::timeout(timeout, self.scorer.rerank(text, &contents)).await {
                Ok(Ok(scores)) if scores.len() == items.len() => {
                    for (item, rerank) in items.iter_mut().zip(scores) {
                        item.score = (1.0 - RERANK_WEIGHT) * item.score + RERANK_WEIGHT * rerank;
                    }
                }
                Ok(Ok(scores)) => {
                    warn!(
                        "Reranker returned {} scores for {} candidates, keeping ranked order",
                        scores.len(),
                        items.len()
                    );
                    degraded = true;
                }
                Ok(Err(e)) => {
                    warn!("Rerank failed, keeping ranked order: {}", e);
                    degraded = true;
                }
                Err(_) => {
                    warn!("{}", EngineError::RetrievalTimeout(timeout));
                    degraded = true;
                }
            }
        }

        items.sort_by(rank_order);
        items.truncate(limit);

        QueryResponse {
            items,
            coverage,
            pending_chunks,
            degraded,
        }
    }
}

fn empty_response() -> QueryResponse {
    QueryResponse {
        items: Vec::new(),
        coverage: Coverage::Empty,
        pending_chunks: 0,
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::FastPathIndex;
    use async_trait::async_trait;
    use deal_memory_ingestion::{
        ConsistencyConfig, ConsistencyEngine, DealFactExtractor, ExtractionContext, FactStore,
        HeuristicScorer, SharedStore, StoreInvalidator,
    };
    use deal_memory_schemas::{generate_chunk_id, Chunk, Fact, Locator, QueryFilters};
    use std::time::Duration;

    /// Delegates to the heuristics but never answers a rerank in time.
    struct SlowReranker(HeuristicScorer);

    #[async_trait]
    impl ScoringService for SlowReranker {
        async fn similarity(&self, a: &str, b: &str) -> Result<f32> {
            self.0.similarity(a, b).await
        }

        async fn conflict_score(&self, a: &Fact, b: &Fact) -> Result<f32> {
            self.0.conflict_score(a, b).await
        }

        async fn rerank(&self, _query: &str, _candidates: &[String]) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    struct Fixture {
        graph: Arc<GraphTier>,
        fast_path: SharedFastPath,
    }

    fn fixture() -> Fixture {
        fixture_with(FactStore::open_in_memory().unwrap().into_shared())
    }

    fn fixture_with(store: SharedStore) -> Fixture {
        let scorer: Arc<dyn ScoringService> = Arc::new(HeuristicScorer::new());
        let consistency = Arc::new(ConsistencyEngine::new(
            ConsistencyConfig::default(),
            scorer.clone(),
        ));
        let graph = Arc::new(GraphTier::new(
            store.clone(),
            Arc::new(DealFactExtractor::heuristic_only()),
            consistency,
            scorer,
            Arc::new(StoreInvalidator::new(store)),
        ));
        Fixture {
            graph,
            fast_path: FastPathIndex::open_in_memory().unwrap().into_shared(),
        }
    }

    fn retriever(fixture: &Fixture, scorer: Arc<dyn ScoringService>) -> HybridRetriever {
        let config = RetrievalConfig {
            rerank_timeout_ms: 50,
            ..RetrievalConfig::default()
        };
        HybridRetriever::new(
            fixture.graph.clone(),
            fixture.fast_path.clone(),
            scorer,
            config,
            "v1",
        )
    }

    fn chunk(text: &str) -> Chunk {
        chunk_in("deck", text)
    }

    fn chunk_in(document_id: &str, text: &str) -> Chunk {
        Chunk {
            chunk_id: generate_chunk_id(),
            deal_id: "deal_1".into(),
            document_id: document_id.into(),
            document_name: Some("deck.pdf".into()),
            locator: Locator::Page { page: 3 },
            text: text.into(),
            mime: None,
            supersedes_document: None,
            received_at: Utc::now().to_rfc3339(),
        }
    }

    fn request(text: &str) -> QueryRequest {
        QueryRequest {
            text: text.into(),
            filters: QueryFilters {
                deal_id: Some("deal_1".into()),
                ..Default::default()
            },
            limit: 5,
        }
    }

    async fn index_only(fixture: &Fixture, c: &Chunk) {
        fixture.fast_path.lock().await.ingest(c).unwrap();
        fixture
            .graph
            .register(c, &ExtractionContext::for_chunk(c, "v1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_chunk_is_served_from_fast_path() {
        let fixture = fixture();
        let retriever = retriever(&fixture, Arc::new(HeuristicScorer::new()));
        let c = chunk("Q3 revenue = 5.2M");
        index_only(&fixture, &c).await;

        let response = retriever.query(&request("Q3 revenue")).await.unwrap();
        assert_eq!(response.coverage, Coverage::FastPath);
        assert_eq!(response.pending_chunks, 1);
        assert!(!response.items[0].verified);
        assert_eq!(response.items[0].tier, Tier::FastPath);
    }

    #[tokio::test]
    async fn test_completed_chunk_is_served_from_graph() {
        let fixture = fixture();
        let retriever = retriever(&fixture, Arc::new(HeuristicScorer::new()));
        let c = chunk("Q3 revenue = 5.2M");
        index_only(&fixture, &c).await;
        fixture
            .graph
            .ingest(&c, &ExtractionContext::for_chunk(&c, "v1"))
            .await
            .unwrap();

        let response = retriever.query(&request("Q3 revenue")).await.unwrap();
        assert_eq!(response.coverage, Coverage::Graph);
        assert_eq!(response.pending_chunks, 0);
        assert!(response.items.iter().all(|i| i.verified));
        assert!(response.items[0].confidence > RetrievalConfig::default().unverified_confidence);
    }

    #[tokio::test]
    async fn test_rerank_timeout_degrades() {
        let fixture = fixture();
        let retriever = retriever(&fixture, Arc::new(SlowReranker(HeuristicScorer::new())));
        index_only(&fixture, &chunk("Q3 revenue = 5.2M")).await;

        let response = retriever.query(&request("Q3 revenue")).await.unwrap();
        assert!(response.degraded);
        assert_eq!(response.items.len(), 1);
    }

    #[tokio::test]
    async fn test_fast_path_only_skips_graph() {
        let fixture = fixture();
        let retriever = retriever(&fixture, Arc::new(HeuristicScorer::new()));
        let c = chunk("Q3 revenue = 5.2M");
        index_only(&fixture, &c).await;
        fixture
            .graph
            .ingest(&c, &ExtractionContext::for_chunk(&c, "v1"))
            .await
            .unwrap();

        let mut req = request("Q3 revenue");
        req.filters.fast_path_only = true;
        let response = retriever.query(&req).await.unwrap();
        assert_eq!(response.coverage, Coverage::FastPath);
        assert!(response.items.iter().all(|i| i.tier == Tier::FastPath));
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let fixture = fixture();
        let retriever = retriever(&fixture, Arc::new(HeuristicScorer::new()));
        let err = retriever.query(&request("   ")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_chunks_of_corrected_documents_are_hidden() {
        let fixture = fixture();
        let retriever = retriever(&fixture, Arc::new(HeuristicScorer::new()));
        index_only(&fixture, &chunk_in("report", "FY2023 revenue = 4M")).await;
        fixture
            .graph
            .store()
            .lock()
            .await
            .record_document_supersession("deal_1", "report_fix", "report", None)
            .unwrap();

        let response = retriever.query(&request("revenue 4M")).await.unwrap();
        assert!(response.items.is_empty());
        assert_eq!(response.coverage, Coverage::Empty);

        let mut audit = request("revenue 4M");
        audit.filters.include_superseded = true;
        let response = retriever.query(&audit).await.unwrap();
        assert_eq!(response.items.len(), 1);
        assert!(response.items[0].superseded);

        let mut raw = request("revenue 4M");
        raw.filters.fast_path_only = true;
        assert!(retriever.query(&raw).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_fact_store_fails_closed() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let fixture = fixture_with(FactStore::open(temp.path()).unwrap().into_shared());
        let retriever = retriever(&fixture, Arc::new(HeuristicScorer::new()));
        index_only(&fixture, &chunk("Q3 revenue = 5.2M")).await;

        std::fs::write(temp.path(), vec![0x42u8; 8192]).unwrap();
        let err = retriever.query(&request("Q3 revenue")).await.unwrap_err();
        assert!(matches!(err, EngineError::StoreUnavailable(_)));
    }
}
