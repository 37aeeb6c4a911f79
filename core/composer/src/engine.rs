use chrono::Utc;
use deal_memory_indexing::{FastPathIndex, HybridRetriever, SharedFastPath};
use deal_memory_ingestion::{
    CacheInvalidator, ConsistencyEngine, DealFactExtractor, EngineConfig, EngineError,
    ExtractionContext, ExtractionQueue, ExtractionWorker, FactExtractor, FactStore, GraphTier,
    HeuristicScorer, InvariantFinding, Result, ScoringService, SharedStore, WriteBackPath,
};
use deal_memory_schemas::{
    AssertFactRequest, AssertFactResponse, Chunk, ChunkId, ContradictionResolution,
    DocumentStatus, ExtractionJob, MemoryFile, QueryRequest, QueryResponse, ResolveRequest, Tier,
    TierEvent, TierStatus,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::MemoryCache;

/// What happened to a chunk handed to [`KnowledgeEngine::ingest_chunk`].
#[derive(Debug, Clone, Serialize)]
pub struct ChunkReceipt {
    pub chunk_id: ChunkId,
    /// False when the chunk was already in the fast-path index.
    pub fast_path_indexed: bool,
    /// Deep extraction job, absent when it could not be queued.
    pub deep_job: Option<ExtractionJob>,
}

/// Facade over both tiers, the consistency engine and the memory cache.
pub struct KnowledgeEngine {
    config: EngineConfig,
    store: SharedStore,
    fast_path: SharedFastPath,
    graph: Arc<GraphTier>,
    writeback: WriteBackPath,
    queue: ExtractionQueue,
    retriever: HybridRetriever,
    cache: Arc<MemoryCache>,
    events: broadcast::Sender<TierEvent>,
}

impl KnowledgeEngine {
    /// Open the stores named by `config` and wire the default extractor and
    /// scorer. The returned worker must be spawned for deep extraction to run.
    pub fn open(config: EngineConfig) -> Result<(Self, ExtractionWorker)> {
        let store = FactStore::open(&config.db_path)?.into_shared();
        let fast_path = FastPathIndex::open(&config.fast_path_db_path)?.into_shared();
        let extractor: Arc<dyn FactExtractor> = if config.extraction.use_llm {
            Arc::new(DealFactExtractor::from_env())
        } else {
            Arc::new(DealFactExtractor::heuristic_only())
        };
        let scorer: Arc<dyn ScoringService> = Arc::new(HeuristicScorer::new());

        Ok(Self::from_parts(config, store, fast_path, extractor, scorer))
    }

    pub fn from_parts(
        config: EngineConfig,
        store: SharedStore,
        fast_path: SharedFastPath,
        extractor: Arc<dyn FactExtractor>,
        scorer: Arc<dyn ScoringService>,
    ) -> (Self, ExtractionWorker) {
        let cache = Arc::new(MemoryCache::new(
            store.clone(),
            config.cache.clone(),
            config.pipeline_version.clone(),
        ));
        let consistency = Arc::new(ConsistencyEngine::new(
            config.consistency.clone(),
            scorer.clone(),
        ));
        let (events, _) = broadcast::channel(256);
        let graph = Arc::new(
            GraphTier::new(
                store.clone(),
                extractor,
                consistency,
                scorer.clone(),
                cache.clone(),
            )
            .with_events(events.clone()),
        );
        let writeback = WriteBackPath::new(graph.clone());
        let (queue, worker) = ExtractionWorker::new(graph.clone(), config.extraction.clone());
        let retriever = HybridRetriever::new(
            graph.clone(),
            fast_path.clone(),
            scorer,
            config.retrieval.clone(),
            config.pipeline_version.clone(),
        );

        let engine = Self {
            config,
            store,
            fast_path,
            graph,
            writeback,
            queue,
            retriever,
            cache,
            events,
        };
        (engine, worker)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn graph(&self) -> &Arc<GraphTier> {
        &self.graph
    }

    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// Completion events from both tiers.
    pub fn subscribe(&self) -> broadcast::Receiver<TierEvent> {
        self.events.subscribe()
    }

    /// Index the chunk on the fast path now and queue it for deep extraction.
    pub async fn ingest_chunk(&self, chunk: Chunk) -> Result<ChunkReceipt> {
        if chunk.deal_id.trim().is_empty() || chunk.document_id.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "chunk needs a deal_id and a document_id".into(),
            ));
        }

        let fast_path_indexed = self.fast_path.lock().await.ingest(&chunk)?;
        let _ = self.events.send(TierEvent {
            chunk_id: chunk.chunk_id.clone(),
            tier: Tier::FastPath,
            status: TierStatus::Completed,
            at: Utc::now().to_rfc3339(),
        });

        let chunk_id = chunk.chunk_id.clone();
        let context = ExtractionContext::for_chunk(&chunk, self.config.pipeline_version.clone());
        let deep_job = match self.queue.submit(chunk, context).await {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("Chunk {} indexed but not queued for extraction: {}", chunk_id, e);
                None
            }
        };

        debug!("Ingested chunk {} (fast path new: {})", chunk_id, fast_path_indexed);
        Ok(ChunkReceipt {
            chunk_id,
            fast_path_indexed,
            deep_job,
        })
    }

    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        self.retriever.query(request).await
    }

    pub async fn assert_fact(&self, request: &AssertFactRequest) -> Result<AssertFactResponse> {
        let outcome = self.writeback.ingest_asserted_fact(request).await?;
        Ok(outcome.to_response())
    }

    pub async fn get_memory(&self, deal_id: &str, topic: &str) -> Result<MemoryFile> {
        self.cache.get(deal_id, topic).await
    }

    /// Apply an analyst's decision to a contradicted pair.
    pub async fn resolve_contradiction(
        &self,
        request: &ResolveRequest,
    ) -> Result<ContradictionResolution> {
        let outcome = self
            .graph
            .consistency()
            .resolve_contradiction(
                &self.store,
                &request.fact_a,
                &request.fact_b,
                request.decision,
                request.note.clone(),
            )
            .await?;
        CacheInvalidator::invalidate(self.cache.as_ref(), &outcome.invalidation).await?;
        info!(
            "Resolved contradiction {} / {} as {}",
            request.fact_a,
            request.fact_b,
            request.decision.as_str()
        );
        Ok(outcome.resolution)
    }

    pub async fn document_status(&self, document_id: &str) -> Result<DocumentStatus> {
        self.store
            .lock()
            .await
            .document_status(document_id, &self.config.pipeline_version)
    }

    pub async fn invariants(&self) -> Result<Vec<InvariantFinding>> {
        self.store.lock().await.check_invariants()
    }

    /// Re-queue extraction jobs left unfinished by a previous run.
    pub async fn resume_pending(&self) -> Result<usize> {
        self.queue
            .resume_pending(&self.config.pipeline_version)
            .await
    }

    /// Fails when either store cannot be read.
    pub async fn health(&self) -> Result<usize> {
        self.store.lock().await.ping()?;
        self.fast_path.lock().await.count()
    }
}
