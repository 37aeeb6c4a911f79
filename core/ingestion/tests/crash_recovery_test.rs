use chrono::Utc;
use deal_memory_ingestion::{
    ConsistencyConfig, ConsistencyEngine, DealFactExtractor, ExtractionConfig,
    ExtractionContext, ExtractionQueue, ExtractionWorker, FactStore, GraphTier, HeuristicScorer,
    SharedStore, StoreInvalidator,
};
use deal_memory_schemas::{generate_chunk_id, Chunk, Locator, TierStatus};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const PIPELINE: &str = "v1";

fn wire(store: SharedStore) -> (ExtractionQueue, ExtractionWorker) {
    let scorer = Arc::new(HeuristicScorer::new());
    let graph = Arc::new(GraphTier::new(
        store.clone(),
        Arc::new(DealFactExtractor::heuristic_only()),
        Arc::new(ConsistencyEngine::new(ConsistencyConfig::default(), scorer.clone())),
        scorer,
        Arc::new(StoreInvalidator::new(store)),
    ));
    ExtractionWorker::new(
        graph,
        ExtractionConfig {
            max_attempts: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 1,
            use_llm: false,
        },
    )
}

fn open(path: &Path) -> SharedStore {
    FactStore::open(path).unwrap().into_shared()
}

fn deck_chunk() -> Chunk {
    Chunk {
        chunk_id: generate_chunk_id(),
        deal_id: "deal_acme".into(),
        document_id: "deck".into(),
        document_name: Some("deck.pdf".into()),
        locator: Locator::Page { page: 3 },
        text: "Q3 revenue = 5.2M".into(),
        mime: Some("application/pdf".into()),
        supersedes_document: None,
        received_at: Utc::now().to_rfc3339(),
    }
}

/// A job queued before a restart is picked up again and completes once.
#[tokio::test]
async fn test_pending_job_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("facts.db");
    let chunk = deck_chunk();

    {
        let store = open(&db_path);
        let (queue, worker) = wire(store.clone());
        let job = queue
            .submit(chunk.clone(), ExtractionContext::for_chunk(&chunk, PIPELINE))
            .await
            .unwrap();
        assert_eq!(job.status, TierStatus::Pending);
        // Worker dropped before it ran: the process "crashed".
        drop(worker);
    }

    let store = open(&db_path);
    assert_eq!(store.lock().await.unfinished_jobs(PIPELINE).unwrap().len(), 1);

    let (queue, mut worker) = wire(store.clone());
    assert_eq!(queue.resume_pending(PIPELINE).await.unwrap(), 1);
    assert_eq!(worker.drain().await, 1);

    let store = store.lock().await;
    assert!(store.unfinished_jobs(PIPELINE).unwrap().is_empty());
    assert_eq!(store.count_facts().unwrap(), 1);
    let status = store.document_status("deck", PIPELINE).unwrap();
    assert_eq!(status.completed, 1);
    assert_eq!(status.pending, 0);
}

/// Re-running a completed chunk under the same pipeline version writes nothing new.
#[tokio::test]
async fn test_completed_chunk_is_not_extracted_twice() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(&temp_dir.path().join("facts.db"));
    let (queue, mut worker) = wire(store.clone());
    let chunk = deck_chunk();
    let context = ExtractionContext::for_chunk(&chunk, PIPELINE);

    queue.submit(chunk.clone(), context.clone()).await.unwrap();
    worker.drain().await;
    let job = queue.submit(chunk.clone(), context).await.unwrap();
    assert_eq!(job.status, TierStatus::Completed);
    worker.drain().await;

    let store = store.lock().await;
    assert_eq!(store.count_facts().unwrap(), 1);
    assert_eq!(store.facts_for_chunk(&chunk.chunk_id).unwrap().len(), 1);
}

/// A newer pipeline version queues the chunk again; the old job stays completed.
#[tokio::test]
async fn test_new_pipeline_version_reprocesses_chunk() {
    let temp_dir = TempDir::new().unwrap();
    let store = open(&temp_dir.path().join("facts.db"));
    let (queue, mut worker) = wire(store.clone());
    let chunk = deck_chunk();

    queue
        .submit(chunk.clone(), ExtractionContext::for_chunk(&chunk, "v1"))
        .await
        .unwrap();
    worker.drain().await;
    let job = queue
        .submit(chunk.clone(), ExtractionContext::for_chunk(&chunk, "v2"))
        .await
        .unwrap();
    assert_eq!(job.status, TierStatus::Pending);
    worker.drain().await;

    let store = store.lock().await;
    assert_eq!(store.document_status("deck", "v1").unwrap().completed, 1);
    assert_eq!(store.document_status("deck", "v2").unwrap().completed, 1);
}
