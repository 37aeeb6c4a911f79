use deal_memory_schemas::{Chunk, ExtractionJob};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::ExtractionConfig;
use crate::error::{EngineError, Result};
use crate::extractor::ExtractionContext;
use crate::graph::{GraphTier, IngestReport};

/// A chunk waiting for deep extraction.
#[derive(Debug, Clone)]
pub struct ExtractionTask {
    pub chunk: Chunk,
    pub context: ExtractionContext,
}

/// Sending half of the extraction queue.
#[derive(Clone)]
pub struct ExtractionQueue {
    graph: Arc<GraphTier>,
    sender: mpsc::UnboundedSender<ExtractionTask>,
}

impl ExtractionQueue {
    /// Register the chunk's job and queue it. Returns as soon as the job is
    /// recorded; extraction happens on the worker.
    pub async fn submit(&self, chunk: Chunk, context: ExtractionContext) -> Result<ExtractionJob> {
        let job = self.graph.register(&chunk, &context).await?;
        self.send(ExtractionTask { chunk, context })?;
        Ok(job)
    }

    /// Re-queue jobs a crash left `pending` or `running`.
    pub async fn resume_pending(&self, pipeline_version: &str) -> Result<usize> {
        let tasks = {
            let store = self.graph.store().lock().await;
            let mut tasks = Vec::new();
            for job in store.unfinished_jobs(pipeline_version)? {
                match store.get_chunk(&job.chunk_id)? {
                    Some(chunk) => {
                        let context = ExtractionContext::for_chunk(&chunk, pipeline_version);
                        tasks.push(ExtractionTask { chunk, context });
                    }
                    None => warn!("Job for unknown chunk {} left unfinished", job.chunk_id),
                }
            }
            tasks
        };

        let count = tasks.len();
        for task in tasks {
            self.send(task)?;
        }
        if count > 0 {
            info!("Resumed {} unfinished extraction jobs", count);
        }
        Ok(count)
    }

    fn send(&self, task: ExtractionTask) -> Result<()> {
        let chunk_id = task.chunk.chunk_id.0.clone();
        self.sender.send(task).map_err(|_| EngineError::ExtractionFailure {
            chunk_id,
            reason: "extraction worker stopped".into(),
        })
    }
}

/// Background worker that runs deep extraction for queued chunks
pub struct ExtractionWorker {
    graph: Arc<GraphTier>,
    config: ExtractionConfig,
    receiver: mpsc::UnboundedReceiver<ExtractionTask>,
}

impl ExtractionWorker {
    /// Create a worker and the queue that feeds it
    pub fn new(graph: Arc<GraphTier>, config: ExtractionConfig) -> (ExtractionQueue, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = ExtractionQueue {
            graph: graph.clone(),
            sender,
        };
        let worker = Self {
            graph,
            config,
            receiver,
        };
        (queue, worker)
    }

    /// Process tasks until every queue handle is dropped
    pub async fn run(mut self) {
        info!("Extraction worker started");

        while let Some(task) = self.receiver.recv().await {
            if let Err(e) = self.process(task).await {
                error!("Failed to extract chunk: {}", e);
            }
        }

        warn!("Extraction worker stopped - channel closed");
    }

    /// Process whatever is queued right now and return how many tasks ran.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(task) = self.receiver.try_recv() {
            if let Err(e) = self.process(task).await {
                error!("Failed to extract chunk: {}", e);
            }
            processed += 1;
        }
        processed
    }

    /// Run one task with bounded exponential backoff. After the last attempt
    /// the job is marked failed and the error surfaces in the document status.
    pub async fn process(&self, task: ExtractionTask) -> Result<IngestReport> {
        let ExtractionTask { chunk, context } = task;
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.graph.ingest(&chunk, &context).await {
                Ok(report) => return Ok(report),
                Err(e) => e,
            };

            if err.is_retryable() && attempt < max_attempts {
                let delay = self.config.backoff(attempt);
                warn!(
                    "Extraction of chunk {} failed (attempt {}/{}), retrying in {:?}: {}",
                    chunk.chunk_id, attempt, max_attempts, delay, err
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let reason = err.to_string();
            error!(
                "Giving up on chunk {} after {} attempts: {}",
                chunk.chunk_id, attempt, reason
            );
            self.graph
                .mark_failed(&chunk.chunk_id, &context.pipeline_version, &reason)
                .await?;
            return Err(EngineError::ExtractionFailure {
                chunk_id: chunk.chunk_id.0.clone(),
                reason,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsistencyConfig;
    use crate::consistency::ConsistencyEngine;
    use crate::database::FactStore;
    use crate::extractor::{DealFactExtractor, FactExtractor};
    use crate::heuristic::Extraction;
    use crate::invalidation::StoreInvalidator;
    use crate::scoring::{HeuristicScorer, ScoringService};
    use async_trait::async_trait;
    use chrono::Utc;
    use deal_memory_schemas::{generate_chunk_id, Locator, TierStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then delegates to the heuristics.
    struct FlakyExtractor {
        failures: u32,
        calls: AtomicU32,
        inner: DealFactExtractor,
    }

    #[async_trait]
    impl FactExtractor for FlakyExtractor {
        async fn extract(&self, chunk: &Chunk, context: &ExtractionContext) -> Result<Extraction> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(EngineError::ExtractionFailure {
                    chunk_id: chunk.chunk_id.0.clone(),
                    reason: "model timeout".into(),
                });
            }
            self.inner.extract(chunk, context).await
        }
    }

    fn graph_with(extractor: Arc<dyn FactExtractor>) -> Arc<GraphTier> {
        let store = FactStore::open_in_memory().unwrap().into_shared();
        let scorer: Arc<dyn ScoringService> = Arc::new(HeuristicScorer::new());
        let consistency = Arc::new(ConsistencyEngine::new(
            ConsistencyConfig::default(),
            scorer.clone(),
        ));
        Arc::new(GraphTier::new(
            store.clone(),
            extractor,
            consistency,
            scorer,
            Arc::new(StoreInvalidator::new(store)),
        ))
    }

    fn fast_config() -> ExtractionConfig {
        ExtractionConfig {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            use_llm: false,
        }
    }

    fn chunk() -> Chunk {
        Chunk {
            chunk_id: generate_chunk_id(),
            deal_id: "deal_1".into(),
            document_id: "deck".into(),
            document_name: Some("deck.pdf".into()),
            locator: Locator::Page { page: 2 },
            text: "Q3 revenue = 5.2M".into(),
            mime: None,
            supersedes_document: None,
            received_at: Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let graph = graph_with(Arc::new(FlakyExtractor {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: DealFactExtractor::heuristic_only(),
        }));
        let (queue, mut worker) = ExtractionWorker::new(graph.clone(), fast_config());

        let c = chunk();
        let job = queue
            .submit(c.clone(), ExtractionContext::for_chunk(&c, "v1"))
            .await
            .unwrap();
        assert_eq!(job.status, TierStatus::Pending);
        assert_eq!(worker.drain().await, 1);

        let store = graph.store().lock().await;
        let job = store.get_job(&c.chunk_id, "v1").unwrap().unwrap();
        assert_eq!(job.status, TierStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(store.count_facts().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_in_document_status() {
        let graph = graph_with(Arc::new(FlakyExtractor {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            inner: DealFactExtractor::heuristic_only(),
        }));
        let (queue, worker) = ExtractionWorker::new(graph.clone(), fast_config());

        let c = chunk();
        queue
            .submit(c.clone(), ExtractionContext::for_chunk(&c, "v1"))
            .await
            .unwrap();
        let task = ExtractionTask {
            context: ExtractionContext::for_chunk(&c, "v1"),
            chunk: c.clone(),
        };
        let err = worker.process(task).await.unwrap_err();
        assert!(matches!(err, EngineError::ExtractionFailure { .. }));

        let store = graph.store().lock().await;
        let status = store.document_status("deck", "v1").unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 0);
        assert!(status.errors[0].contains("model timeout"));
    }

    #[tokio::test]
    async fn test_resume_pending_requeues_unfinished_jobs() {
        let graph = graph_with(Arc::new(DealFactExtractor::heuristic_only()));
        let c = chunk();
        graph
            .register(&c, &ExtractionContext::for_chunk(&c, "v1"))
            .await
            .unwrap();

        // Fresh worker, as after a restart.
        let (queue, mut worker) = ExtractionWorker::new(graph.clone(), fast_config());
        assert_eq!(queue.resume_pending("v1").await.unwrap(), 1);
        assert_eq!(worker.drain().await, 1);
        assert_eq!(queue.resume_pending("v1").await.unwrap(), 0);
    }
}
