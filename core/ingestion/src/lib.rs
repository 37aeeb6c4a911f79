pub mod config;
pub mod consistency;
pub mod database;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod graph;
pub mod heuristic;
pub mod invalidation;
pub mod llm_extractor;
pub mod scoring;
pub mod text;
pub mod worker;
pub mod writeback;

pub use config::{CacheConfig, ConsistencyConfig, EngineConfig, ExtractionConfig, RetrievalConfig};
pub use consistency::{ConsistencyEngine, ConsistencyOutcome, PairVerdict, ResolutionOutcome};
pub use database::{FactInsert, FactStore, InvariantFinding, MemoryFileRecord, SharedStore};
pub use embedding::{cosine_similarity, Embedder, HashingEmbedder};
pub use error::{EngineError, Result};
pub use extractor::{DealFactExtractor, ExtractionContext, ExtractionStrategy, FactExtractor};
pub use graph::{GraphHit, GraphNode, GraphTier, IngestReport};
pub use invalidation::{CacheInvalidator, Invalidation, StoreInvalidator};
pub use llm_extractor::{LLMConfig, LLMExtractor, LLMProvider};
pub use scoring::{HeuristicScorer, ScoringService};
pub use worker::{ExtractionQueue, ExtractionTask, ExtractionWorker};
pub use writeback::{AssertOutcome, WriteBackPath};
