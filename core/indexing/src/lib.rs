pub mod ranking;
pub mod retrieval;
pub mod search;

pub use ranking::{rank_order, RankingFunction, RecencyWeightedRanking};
pub use retrieval::HybridRetriever;
pub use search::{FastPathIndex, ScoredChunk, SharedFastPath};
