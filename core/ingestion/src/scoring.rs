use async_trait::async_trait;
use deal_memory_schemas::{Fact, FactValue};

use crate::embedding::{cosine_similarity, Embedder, HashingEmbedder};
use crate::error::Result;
use crate::text;

/// Scoring seam for entity resolution, contradiction checks and reranking.
///
/// Model-backed implementations live behind this trait so the consistency
/// and ranking logic can run against a deterministic scorer in tests.
#[async_trait]
pub trait ScoringService: Send + Sync {
    /// Similarity of two short strings (entity names, aliases) in `[0, 1]`.
    async fn similarity(&self, a: &str, b: &str) -> Result<f32>;

    /// How strongly two facts about the same subject disagree, in `[0, 1]`.
    async fn conflict_score(&self, a: &Fact, b: &Fact) -> Result<f32>;

    /// Relevance of each candidate to `query`, aligned with `candidates`.
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// Deterministic scorer built from token overlap, character bigrams and
/// hashed embeddings.
#[derive(Debug, Clone, Default)]
pub struct HeuristicScorer {
    embedder: HashingEmbedder,
}

impl HeuristicScorer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScoringService for HeuristicScorer {
    async fn similarity(&self, a: &str, b: &str) -> Result<f32> {
        Ok(text::bigram_similarity(a, b).max(text::jaccard_similarity(a, b)))
    }

    async fn conflict_score(&self, a: &Fact, b: &Fact) -> Result<f32> {
        let score = match (&a.value, &b.value) {
            (Some(FactValue::Text { text: x }), Some(FactValue::Text { text: y })) => {
                if text::normalize_name(x) == text::normalize_name(y) {
                    0.0
                } else {
                    1.0 - text::jaccard_similarity(x, y)
                }
            }
            (Some(x), Some(y)) => match x.relative_difference(y) {
                Some(diff) => (diff * 10.0).min(1.0) as f32,
                // Numeric against text, or mismatched units.
                None => 1.0,
            },
            _ => 1.0 - text::jaccard_similarity(&a.content, &b.content),
        };
        Ok(score.clamp(0.0, 1.0))
    }

    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let query_vector = self.embedder.embed(query);
        Ok(candidates
            .iter()
            .map(|candidate| {
                let semantic = cosine_similarity(&query_vector, &self.embedder.embed(candidate));
                let lexical = text::jaccard_similarity(query, candidate);
                (0.6 * semantic.max(0.0) + 0.4 * lexical).clamp(0.0, 1.0)
            })
            .collect())
    }
}
