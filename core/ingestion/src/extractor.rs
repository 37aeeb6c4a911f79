use async_trait::async_trait;
use deal_memory_schemas::Chunk;
use tracing::{debug, warn};

use crate::error::Result;
use crate::heuristic::{Extraction, HeuristicExtractor};
use crate::llm_extractor::LLMExtractor;

/// Per-run parameters handed to the deep extraction tier.
#[derive(Debug, Clone)]
pub struct ExtractionContext {
    /// Part of the idempotency key `(chunk_id, pipeline_version)`.
    pub pipeline_version: String,
    pub deal_id: String,
    /// Mime or document-type hint from the front end.
    pub document_type: Option<String>,
}

impl ExtractionContext {
    pub fn for_chunk(chunk: &Chunk, pipeline_version: impl Into<String>) -> Self {
        Self {
            pipeline_version: pipeline_version.into(),
            deal_id: chunk.deal_id.clone(),
            document_type: chunk.mime.clone(),
        }
    }
}

/// Semantic extraction step of the deep graph tier.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    async fn extract(&self, chunk: &Chunk, context: &ExtractionContext) -> Result<Extraction>;
}

/// Extraction strategy for facts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtractionStrategy {
    /// Fast heuristic-only extraction
    HeuristicOnly,
    /// LLM extraction, falling back to heuristics when the call fails
    LLMWithFallback,
    /// Heuristics plus LLM, merged
    Hybrid,
}

/// Fact extractor that combines the regex heuristics with an optional LLM.
pub struct DealFactExtractor {
    strategy: ExtractionStrategy,
    heuristic: HeuristicExtractor,
    llm: Option<LLMExtractor>,
}

impl Default for DealFactExtractor {
    fn default() -> Self {
        Self::heuristic_only()
    }
}

impl DealFactExtractor {
    /// Pick the strategy from the environment (`USE_LLM_EXTRACTION`).
    pub fn from_env() -> Self {
        let llm = LLMExtractor::from_env_optional();
        let strategy = if llm.is_some() {
            ExtractionStrategy::Hybrid
        } else {
            ExtractionStrategy::HeuristicOnly
        };

        Self {
            strategy,
            heuristic: HeuristicExtractor::new(),
            llm,
        }
    }

    pub fn heuristic_only() -> Self {
        Self {
            strategy: ExtractionStrategy::HeuristicOnly,
            heuristic: HeuristicExtractor::new(),
            llm: None,
        }
    }

    pub fn with_llm(strategy: ExtractionStrategy, llm: LLMExtractor) -> Self {
        Self {
            strategy,
            heuristic: HeuristicExtractor::new(),
            llm: Some(llm),
        }
    }

    pub fn strategy(&self) -> ExtractionStrategy {
        self.strategy
    }

    async fn extract_llm(&self, chunk: &Chunk, context: &ExtractionContext) -> Option<Extraction> {
        let llm = self.llm.as_ref()?;
        match llm
            .extract(&chunk.text, context.document_type.as_deref())
            .await
        {
            Ok(extraction) => Some(extraction),
            Err(e) => {
                warn!("LLM extraction failed for chunk {}: {:#}", chunk.chunk_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl FactExtractor for DealFactExtractor {
    async fn extract(&self, chunk: &Chunk, context: &ExtractionContext) -> Result<Extraction> {
        if chunk.text.trim().is_empty() {
            return Ok(Extraction::default());
        }

        let extraction = match self.strategy {
            ExtractionStrategy::HeuristicOnly => self.heuristic.extract(&chunk.text),
            ExtractionStrategy::LLMWithFallback => match self.extract_llm(chunk, context).await {
                Some(extraction) => extraction,
                None => self.heuristic.extract(&chunk.text),
            },
            ExtractionStrategy::Hybrid => {
                let mut merged = self.heuristic.extract(&chunk.text);
                if let Some(llm) = self.extract_llm(chunk, context).await {
                    merged.correction_signal |= llm.correction_signal;
                    for fact in llm.facts {
                        let duplicate = merged.facts.iter().any(|existing| {
                            existing.attribute == fact.attribute
                                && existing.period == fact.period
                                && existing.value == fact.value
                        });
                        if !duplicate {
                            merged.facts.push(fact);
                        }
                    }
                }
                merged
            }
        };

        debug!(
            "Extracted {} facts from chunk {} ({:?})",
            extraction.facts.len(),
            chunk.chunk_id,
            self.strategy
        );
        Ok(extraction)
    }
}
