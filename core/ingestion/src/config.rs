use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration shared by every tier of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite path for the fact store (`:memory:` for tests).
    pub db_path: String,
    /// SQLite path for the fast-path index; kept apart from the fact store.
    pub fast_path_db_path: String,
    /// Version tag of the deep extraction pipeline; part of the idempotency key.
    pub pipeline_version: String,
    pub bind_addr: String,
    pub consistency: ConsistencyConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// Relative numeric difference above which two values disagree (0.01 = 1%).
    pub numeric_tolerance: f64,
    /// Conflict-verification score at or above which two text values disagree.
    pub text_conflict_threshold: f32,
    /// Added to both confidences when two facts corroborate.
    pub corroboration_boost: f32,
    /// Multiplied into both confidences when a contradiction is flagged.
    pub contest_penalty: f32,
    /// Name similarity needed to merge an extracted entity into an existing one.
    pub entity_merge_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub rerank_timeout_ms: u64,
    /// Graph hits needed before the fast path is skipped entirely.
    pub min_graph_results: usize,
    pub recency_half_life_days: f32,
    /// Candidate over-fetch factor applied before merging and reranking.
    pub candidate_multiplier: usize,
    /// Confidence reported for raw, unverified fast-path hits.
    pub unverified_confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_regeneration_attempts: u32,
    pub max_facts_per_summary: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub use_llm: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            fast_path_db_path: ":memory:".to_string(),
            pipeline_version: "v1".to_string(),
            bind_addr: "127.0.0.1:21955".to_string(),
            consistency: ConsistencyConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            numeric_tolerance: 0.01,
            text_conflict_threshold: 0.5,
            corroboration_boost: 0.05,
            contest_penalty: 0.9,
            entity_merge_threshold: 0.85,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rerank_timeout_ms: 1500,
            min_graph_results: 1,
            recency_half_life_days: 365.0,
            candidate_multiplier: 3,
            unverified_confidence: 0.3,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_regeneration_attempts: 3,
            max_facts_per_summary: 50,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            use_llm: false,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = path;
        }
        if let Ok(path) = std::env::var("FAST_PATH_DB_PATH") {
            config.fast_path_db_path = path;
        }
        if let Ok(version) = std::env::var("PIPELINE_VERSION") {
            config.pipeline_version = version;
        }
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }

        config.consistency.numeric_tolerance =
            env_parse("NUMERIC_TOLERANCE", config.consistency.numeric_tolerance);
        config.consistency.text_conflict_threshold = env_parse(
            "TEXT_CONFLICT_THRESHOLD",
            config.consistency.text_conflict_threshold,
        );
        config.retrieval.rerank_timeout_ms =
            env_parse("RERANK_TIMEOUT_MS", config.retrieval.rerank_timeout_ms);
        config.extraction.max_attempts =
            env_parse("EXTRACTION_MAX_ATTEMPTS", config.extraction.max_attempts);

        let use_llm = std::env::var("USE_LLM_EXTRACTION")
            .unwrap_or_else(|_| "false".to_string())
            .to_lowercase();
        config.extraction.use_llm = use_llm == "true" || use_llm == "1";

        config
    }
}

impl RetrievalConfig {
    pub fn rerank_timeout(&self) -> Duration {
        Duration::from_millis(self.rerank_timeout_ms)
    }
}

impl ExtractionConfig {
    /// Exponential backoff for the given (1-based) attempt, capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let millis = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(millis.min(self.backoff_max_ms))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ExtractionConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(250));
        assert_eq!(config.backoff(2), Duration::from_millis(500));
        assert_eq!(config.backoff(3), Duration::from_millis(1000));
        assert_eq!(config.backoff(30), Duration::from_millis(5000));
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"consistency":{"numeric_tolerance":0.05}}"#).unwrap();
        assert_eq!(config.consistency.numeric_tolerance, 0.05);
        assert_eq!(config.consistency.text_conflict_threshold, 0.5);
        assert_eq!(config.pipeline_version, "v1");
    }
}
