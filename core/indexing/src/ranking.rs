use chrono::{DateTime, Utc};
use deal_memory_schemas::QueryResultItem;
use std::cmp::Ordering;

/// Pluggable scoring applied to the merged candidate set before reranking.
pub trait RankingFunction: Send + Sync {
    /// Score one candidate given its tier-local relevance in `[0, 1]`.
    fn score(&self, item: &QueryResultItem, relevance: f32, now: DateTime<Utc>) -> f32;
}

/// Relevance, confidence decayed by age, and a short-horizon recency bonus.
#[derive(Debug, Clone)]
pub struct RecencyWeightedRanking {
    pub relevance_weight: f32,
    pub confidence_weight: f32,
    pub recency_weight: f32,
    /// Days after which a fact's confidence counts for half.
    pub half_life_days: f32,
    /// Decay constant (days) for the recency bonus.
    pub recency_days: f32,
}

impl RecencyWeightedRanking {
    pub fn new(half_life_days: f32) -> Self {
        Self {
            half_life_days,
            ..Self::default()
        }
    }
}

impl Default for RecencyWeightedRanking {
    fn default() -> Self {
        Self {
            relevance_weight: 0.5,
            confidence_weight: 0.35,
            recency_weight: 0.15,
            half_life_days: 365.0,
            recency_days: 30.0,
        }
    }
}

impl RankingFunction for RecencyWeightedRanking {
    fn score(&self, item: &QueryResultItem, relevance: f32, now: DateTime<Utc>) -> f32 {
        let age_days = age_in_days(&item.discovered_at, now);
        let decayed = if self.half_life_days > 0.0 {
            item.confidence * 0.5f32.powf(age_days / self.half_life_days)
        } else {
            item.confidence
        };
        let recency = if self.recency_days > 0.0 {
            (-age_days / self.recency_days).exp()
        } else {
            0.0
        };

        self.relevance_weight * relevance.clamp(0.0, 1.0)
            + self.confidence_weight * decayed.clamp(0.0, 1.0)
            + self.recency_weight * recency
    }
}

/// Age of an RFC3339 timestamp in days. Unparseable or future timestamps count as new.
fn age_in_days(timestamp: &str, now: DateTime<Utc>) -> f32 {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|at| (now - at.with_timezone(&Utc)).num_seconds().max(0) as f32 / 86_400.0)
        .unwrap_or(0.0)
}

/// Final ordering: non-superseded first, then score, confidence and
/// `discovered_at`, all descending.
pub fn rank_order(a: &QueryResultItem, b: &QueryResultItem) -> Ordering {
    a.superseded
        .cmp(&b.superseded)
        .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
        .then_with(|| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| compare_timestamps(&b.discovered_at, &a.discovered_at))
}

fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
