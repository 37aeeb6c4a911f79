use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ULID and ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolutionId(pub String);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ResolutionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Chunk Schema
// ============================================================================

/// Where inside a source document a chunk or fact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    Page { page: u32 },
    Cell { sheet: Option<String>, cell: String },
    Section { section: String },
    /// A conversational turn, used by write-back facts.
    Message { message_id: String },
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Locator::Page { page } => write!(f, "p.{}", page),
            Locator::Cell {
                sheet: Some(sheet),
                cell,
            } => write!(f, "{}!{}", sheet, cell),
            Locator::Cell { sheet: None, cell } => write!(f, "{}", cell),
            Locator::Section { section } => write!(f, "§{}", section),
            Locator::Message { message_id } => write!(f, "msg:{}", message_id),
        }
    }
}

/// Raw unit of normalized source text handed over by the parsing front end.
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub deal_id: String,
    pub document_id: String,
    /// Original file name, used to spot correction markers ("report_CORRECTED.pdf").
    pub document_name: Option<String>,
    pub locator: Locator,
    pub text: String,
    pub mime: Option<String>,
    /// Explicit correction signal from the front end: this document replaces that one.
    #[serde(default)]
    pub supersedes_document: Option<String>,
    pub received_at: String, // RFC3339
}

// ============================================================================
// Fact Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    #[serde(rename = "document")]
    Document,
    #[serde(rename = "conversation")]
    Conversation,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Document => "document",
            SourceKind::Conversation => "conversation",
        }
    }
}

pub const CONVERSATION_DOCUMENT_ID: &str = "conversation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    pub document_id: String,
    pub locator: Locator,
}

impl Source {
    pub fn document(document_id: impl Into<String>, locator: Locator) -> Self {
        Self {
            kind: SourceKind::Document,
            document_id: document_id.into(),
            locator,
        }
    }

    pub fn conversation(message_id: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::Conversation,
            document_id: CONVERSATION_DOCUMENT_ID.to_string(),
            locator: Locator::Message {
                message_id: message_id.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactStatus {
    #[serde(rename = "unvalidated")]
    Unvalidated,
    #[serde(rename = "validated")]
    Validated,
    #[serde(rename = "contradicted")]
    Contradicted,
    #[serde(rename = "superseded")]
    Superseded,
}

impl FactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactStatus::Unvalidated => "unvalidated",
            FactStatus::Validated => "validated",
            FactStatus::Contradicted => "contradicted",
            FactStatus::Superseded => "superseded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unvalidated" => Some(FactStatus::Unvalidated),
            "validated" => Some(FactStatus::Validated),
            "contradicted" => Some(FactStatus::Contradicted),
            "superseded" => Some(FactStatus::Superseded),
            _ => None,
        }
    }
}

/// Structured value carried by a fact, when one could be parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FactValue {
    Numeric { amount: f64, unit: Option<String> },
    Text { text: String },
}

impl FactValue {
    /// Relative difference between two numeric values. A missing unit matches
    /// any unit. `None` when the values are not comparable numerically.
    pub fn relative_difference(&self, other: &FactValue) -> Option<f64> {
        match (self, other) {
            (
                FactValue::Numeric { amount: a, unit: ua },
                FactValue::Numeric { amount: b, unit: ub },
            ) => {
                if let (Some(ua), Some(ub)) = (ua, ub) {
                    if !ua.eq_ignore_ascii_case(ub) {
                        return None;
                    }
                }
                let scale = a.abs().max(b.abs());
                if scale == 0.0 {
                    Some(0.0)
                } else {
                    Some((a - b).abs() / scale)
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FactValue::Numeric {
                amount,
                unit: Some(unit),
            } => write!(f, "{}{}", amount, unit),
            FactValue::Numeric { amount, unit: None } => write!(f, "{}", amount),
            FactValue::Text { text } => write!(f, "{}", text),
        }
    }
}

/// Time window a fact describes. Bounds are inclusive calendar dates; a
/// label-only period ("Q3" with no year) compares by label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub label: String,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl Period {
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: normalize_period_label(&label.into()),
            start: None,
            end: None,
        }
    }

    pub fn bounded(label: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            label: normalize_period_label(&label.into()),
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn year(year: i32) -> Option<Self> {
        Some(Self::bounded(
            format!("FY{}", year),
            NaiveDate::from_ymd_opt(year, 1, 1)?,
            NaiveDate::from_ymd_opt(year, 12, 31)?,
        ))
    }

    pub fn quarter(quarter: u32, year: Option<i32>) -> Option<Self> {
        if !(1..=4).contains(&quarter) {
            return None;
        }
        match year {
            Some(year) => {
                let first_month = (quarter - 1) * 3 + 1;
                let start = NaiveDate::from_ymd_opt(year, first_month, 1)?;
                let end = last_day_of_month(year, first_month + 2)?;
                Some(Self::bounded(format!("Q{} {}", quarter, year), start, end))
            }
            None => Some(Self::labeled(format!("Q{}", quarter))),
        }
    }

    pub fn half(half: u32, year: Option<i32>) -> Option<Self> {
        if !(1..=2).contains(&half) {
            return None;
        }
        match year {
            Some(year) => {
                let first_month = (half - 1) * 6 + 1;
                let start = NaiveDate::from_ymd_opt(year, first_month, 1)?;
                let end = last_day_of_month(year, first_month + 5)?;
                Some(Self::bounded(format!("H{} {}", half, year), start, end))
            }
            None => Some(Self::labeled(format!("H{}", half))),
        }
    }

    pub fn month(month: u32, year: i32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let end = last_day_of_month(year, month)?;
        Some(Self::bounded(
            format!("{}-{:02}", year, month),
            start,
            end,
        ))
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// Closed-interval intersection when both sides are bounded, label equality otherwise.
    pub fn overlaps(&self, other: &Period) -> bool {
        match (self.start, self.end, other.start, other.end) {
            (Some(a_start), Some(a_end), Some(b_start), Some(b_end)) => {
                a_start <= b_end && b_start <= a_end
            }
            _ => self.label == other.label,
        }
    }
}

/// Two optional periods overlap unless both are known and disjoint.
pub fn periods_overlap(a: Option<&Period>, b: Option<&Period>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.overlaps(b),
        _ => true,
    }
}

fn normalize_period_label(label: &str) -> String {
    label.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// Atomic extracted statement with confidence and source attribution.
/// Never hard-deleted; corrections produce new facts plus relationship edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub deal_id: String,
    pub content: String,
    pub entity_ref: Option<EntityId>,
    /// Normalized metric or predicate ("revenue", "headcount").
    pub attribute: Option<String>,
    pub value: Option<FactValue>,
    pub period: Option<Period>,
    /// Domain bucket used as the memory cache topic ("financials").
    pub topic: String,
    pub confidence: f32,
    pub source: Source,
    pub chunk_id: Option<ChunkId>,
    /// `{chunk_id}:{pipeline_version}:{ordinal}` for extracted facts.
    pub extraction_key: Option<String>,
    pub discovered_at: String, // RFC3339
    pub status: FactStatus,
}

impl Fact {
    pub fn is_superseded(&self) -> bool {
        self.status == FactStatus::Superseded
    }

    /// Two facts describe the same subject when they share deal, entity and attribute.
    pub fn same_subject(&self, other: &Fact) -> bool {
        self.deal_id == other.deal_id
            && self.entity_ref.is_some()
            && self.entity_ref == other.entity_ref
            && self.attribute == other.attribute
    }
}

// ============================================================================
// Entity Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KnownEntityType {
    #[serde(rename = "company")]
    Company,
    #[serde(rename = "person")]
    Person,
    #[serde(rename = "metric")]
    Metric,
    #[serde(rename = "product")]
    Product,
    #[serde(rename = "location")]
    Location,
}

impl KnownEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnownEntityType::Company => "company",
            KnownEntityType::Person => "person",
            KnownEntityType::Metric => "metric",
            KnownEntityType::Product => "product",
            KnownEntityType::Location => "location",
        }
    }
}

/// Entity types are either one the engine knows or whatever the extractor named.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityType {
    Known { known: KnownEntityType },
    Dynamic { name: String },
}

impl EntityType {
    pub fn known(known: KnownEntityType) -> Self {
        EntityType::Known { known }
    }

    /// Storage form: "company" or "dynamic:segment".
    pub fn as_storage(&self) -> String {
        match self {
            EntityType::Known { known } => known.as_str().to_string(),
            EntityType::Dynamic { name } => format!("dynamic:{}", name),
        }
    }

    pub fn from_storage(raw: &str) -> Self {
        match raw {
            "company" => EntityType::known(KnownEntityType::Company),
            "person" => EntityType::known(KnownEntityType::Person),
            "metric" => EntityType::known(KnownEntityType::Metric),
            "product" => EntityType::known(KnownEntityType::Product),
            "location" => EntityType::known(KnownEntityType::Location),
            other => EntityType::Dynamic {
                name: other.strip_prefix("dynamic:").unwrap_or(other).to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub deal_id: String,
    pub name: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
    pub created_at: String, // RFC3339
}

// ============================================================================
// Relationship Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationKind {
    Supports,
    Contradicts,
    Supersedes,
    ExtractedFrom,
    RelatedTo,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Supports => "SUPPORTS",
            RelationKind::Contradicts => "CONTRADICTS",
            RelationKind::Supersedes => "SUPERSEDES",
            RelationKind::ExtractedFrom => "EXTRACTED_FROM",
            RelationKind::RelatedTo => "RELATED_TO",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "SUPPORTS" => Some(RelationKind::Supports),
            "CONTRADICTS" => Some(RelationKind::Contradicts),
            "SUPERSEDES" => Some(RelationKind::Supersedes),
            "EXTRACTED_FROM" => Some(RelationKind::ExtractedFrom),
            "RELATED_TO" => Some(RelationKind::RelatedTo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "node", content = "id", rename_all = "snake_case")]
pub enum NodeRef {
    Fact(FactId),
    Entity(EntityId),
    Chunk(ChunkId),
}

impl NodeRef {
    pub fn kind_str(&self) -> &'static str {
        match self {
            NodeRef::Fact(_) => "fact",
            NodeRef::Entity(_) => "entity",
            NodeRef::Chunk(_) => "chunk",
        }
    }

    pub fn id_str(&self) -> &str {
        match self {
            NodeRef::Fact(id) => &id.0,
            NodeRef::Entity(id) => &id.0,
            NodeRef::Chunk(id) => &id.0,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "fact" => Some(NodeRef::Fact(FactId(id))),
            "entity" => Some(NodeRef::Entity(EntityId(id))),
            "chunk" => Some(NodeRef::Chunk(ChunkId(id))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationId,
    pub kind: RelationKind,
    pub source: NodeRef,
    pub target: NodeRef,
    pub rationale: Option<String>,
    pub created_at: String, // RFC3339
}

// ============================================================================
// Contradiction Resolution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionDecision {
    #[serde(rename = "accept_new")]
    AcceptNew,
    #[serde(rename = "keep_old")]
    KeepOld,
    #[serde(rename = "acceptable_difference")]
    AcceptableDifference,
}

impl ResolutionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionDecision::AcceptNew => "accept_new",
            ResolutionDecision::KeepOld => "keep_old",
            ResolutionDecision::AcceptableDifference => "acceptable_difference",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContradictionResolution {
    pub id: ResolutionId,
    pub fact_a: FactId,
    pub fact_b: FactId,
    pub decision: ResolutionDecision,
    pub note: Option<String>,
    pub resolved_at: String, // RFC3339
}

// ============================================================================
// Memory Cache Schema
// ============================================================================

/// Cached per-topic summary keyed by `(deal_id, topic)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryFile {
    pub deal_id: String,
    pub topic: String,
    pub content: String,
    pub version: u64,
    pub stale: bool,
    pub last_regenerated_at: Option<String>, // RFC3339
}

// ============================================================================
// Tier State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "fast_path")]
    FastPath,
    #[serde(rename = "deep_graph")]
    DeepGraph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl TierStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierStatus::Pending => "pending",
            TierStatus::Running => "running",
            TierStatus::Completed => "completed",
            TierStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(TierStatus::Pending),
            "running" => Some(TierStatus::Running),
            "completed" => Some(TierStatus::Completed),
            "failed" => Some(TierStatus::Failed),
            _ => None,
        }
    }
}

/// Completion event emitted by either tier for a chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierEvent {
    pub chunk_id: ChunkId,
    pub tier: Tier,
    pub status: TierStatus,
    pub at: String, // RFC3339
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub chunk_id: ChunkId,
    pub pipeline_version: String,
    pub document_id: String,
    pub status: TierStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: String, // RFC3339
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub document_id: String,
    pub chunks: usize,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilters {
    #[serde(default)]
    pub deal_id: Option<String>,
    #[serde(default)]
    pub time_range: Option<Period>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
    /// Audit mode: return superseded facts too (never ranked above their replacements).
    #[serde(default)]
    pub include_superseded: bool,
    /// Raw search on just-uploaded content, skipping the graph tier.
    #[serde(default)]
    pub fast_path_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default = "default_query_limit")]
    pub limit: usize,
}

fn default_query_limit() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultItem {
    pub content: String,
    pub confidence: f32,
    pub source: Source,
    pub superseded: bool,
    pub relationships: Vec<Relationship>,
    pub fact_id: Option<FactId>,
    pub chunk_id: Option<ChunkId>,
    pub status: Option<FactStatus>,
    pub tier: Tier,
    /// False for raw fast-path hits that have not been through deep extraction.
    pub verified: bool,
    pub score: f32,
    pub discovered_at: String, // RFC3339
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Coverage {
    #[serde(rename = "graph")]
    Graph,
    #[serde(rename = "merged")]
    Merged,
    #[serde(rename = "fast_path")]
    FastPath,
    #[serde(rename = "empty")]
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub items: Vec<QueryResultItem>,
    pub coverage: Coverage,
    /// Chunks in scope whose deep extraction has not completed yet.
    pub pending_chunks: usize,
    /// Reranking timed out and items are in their pre-rerank order.
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertFactRequest {
    pub deal_id: String,
    pub content: String,
    pub confidence: f32,
    #[serde(default)]
    pub discovered_at: Option<String>, // RFC3339
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertFactResponse {
    pub fact_id: FactId,
    pub status: FactStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub fact_a: FactId,
    pub fact_b: FactId,
    pub decision: ResolutionDecision,
    #[serde(default)]
    pub note: Option<String>,
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn generate_chunk_id() -> ChunkId {
    ChunkId(format!("chk_{}", ulid::Ulid::new()))
}

pub fn generate_fact_id() -> FactId {
    FactId(format!("fact_{}", ulid::Ulid::new()))
}

pub fn generate_entity_id() -> EntityId {
    EntityId(format!("ent_{}", ulid::Ulid::new()))
}

pub fn generate_relation_id() -> RelationId {
    RelationId(format!("rel_{}", ulid::Ulid::new()))
}

pub fn generate_resolution_id() -> ResolutionId {
    ResolutionId(format!("res_{}", ulid::Ulid::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation() {
        let fact_id = generate_fact_id();
        assert!(fact_id.0.starts_with("fact_"));
        assert_eq!(fact_id.0.len(), 31); // "fact_" + 26 chars

        assert!(generate_chunk_id().0.starts_with("chk_"));
        assert!(generate_entity_id().0.starts_with("ent_"));
        assert!(generate_relation_id().0.starts_with("rel_"));
    }

    #[test]
    fn test_fiscal_years_do_not_overlap() {
        let fy23 = Period::year(2023).unwrap();
        let fy24 = Period::year(2024).unwrap();
        assert!(!fy23.overlaps(&fy24));
        assert!(fy23.overlaps(&fy23));
    }

    #[test]
    fn test_quarter_overlaps_its_year() {
        let q3 = Period::quarter(3, Some(2023)).unwrap();
        assert_eq!(q3.start, NaiveDate::from_ymd_opt(2023, 7, 1));
        assert_eq!(q3.end, NaiveDate::from_ymd_opt(2023, 9, 30));
        assert!(q3.overlaps(&Period::year(2023).unwrap()));
        assert!(!q3.overlaps(&Period::quarter(4, Some(2023)).unwrap()));
    }

    #[test]
    fn test_label_only_periods_compare_by_label() {
        let a = Period::quarter(3, None).unwrap();
        let b = Period::labeled("q3");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&Period::quarter(2, None).unwrap()));
        assert!(periods_overlap(None, Some(&a)));
    }

    #[test]
    fn test_numeric_relative_difference() {
        let a = FactValue::Numeric {
            amount: 5.2e6,
            unit: Some("USD".into()),
        };
        let b = FactValue::Numeric {
            amount: 5.0e6,
            unit: Some("usd".into()),
        };
        let diff = a.relative_difference(&b).unwrap();
        assert!((diff - 0.2 / 5.2).abs() < 1e-9);

        let text = FactValue::Text {
            text: "Acme".into(),
        };
        assert!(a.relative_difference(&text).is_none());
    }

    #[test]
    fn test_entity_type_storage_round_trip() {
        let known = EntityType::known(KnownEntityType::Metric);
        assert_eq!(EntityType::from_storage(&known.as_storage()), known);

        let dynamic = EntityType::Dynamic {
            name: "segment".into(),
        };
        assert_eq!(dynamic.as_storage(), "dynamic:segment");
        assert_eq!(EntityType::from_storage("dynamic:segment"), dynamic);
    }

    #[test]
    fn test_query_request_defaults() {
        let request: QueryRequest = serde_json::from_str(r#"{"text":"Q3 revenue"}"#).unwrap();
        assert_eq!(request.limit, 10);
        assert!(!request.filters.include_superseded);
        assert!(!request.filters.fast_path_only);
    }

    #[test]
    fn test_fact_serialization() {
        let fact = Fact {
            id: generate_fact_id(),
            deal_id: "deal_1".into(),
            content: "Q3 revenue = 5.2M".into(),
            entity_ref: Some(generate_entity_id()),
            attribute: Some("revenue".into()),
            value: Some(FactValue::Numeric {
                amount: 5.2e6,
                unit: None,
            }),
            period: Period::quarter(3, None),
            topic: "financials".into(),
            confidence: 0.8,
            source: Source::document("deck.pdf", Locator::Page { page: 4 }),
            chunk_id: None,
            extraction_key: None,
            discovered_at: "2025-11-02T18:00:00Z".into(),
            status: FactStatus::Unvalidated,
        };

        let json = serde_json::to_string(&fact).unwrap();
        let restored: Fact = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.content, fact.content);
        assert_eq!(restored.source, fact.source);
        assert_eq!(restored.period, fact.period);
    }
}
