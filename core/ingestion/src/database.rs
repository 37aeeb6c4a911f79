use chrono::Utc;
use deal_memory_schemas::{
    generate_relation_id, Chunk, ChunkId, ContradictionResolution, DocumentStatus, Entity,
    EntityId, EntityType, ExtractionJob, Fact, FactId, FactStatus, FactValue, Locator,
    MemoryFile, NodeRef, Period, RelationId, RelationKind, Relationship, ResolutionId, Source,
    SourceKind, TierStatus,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::text;

/// Fact store shared between the tiers. Writers hold the lock only for store calls.
pub type SharedStore = Arc<Mutex<FactStore>>;

const FACT_COLUMNS: &str = "f.id, f.deal_id, f.content, f.entity_id, f.attribute, f.value,
     f.period, f.topic, f.confidence, f.source_kind, f.document_id, f.locator,
     f.chunk_id, f.extraction_key, f.discovered_at, f.status";

/// Outcome of an idempotent fact insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactInsert {
    Inserted(FactId),
    /// A fact with the same extraction key already exists.
    Existing(FactId),
}

impl FactInsert {
    pub fn fact_id(&self) -> &FactId {
        match self {
            FactInsert::Inserted(id) | FactInsert::Existing(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, FactInsert::Inserted(_))
    }
}

/// A document the store has seen chunks from.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub deal_id: String,
    pub name: Option<String>,
    pub first_seen_at: String,
}

/// Cached memory file plus the invalidation epoch used for compare-and-swap commits.
#[derive(Debug, Clone)]
pub struct MemoryFileRecord {
    pub file: MemoryFile,
    pub epoch: u64,
}

/// One broken store invariant, as reported by [`FactStore::check_invariants`].
#[derive(Debug, Clone, Serialize)]
pub struct InvariantFinding {
    pub rule: &'static str,
    pub subject: String,
    pub detail: String,
}

/// Durable, append-mostly storage of chunks, facts, entities and edges.
///
/// Facts are never deleted. The only in-place mutations are status and
/// confidence updates issued by the consistency engine.
pub struct FactStore {
    conn: Connection,
}

impl FactStore {
    /// Open (or create) the store at `path`. `":memory:"` gives a private in-memory store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self { conn };
        store.init_schema()?;

        info!("Fact store initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Liveness check that reads the schema page from disk; queries fail
    /// closed when this errors.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(EngineError::StoreUnavailable)?;
        Ok(())
    }

    /// Run `f` inside a transaction. Nested calls join the outer transaction.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                name TEXT,
                first_seen_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                document_name TEXT,
                locator TEXT NOT NULL,
                text TEXT NOT NULL,
                mime TEXT,
                supersedes_document TEXT,
                received_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS facts (
                id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                content TEXT NOT NULL,
                entity_id TEXT,
                attribute TEXT,
                value TEXT,
                period TEXT,
                topic TEXT NOT NULL,
                confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
                source_kind TEXT NOT NULL,
                document_id TEXT NOT NULL,
                locator TEXT NOT NULL,
                chunk_id TEXT,
                extraction_key TEXT UNIQUE,
                discovered_at TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
                content,
                attribute,
                topic,
                content='facts',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
                INSERT INTO facts_fts(rowid, content, attribute, topic)
                VALUES (new.rowid, new.content, new.attribute, new.topic);
            END;

            CREATE TABLE IF NOT EXISTS fact_embeddings (
                fact_id TEXT PRIMARY KEY REFERENCES facts(id),
                vector TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                name TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entity_aliases (
                entity_id TEXT NOT NULL REFERENCES entities(id),
                alias TEXT NOT NULL,
                normalized_alias TEXT NOT NULL,
                PRIMARY KEY (entity_id, normalized_alias)
            );

            CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                source_id TEXT NOT NULL,
                target_kind TEXT NOT NULL,
                target_id TEXT NOT NULL,
                rationale TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (kind, source_kind, source_id, target_kind, target_id)
            );

            CREATE TABLE IF NOT EXISTS document_supersessions (
                new_document_id TEXT NOT NULL,
                old_document_id TEXT NOT NULL,
                deal_id TEXT NOT NULL,
                reason TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (new_document_id, old_document_id)
            );

            CREATE TABLE IF NOT EXISTS extraction_jobs (
                chunk_id TEXT NOT NULL,
                pipeline_version TEXT NOT NULL,
                document_id TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (chunk_id, pipeline_version)
            );

            CREATE TABLE IF NOT EXISTS resolutions (
                id TEXT PRIMARY KEY,
                fact_a TEXT NOT NULL,
                fact_b TEXT NOT NULL,
                decision TEXT NOT NULL,
                note TEXT,
                resolved_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS memory_files (
                deal_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                version INTEGER NOT NULL DEFAULT 0,
                stale INTEGER NOT NULL DEFAULT 1,
                epoch INTEGER NOT NULL DEFAULT 0,
                last_regenerated_at TEXT,
                PRIMARY KEY (deal_id, topic)
            );

            CREATE TABLE IF NOT EXISTS memory_file_deps (
                deal_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                fact_id TEXT NOT NULL,
                PRIMARY KEY (deal_id, topic, fact_id)
            );

            CREATE INDEX IF NOT EXISTS idx_facts_subject ON facts(deal_id, entity_id, attribute);
            CREATE INDEX IF NOT EXISTS idx_facts_topic ON facts(deal_id, topic);
            CREATE INDEX IF NOT EXISTS idx_facts_document ON facts(document_id);
            CREATE INDEX IF NOT EXISTS idx_facts_chunk ON facts(chunk_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
            CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(deal_id, normalized_name);
            CREATE INDEX IF NOT EXISTS idx_aliases_name ON entity_aliases(normalized_alias);
            CREATE INDEX IF NOT EXISTS idx_relations_source ON relationships(source_kind, source_id);
            CREATE INDEX IF NOT EXISTS idx_relations_target ON relationships(target_kind, target_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON extraction_jobs(pipeline_version, status);
            CREATE INDEX IF NOT EXISTS idx_deps_fact ON memory_file_deps(fact_id);",
        )?;

        debug!("Fact store schema initialized");
        Ok(())
    }

    // ========== CHUNKS & DOCUMENTS ==========

    /// Store a chunk. Returns false when the chunk id was already known.
    pub fn insert_chunk(&self, chunk: &Chunk) -> Result<bool> {
        let locator = serde_json::to_string(&chunk.locator)?;

        self.transaction(|store| {
            store.conn.execute(
                "INSERT OR IGNORE INTO documents (document_id, deal_id, name, first_seen_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    chunk.document_id,
                    chunk.deal_id,
                    chunk.document_name,
                    chunk.received_at
                ],
            )?;

            let inserted = store.conn.execute(
                "INSERT OR IGNORE INTO chunks (chunk_id, deal_id, document_id, document_name,
                                               locator, text, mime, supersedes_document, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    chunk.chunk_id.0,
                    chunk.deal_id,
                    chunk.document_id,
                    chunk.document_name,
                    locator,
                    chunk.text,
                    chunk.mime,
                    chunk.supersedes_document,
                    chunk.received_at,
                ],
            )?;

            Ok(inserted > 0)
        })
    }

    pub fn get_chunk(&self, chunk_id: &ChunkId) -> Result<Option<Chunk>> {
        let chunk = self
            .conn
            .query_row(
                "SELECT chunk_id, deal_id, document_id, document_name, locator, text, mime,
                        supersedes_document, received_at
                 FROM chunks WHERE chunk_id = ?1",
                params![chunk_id.0],
                row_to_chunk,
            )
            .optional()?;

        Ok(chunk)
    }

    pub fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT chunk_id, deal_id, document_id, document_name, locator, text, mime,
                    supersedes_document, received_at
             FROM chunks WHERE document_id = ?1
             ORDER BY received_at, chunk_id",
        )?;

        let chunks = stmt
            .query_map(params![document_id], row_to_chunk)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(chunks)
    }

    pub fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let doc = self
            .conn
            .query_row(
                "SELECT document_id, deal_id, name, first_seen_at FROM documents WHERE document_id = ?1",
                params![document_id],
                row_to_document,
            )
            .optional()?;
        Ok(doc)
    }

    pub fn documents_for_deal(&self, deal_id: &str) -> Result<Vec<DocumentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT document_id, deal_id, name, first_seen_at
             FROM documents WHERE deal_id = ?1
             ORDER BY first_seen_at",
        )?;

        let docs = stmt
            .query_map(params![deal_id], row_to_document)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(docs)
    }

    // ========== FACTS ==========

    /// Insert a fact. Idempotent on `extraction_key`: a retry of the same
    /// extraction returns the id of the fact written the first time.
    pub fn insert_fact(&self, fact: &Fact) -> Result<FactInsert> {
        if fact.source.document_id.trim().is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "fact {} has no source document",
                fact.id
            )));
        }
        if !(0.0..=1.0).contains(&fact.confidence) {
            return Err(EngineError::InvalidInput(format!(
                "confidence {} out of range for fact {}",
                fact.confidence, fact.id
            )));
        }

        if let Some(key) = &fact.extraction_key {
            if let Some(existing) = self.fact_id_by_extraction_key(key)? {
                debug!("Fact with extraction key {} already stored as {}", key, existing);
                return Ok(FactInsert::Existing(existing));
            }
        }

        let value = fact.value.as_ref().map(serde_json::to_string).transpose()?;
        let period = fact.period.as_ref().map(serde_json::to_string).transpose()?;
        let locator = serde_json::to_string(&fact.source.locator)?;

        self.conn.execute(
            "INSERT INTO facts (id, deal_id, content, entity_id, attribute, value, period, topic,
                                confidence, source_kind, document_id, locator, chunk_id,
                                extraction_key, discovered_at, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                fact.id.0,
                fact.deal_id,
                fact.content,
                fact.entity_ref.as_ref().map(|e| e.0.as_str()),
                fact.attribute,
                value,
                period,
                fact.topic,
                fact.confidence as f64,
                fact.source.kind.as_str(),
                fact.source.document_id,
                locator,
                fact.chunk_id.as_ref().map(|c| c.0.as_str()),
                fact.extraction_key,
                fact.discovered_at,
                fact.status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        debug!("Inserted fact: {} ({})", fact.id, fact.content);
        Ok(FactInsert::Inserted(fact.id.clone()))
    }

    fn fact_id_by_extraction_key(&self, key: &str) -> Result<Option<FactId>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM facts WHERE extraction_key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id.map(FactId))
    }

    pub fn get_fact(&self, id: &FactId) -> Result<Option<Fact>> {
        let sql = format!("SELECT {} FROM facts f WHERE f.id = ?1", FACT_COLUMNS);
        let fact = self
            .conn
            .query_row(&sql, params![id.0], row_to_fact)
            .optional()?;
        Ok(fact)
    }

    /// Like [`get_fact`](Self::get_fact) but a missing fact is an error.
    pub fn require_fact(&self, id: &FactId) -> Result<Fact> {
        self.get_fact(id)?
            .ok_or_else(|| EngineError::not_found("fact", id.0.clone()))
    }

    pub fn get_facts(&self, ids: &[FactId]) -> Result<Vec<Fact>> {
        let mut facts = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(fact) = self.get_fact(id)? {
                facts.push(fact);
            }
        }
        Ok(facts)
    }

    /// Every fact about the same deal, entity and attribute, oldest first.
    pub fn facts_for_subject(
        &self,
        deal_id: &str,
        entity_id: &EntityId,
        attribute: Option<&str>,
    ) -> Result<Vec<Fact>> {
        let sql = format!(
            "SELECT {} FROM facts f
             WHERE f.deal_id = ?1 AND f.entity_id = ?2 AND f.attribute IS ?3
             ORDER BY f.discovered_at, f.rowid",
            FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let facts = stmt
            .query_map(params![deal_id, entity_id.0, attribute], row_to_fact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(facts)
    }

    /// Keyword search over fact content. Scores are bm25 mapped into `[0, 1)`.
    pub fn search_facts(
        &self,
        query: &str,
        deal_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(Fact, f32)>> {
        let Some(expression) = text::fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        let sql = format!(
            "SELECT {}, bm25(facts_fts) AS rank
             FROM facts f
             JOIN facts_fts ON f.rowid = facts_fts.rowid
             WHERE facts_fts MATCH ?1 AND (?2 IS NULL OR f.deal_id = ?2)
             ORDER BY rank
             LIMIT ?3",
            FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let hits = stmt
            .query_map(params![expression, deal_id, limit as i64], |row| {
                let fact = row_to_fact(row)?;
                let rank: f64 = row.get(16)?;
                Ok((fact, bm25_to_score(rank)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(hits)
    }

    pub fn facts_by_topic(&self, deal_id: &str, topic: &str) -> Result<Vec<Fact>> {
        let sql = format!(
            "SELECT {} FROM facts f
             WHERE f.deal_id = ?1 AND f.topic = ?2
             ORDER BY f.discovered_at DESC, f.rowid DESC",
            FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let facts = stmt
            .query_map(params![deal_id, topic], row_to_fact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(facts)
    }

    pub fn facts_by_entity(&self, entity_id: &EntityId, limit: usize) -> Result<Vec<Fact>> {
        let sql = format!(
            "SELECT {} FROM facts f
             WHERE f.entity_id = ?1
             ORDER BY f.discovered_at DESC
             LIMIT ?2",
            FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let facts = stmt
            .query_map(params![entity_id.0, limit as i64], row_to_fact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(facts)
    }

    pub fn facts_for_document(&self, document_id: &str) -> Result<Vec<Fact>> {
        let sql = format!(
            "SELECT {} FROM facts f WHERE f.document_id = ?1 ORDER BY f.rowid",
            FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let facts = stmt
            .query_map(params![document_id], row_to_fact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(facts)
    }

    pub fn facts_for_chunk(&self, chunk_id: &ChunkId) -> Result<Vec<Fact>> {
        let sql = format!(
            "SELECT {} FROM facts f WHERE f.chunk_id = ?1 ORDER BY f.rowid",
            FACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let facts = stmt
            .query_map(params![chunk_id.0], row_to_fact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(facts)
    }

    /// Distinct topics with at least one fact for a deal.
    pub fn topics_for_deal(&self, deal_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT topic FROM facts WHERE deal_id = ?1 ORDER BY topic")?;
        let topics = stmt
            .query_map(params![deal_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(topics)
    }

    pub fn update_fact_status(&self, id: &FactId, status: FactStatus) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE facts SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id.0],
        )?;
        if updated == 0 {
            return Err(EngineError::not_found("fact", id.0.clone()));
        }
        debug!("Fact {} -> {}", id, status.as_str());
        Ok(())
    }

    /// Set confidence, clamped to `[0, 1]`.
    pub fn update_fact_confidence(&self, id: &FactId, confidence: f32) -> Result<()> {
        let clamped = confidence.clamp(0.0, 1.0);
        let updated = self.conn.execute(
            "UPDATE facts SET confidence = ?1, updated_at = ?2 WHERE id = ?3",
            params![clamped as f64, Utc::now().to_rfc3339(), id.0],
        )?;
        if updated == 0 {
            return Err(EngineError::not_found("fact", id.0.clone()));
        }
        Ok(())
    }

    pub fn count_facts(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn store_fact_embedding(&self, fact_id: &FactId, vector: &[f32]) -> Result<()> {
        let encoded = serde_json::to_string(vector)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO fact_embeddings (fact_id, vector) VALUES (?1, ?2)",
            params![fact_id.0, encoded],
        )?;
        Ok(())
    }

    /// Stored fact embeddings, optionally restricted to one deal.
    pub fn fact_embeddings(&self, deal_id: Option<&str>) -> Result<Vec<(FactId, Vec<f32>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.fact_id, e.vector FROM fact_embeddings e
             JOIN facts f ON f.id = e.fact_id
             WHERE ?1 IS NULL OR f.deal_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![deal_id], |row| {
                let raw: String = row.get(1)?;
                let vector: Vec<f32> = serde_json::from_str(&raw).map_err(json_error)?;
                Ok((FactId(row.get(0)?), vector))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========== RELATIONSHIPS ==========

    /// Create a typed edge. Idempotent per `(kind, source, target)`.
    ///
    /// A fact-to-fact SUPERSEDES edge also flips the target to `superseded`, and
    /// is refused when the target already has an incoming SUPERSEDES edge from a
    /// different fact or when the edge would close a cycle.
    pub fn insert_relationship(
        &self,
        kind: RelationKind,
        source: &NodeRef,
        target: &NodeRef,
        rationale: Option<&str>,
    ) -> Result<Relationship> {
        if source == target {
            return Err(EngineError::InvariantViolation(format!(
                "{} edge from {} to itself",
                kind.as_str(),
                source.id_str()
            )));
        }

        if let Some(existing) = self.find_relationship(kind, source, target)? {
            debug!(
                "Relation already exists: {} -{}-> {}",
                source.id_str(),
                kind.as_str(),
                target.id_str()
            );
            return Ok(existing);
        }

        self.transaction(|store| {
            if kind == RelationKind::Supersedes {
                if let (NodeRef::Fact(new_id), NodeRef::Fact(old_id)) = (source, target) {
                    let incoming = store.incoming_supersedes(old_id)?;
                    if let Some(other) = incoming.iter().find(|id| *id != new_id) {
                        return Err(EngineError::InvariantViolation(format!(
                            "fact {} is already superseded by {}",
                            old_id, other
                        )));
                    }
                    if store.supersedes_path_exists(old_id, new_id)? {
                        return Err(EngineError::InvariantViolation(format!(
                            "superseding {} by {} would create a cycle",
                            old_id, new_id
                        )));
                    }
                }
            }

            let relationship = Relationship {
                id: generate_relation_id(),
                kind,
                source: source.clone(),
                target: target.clone(),
                rationale: rationale.map(str::to_string),
                created_at: Utc::now().to_rfc3339(),
            };

            store.conn.execute(
                "INSERT INTO relationships (id, kind, source_kind, source_id, target_kind,
                                            target_id, rationale, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    relationship.id.0,
                    kind.as_str(),
                    source.kind_str(),
                    source.id_str(),
                    target.kind_str(),
                    target.id_str(),
                    relationship.rationale,
                    relationship.created_at,
                ],
            )?;

            if kind == RelationKind::Supersedes {
                if let NodeRef::Fact(old_id) = target {
                    store.update_fact_status(old_id, FactStatus::Superseded)?;
                    info!("Fact {} superseded by {}", old_id, source.id_str());
                }
            }

            debug!(
                "Created relation: {} -{}-> {} ({})",
                source.id_str(),
                kind.as_str(),
                target.id_str(),
                relationship.id
            );
            Ok(relationship)
        })
    }

    fn find_relationship(
        &self,
        kind: RelationKind,
        source: &NodeRef,
        target: &NodeRef,
    ) -> Result<Option<Relationship>> {
        let rel = self
            .conn
            .query_row(
                "SELECT id, kind, source_kind, source_id, target_kind, target_id, rationale, created_at
                 FROM relationships
                 WHERE kind = ?1 AND source_kind = ?2 AND source_id = ?3
                   AND target_kind = ?4 AND target_id = ?5",
                params![
                    kind.as_str(),
                    source.kind_str(),
                    source.id_str(),
                    target.kind_str(),
                    target.id_str()
                ],
                row_to_relationship,
            )
            .optional()?;
        Ok(rel)
    }

    /// Every edge touching `node`, in either direction.
    pub fn relationships_for(&self, node: &NodeRef) -> Result<Vec<Relationship>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, source_kind, source_id, target_kind, target_id, rationale, created_at
             FROM relationships
             WHERE (source_kind = ?1 AND source_id = ?2) OR (target_kind = ?1 AND target_id = ?2)
             ORDER BY created_at",
        )?;
        let rels = stmt
            .query_map(params![node.kind_str(), node.id_str()], row_to_relationship)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rels)
    }

    /// Fact-to-fact edges of one kind between `a` and `b`, in either direction.
    pub fn relationships_between(
        &self,
        kind: RelationKind,
        a: &FactId,
        b: &FactId,
    ) -> Result<Vec<Relationship>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, source_kind, source_id, target_kind, target_id, rationale, created_at
             FROM relationships
             WHERE kind = ?1 AND source_kind = 'fact' AND target_kind = 'fact'
               AND ((source_id = ?2 AND target_id = ?3) OR (source_id = ?3 AND target_id = ?2))",
        )?;
        let rels = stmt
            .query_map(params![kind.as_str(), a.0, b.0], row_to_relationship)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rels)
    }

    /// Facts with a SUPERSEDES edge pointing at `fact_id`.
    pub fn incoming_supersedes(&self, fact_id: &FactId) -> Result<Vec<FactId>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_id FROM relationships
             WHERE kind = 'SUPERSEDES' AND source_kind = 'fact'
               AND target_kind = 'fact' AND target_id = ?1",
        )?;
        let ids = stmt
            .query_map(params![fact_id.0], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(FactId).collect())
    }

    /// Facts that `fact_id` supersedes directly.
    pub fn outgoing_supersedes(&self, fact_id: &FactId) -> Result<Vec<FactId>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_id FROM relationships
             WHERE kind = 'SUPERSEDES' AND source_kind = 'fact'
               AND target_kind = 'fact' AND source_id = ?1",
        )?;
        let ids = stmt
            .query_map(params![fact_id.0], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(FactId).collect())
    }

    /// Whether following SUPERSEDES edges from `from` reaches `to`.
    pub fn supersedes_path_exists(&self, from: &FactId, to: &FactId) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from.clone()]);

        while let Some(current) = queue.pop_front() {
            if &current == to {
                return Ok(true);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            queue.extend(self.outgoing_supersedes(&current)?);
        }

        Ok(false)
    }

    /// Latest fact in the correction chain that starts at `fact_id`.
    pub fn superseding_head(&self, fact_id: &FactId) -> Result<FactId> {
        let mut current = fact_id.clone();
        let mut seen = HashSet::new();
        while seen.insert(current.clone()) {
            match self.incoming_supersedes(&current)?.into_iter().next() {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(current)
    }

    // ========== DOCUMENT SUPERSESSION ==========

    /// Record that `new_document` corrects `old_document`. Returns false when
    /// already recorded. Refuses edges that would make the document graph cyclic.
    pub fn record_document_supersession(
        &self,
        deal_id: &str,
        new_document: &str,
        old_document: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        if new_document == old_document {
            return Err(EngineError::InvalidInput(format!(
                "document {} cannot supersede itself",
                new_document
            )));
        }
        if self.document_supersedes(old_document, new_document)? {
            return Err(EngineError::InvariantViolation(format!(
                "document {} already supersedes {}",
                old_document, new_document
            )));
        }

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO document_supersessions
                (new_document_id, old_document_id, deal_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                new_document,
                old_document,
                deal_id,
                reason,
                Utc::now().to_rfc3339()
            ],
        )?;

        if inserted > 0 {
            info!("Document {} supersedes {}", new_document, old_document);
        }
        Ok(inserted > 0)
    }

    /// Whether a chain of document corrections leads from `newer` to `older`.
    pub fn document_supersedes(&self, newer: &str, older: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare(
            "SELECT old_document_id FROM document_supersessions WHERE new_document_id = ?1",
        )?;

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([newer.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let next = stmt
                .query_map(params![current], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for doc in next {
                if doc == older {
                    return Ok(true);
                }
                queue.push_back(doc);
            }
        }

        Ok(false)
    }

    /// Supersession path between two documents in either direction.
    pub fn document_supersession_path_exists(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self.document_supersedes(a, b)? || self.document_supersedes(b, a)?)
    }

    /// Of the given documents, those a later document corrects.
    pub fn superseded_documents<'a>(
        &self,
        document_ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT EXISTS(SELECT 1 FROM document_supersessions WHERE old_document_id = ?1)",
        )?;

        let mut superseded = HashSet::new();
        for document_id in document_ids {
            if superseded.contains(document_id) {
                continue;
            }
            let exists: bool = stmt.query_row(params![document_id], |row| row.get(0))?;
            if exists {
                superseded.insert(document_id.to_string());
            }
        }
        Ok(superseded)
    }

    // ========== ENTITIES ==========

    pub fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.transaction(|store| {
            store.conn.execute(
                "INSERT INTO entities (id, deal_id, name, normalized_name, entity_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entity.id.0,
                    entity.deal_id,
                    entity.name,
                    text::normalize_name(&entity.name),
                    entity.entity_type.as_storage(),
                    entity.created_at,
                ],
            )?;
            for alias in &entity.aliases {
                store.add_entity_alias(&entity.id, alias)?;
            }
            Ok(())
        })?;

        debug!("Inserted entity {} ({})", entity.id, entity.name);
        Ok(())
    }

    /// Add a surface form for an entity. Returns false when the alias was known.
    pub fn add_entity_alias(&self, entity_id: &EntityId, alias: &str) -> Result<bool> {
        let normalized = text::normalize_name(alias);
        if normalized.is_empty() {
            return Ok(false);
        }
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO entity_aliases (entity_id, alias, normalized_alias)
             VALUES (?1, ?2, ?3)",
            params![entity_id.0, alias, normalized],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>> {
        let entity = self
            .conn
            .query_row(
                "SELECT id, deal_id, name, entity_type, created_at FROM entities WHERE id = ?1",
                params![id.0],
                row_to_entity_base,
            )
            .optional()?;

        match entity {
            Some(mut entity) => {
                entity.aliases = self.entity_aliases(&entity.id)?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    fn entity_aliases(&self, id: &EntityId) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT alias FROM entity_aliases WHERE entity_id = ?1 ORDER BY alias")?;
        let aliases = stmt
            .query_map(params![id.0], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(aliases)
    }

    /// Exact match on normalized name or alias within a deal.
    pub fn find_entity_by_name(&self, deal_id: &str, name: &str) -> Result<Option<Entity>> {
        let normalized = text::normalize_name(name);
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT e.id FROM entities e
                 WHERE e.deal_id = ?1 AND (
                     e.normalized_name = ?2
                     OR EXISTS (SELECT 1 FROM entity_aliases a
                                WHERE a.entity_id = e.id AND a.normalized_alias = ?2))
                 ORDER BY e.created_at
                 LIMIT 1",
                params![deal_id, normalized],
                |row| row.get(0),
            )
            .optional()?;

        match id {
            Some(id) => self.get_entity(&EntityId(id)),
            None => Ok(None),
        }
    }

    /// Entities of a deal, optionally restricted to one type.
    pub fn find_entities(
        &self,
        deal_id: &str,
        entity_type: Option<&EntityType>,
    ) -> Result<Vec<Entity>> {
        let type_filter = entity_type.map(|t| t.as_storage());
        let mut stmt = self.conn.prepare(
            "SELECT id, deal_id, name, entity_type, created_at FROM entities
             WHERE deal_id = ?1 AND (?2 IS NULL OR entity_type = ?2)
             ORDER BY created_at",
        )?;
        let mut entities = stmt
            .query_map(params![deal_id, type_filter], row_to_entity_base)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for entity in &mut entities {
            entity.aliases = self.entity_aliases(&entity.id)?;
        }
        Ok(entities)
    }

    /// Entities whose name or alias shares a token with `query`.
    pub fn search_entities(&self, query: &str, deal_id: Option<&str>) -> Result<Vec<Entity>> {
        let tokens: HashSet<String> = text::tokenize(query).into_iter().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, deal_id, name, entity_type, created_at FROM entities
             WHERE ?1 IS NULL OR deal_id = ?1",
        )?;
        let candidates = stmt
            .query_map(params![deal_id], row_to_entity_base)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut matched = Vec::new();
        for mut entity in candidates {
            entity.aliases = self.entity_aliases(&entity.id)?;
            let hit = std::iter::once(&entity.name)
                .chain(entity.aliases.iter())
                .flat_map(|name| text::tokenize(name))
                .any(|token| tokens.contains(&token));
            if hit {
                matched.push(entity);
            }
        }
        Ok(matched)
    }

    pub fn count_entities(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ========== EXTRACTION JOBS ==========

    /// Register a pending job. Returns the current job state either way.
    pub fn enqueue_job(
        &self,
        chunk_id: &ChunkId,
        pipeline_version: &str,
        document_id: &str,
    ) -> Result<ExtractionJob> {
        self.conn.execute(
            "INSERT OR IGNORE INTO extraction_jobs
                (chunk_id, pipeline_version, document_id, status, attempts, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4)",
            params![
                chunk_id.0,
                pipeline_version,
                document_id,
                Utc::now().to_rfc3339()
            ],
        )?;

        self.get_job(chunk_id, pipeline_version)?
            .ok_or_else(|| EngineError::not_found("extraction job", chunk_id.0.clone()))
    }

    pub fn get_job(
        &self,
        chunk_id: &ChunkId,
        pipeline_version: &str,
    ) -> Result<Option<ExtractionJob>> {
        let job = self
            .conn
            .query_row(
                "SELECT chunk_id, pipeline_version, document_id, status, attempts, last_error, updated_at
                 FROM extraction_jobs WHERE chunk_id = ?1 AND pipeline_version = ?2",
                params![chunk_id.0, pipeline_version],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Move a job to `running` and count the attempt. Returns the attempt number.
    pub fn start_job(&self, chunk_id: &ChunkId, pipeline_version: &str) -> Result<u32> {
        self.conn.execute(
            "UPDATE extraction_jobs SET status = 'running', attempts = attempts + 1, updated_at = ?3
             WHERE chunk_id = ?1 AND pipeline_version = ?2",
            params![chunk_id.0, pipeline_version, Utc::now().to_rfc3339()],
        )?;
        let attempts: i64 = self.conn.query_row(
            "SELECT attempts FROM extraction_jobs WHERE chunk_id = ?1 AND pipeline_version = ?2",
            params![chunk_id.0, pipeline_version],
            |row| row.get(0),
        )?;
        Ok(attempts as u32)
    }

    pub fn finish_job(
        &self,
        chunk_id: &ChunkId,
        pipeline_version: &str,
        status: TierStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE extraction_jobs SET status = ?3, last_error = ?4, updated_at = ?5
             WHERE chunk_id = ?1 AND pipeline_version = ?2",
            params![
                chunk_id.0,
                pipeline_version,
                status.as_str(),
                error,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Jobs that never finished: `pending`, or `running` when a crash interrupted them.
    pub fn unfinished_jobs(&self, pipeline_version: &str) -> Result<Vec<ExtractionJob>> {
        let mut stmt = self.conn.prepare(
            "SELECT chunk_id, pipeline_version, document_id, status, attempts, last_error, updated_at
             FROM extraction_jobs
             WHERE pipeline_version = ?1 AND status IN ('pending', 'running')
             ORDER BY updated_at",
        )?;
        let jobs = stmt
            .query_map(params![pipeline_version], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Of the given chunks, those whose deep extraction has not completed.
    pub fn incomplete_chunks(
        &self,
        chunk_ids: &[ChunkId],
        pipeline_version: &str,
    ) -> Result<HashSet<ChunkId>> {
        let mut stmt = self.conn.prepare(
            "SELECT status FROM extraction_jobs WHERE chunk_id = ?1 AND pipeline_version = ?2",
        )?;

        let mut incomplete = HashSet::new();
        for chunk_id in chunk_ids {
            let status: Option<String> = stmt
                .query_row(params![chunk_id.0, pipeline_version], |row| row.get(0))
                .optional()?;
            if status.as_deref() != Some(TierStatus::Completed.as_str()) {
                incomplete.insert(chunk_id.clone());
            }
        }
        Ok(incomplete)
    }

    pub fn document_status(
        &self,
        document_id: &str,
        pipeline_version: &str,
    ) -> Result<DocumentStatus> {
        let chunks: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        if chunks == 0 && self.get_document(document_id)?.is_none() {
            return Err(EngineError::not_found("document", document_id));
        }

        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*) FROM extraction_jobs
             WHERE document_id = ?1 AND pipeline_version = ?2
             GROUP BY status",
        )?;
        let counts: HashMap<String, i64> = stmt
            .query_map(params![document_id, pipeline_version], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;

        let mut err_stmt = self.conn.prepare(
            "SELECT chunk_id, last_error FROM extraction_jobs
             WHERE document_id = ?1 AND pipeline_version = ?2
               AND status = 'failed' AND last_error IS NOT NULL",
        )?;
        let errors = err_stmt
            .query_map(params![document_id, pipeline_version], |row| {
                let chunk: String = row.get(0)?;
                let error: String = row.get(1)?;
                Ok(format!("{}: {}", chunk, error))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let count = |status: TierStatus| counts.get(status.as_str()).copied().unwrap_or(0) as usize;
        let completed = count(TierStatus::Completed);
        let failed = count(TierStatus::Failed);

        Ok(DocumentStatus {
            document_id: document_id.to_string(),
            chunks: chunks as usize,
            pending: (chunks as usize).saturating_sub(completed + failed),
            completed,
            failed,
            errors,
        })
    }

    // ========== RESOLUTIONS ==========

    pub fn record_resolution(&self, resolution: &ContradictionResolution) -> Result<()> {
        self.conn.execute(
            "INSERT INTO resolutions (id, fact_a, fact_b, decision, note, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                resolution.id.0,
                resolution.fact_a.0,
                resolution.fact_b.0,
                resolution.decision.as_str(),
                resolution.note,
                resolution.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn resolutions_for(&self, fact_id: &FactId) -> Result<Vec<ContradictionResolution>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fact_a, fact_b, decision, note, resolved_at FROM resolutions
             WHERE fact_a = ?1 OR fact_b = ?1
             ORDER BY resolved_at",
        )?;
        let rows = stmt
            .query_map(params![fact_id.0], |row| {
                let decision: String = row.get(3)?;
                let decision = serde_json::from_value(serde_json::Value::String(decision))
                    .map_err(json_error)?;
                Ok(ContradictionResolution {
                    id: ResolutionId(row.get(0)?),
                    fact_a: FactId(row.get(1)?),
                    fact_b: FactId(row.get(2)?),
                    decision,
                    note: row.get(4)?,
                    resolved_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========== MEMORY FILES ==========

    /// Load a memory file, creating an empty stale entry when missing.
    pub fn ensure_memory_file(&self, deal_id: &str, topic: &str) -> Result<MemoryFileRecord> {
        self.conn.execute(
            "INSERT OR IGNORE INTO memory_files (deal_id, topic) VALUES (?1, ?2)",
            params![deal_id, topic],
        )?;
        self.get_memory_file(deal_id, topic)?
            .ok_or_else(|| EngineError::not_found("memory file", format!("{}/{}", deal_id, topic)))
    }

    pub fn get_memory_file(&self, deal_id: &str, topic: &str) -> Result<Option<MemoryFileRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT deal_id, topic, content, version, stale, epoch, last_regenerated_at
                 FROM memory_files WHERE deal_id = ?1 AND topic = ?2",
                params![deal_id, topic],
                |row| {
                    Ok(MemoryFileRecord {
                        file: MemoryFile {
                            deal_id: row.get(0)?,
                            topic: row.get(1)?,
                            content: row.get(2)?,
                            version: row.get::<_, i64>(3)? as u64,
                            stale: row.get::<_, i64>(4)? != 0,
                            last_regenerated_at: row.get(6)?,
                        },
                        epoch: row.get::<_, i64>(5)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Commit a regenerated summary if nothing invalidated the entry since
    /// `expected_epoch` was read. Returns `None` when the compare-and-swap lost.
    pub fn commit_memory_file(
        &self,
        deal_id: &str,
        topic: &str,
        content: &str,
        expected_epoch: u64,
        dependencies: &[FactId],
    ) -> Result<Option<MemoryFile>> {
        self.transaction(|store| {
            let updated = store.conn.execute(
                "UPDATE memory_files
                 SET content = ?3, version = version + 1, stale = 0, last_regenerated_at = ?4
                 WHERE deal_id = ?1 AND topic = ?2 AND epoch = ?5",
                params![
                    deal_id,
                    topic,
                    content,
                    Utc::now().to_rfc3339(),
                    expected_epoch as i64
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }

            store.conn.execute(
                "DELETE FROM memory_file_deps WHERE deal_id = ?1 AND topic = ?2",
                params![deal_id, topic],
            )?;
            let mut stmt = store.conn.prepare(
                "INSERT OR IGNORE INTO memory_file_deps (deal_id, topic, fact_id) VALUES (?1, ?2, ?3)",
            )?;
            for fact_id in dependencies {
                stmt.execute(params![deal_id, topic, fact_id.0])?;
            }

            Ok(store.get_memory_file(deal_id, topic)?.map(|record| record.file))
        })
    }

    /// Mark topics stale and bump their epochs. Missing entries are left alone.
    pub fn invalidate_topics(&self, deal_id: &str, topics: &[String]) -> Result<usize> {
        let mut stmt = self.conn.prepare(
            "UPDATE memory_files SET stale = 1, epoch = epoch + 1 WHERE deal_id = ?1 AND topic = ?2",
        )?;
        let mut total = 0;
        for topic in topics {
            total += stmt.execute(params![deal_id, topic])?;
        }
        Ok(total)
    }

    /// Invalidate every memory file built from any of `fact_ids`.
    pub fn invalidate_by_facts(&self, fact_ids: &[FactId]) -> Result<Vec<(String, String)>> {
        self.transaction(|store| {
            let mut select = store.conn.prepare(
                "SELECT DISTINCT deal_id, topic FROM memory_file_deps WHERE fact_id = ?1",
            )?;
            let mut keys = HashSet::new();
            for fact_id in fact_ids {
                let rows = select
                    .query_map(params![fact_id.0], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
                keys.extend(rows);
            }

            let mut update = store.conn.prepare(
                "UPDATE memory_files SET stale = 1, epoch = epoch + 1 WHERE deal_id = ?1 AND topic = ?2",
            )?;
            let mut keys: Vec<_> = keys.into_iter().collect();
            keys.sort();
            for (deal_id, topic) in &keys {
                update.execute(params![deal_id, topic])?;
            }
            Ok(keys)
        })
    }

    // ========== INVARIANTS ==========

    /// Audit the store: superseded facts have exactly one incoming SUPERSEDES
    /// edge, SUPERSEDES edges are acyclic, and every fact carries a source.
    pub fn check_invariants(&self) -> Result<Vec<InvariantFinding>> {
        let mut findings = Vec::new();

        let mut stmt = self.conn.prepare(
            "SELECT f.id, f.status, f.document_id, f.locator,
                    (SELECT COUNT(*) FROM relationships r
                     WHERE r.kind = 'SUPERSEDES' AND r.target_kind = 'fact' AND r.target_id = f.id)
             FROM facts f",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (id, status, document_id, locator, incoming) in rows {
            let superseded = status == FactStatus::Superseded.as_str();
            if superseded && incoming != 1 {
                findings.push(InvariantFinding {
                    rule: "superseded_has_one_incoming_edge",
                    subject: id.clone(),
                    detail: format!("superseded fact has {} incoming SUPERSEDES edges", incoming),
                });
            }
            if !superseded && incoming > 0 {
                findings.push(InvariantFinding {
                    rule: "superseded_status_matches_edges",
                    subject: id.clone(),
                    detail: format!("status {} but {} incoming SUPERSEDES edges", status, incoming),
                });
            }
            if document_id.trim().is_empty()
                || serde_json::from_str::<Locator>(&locator).is_err()
            {
                findings.push(InvariantFinding {
                    rule: "fact_has_source",
                    subject: id,
                    detail: "missing or malformed source".to_string(),
                });
            }
        }

        let mut edge_stmt = self.conn.prepare(
            "SELECT source_id, target_id FROM relationships
             WHERE kind = 'SUPERSEDES' AND source_kind = 'fact' AND target_kind = 'fact'",
        )?;
        let edges = edge_stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for node in find_cycle_nodes(&edges) {
            findings.push(InvariantFinding {
                rule: "supersedes_acyclic",
                subject: node,
                detail: "fact lies on a SUPERSEDES cycle".to_string(),
            });
        }

        if !findings.is_empty() {
            warn!("Invariant check found {} violations", findings.len());
        }
        Ok(findings)
    }
}

/// Nodes on a cycle of the directed graph given by `edges` (iterative DFS colouring).
fn find_cycle_nodes(edges: &[(String, String)]) -> Vec<String> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (from, to) in edges {
        adjacency.entry(from.as_str()).or_default().push(to.as_str());
    }

    let mut on_cycle = HashSet::new();
    let mut finished: HashSet<&str> = HashSet::new();

    let mut starts: Vec<&str> = adjacency.keys().copied().collect();
    starts.sort();
    for start in starts {
        if finished.contains(start) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        while let Some((node, child_index)) = stack.pop() {
            if child_index == 0 {
                path.push(node);
            }
            let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&child) = children.get(child_index) {
                stack.push((node, child_index + 1));
                if let Some(pos) = path.iter().position(|n| *n == child) {
                    on_cycle.extend(path[pos..].iter().map(|n| n.to_string()));
                } else if !finished.contains(child) {
                    stack.push((child, 0));
                }
            } else {
                path.pop();
                finished.insert(node);
            }
        }
    }

    let mut nodes: Vec<String> = on_cycle.into_iter().collect();
    nodes.sort();
    nodes
}

fn bm25_to_score(rank: f64) -> f32 {
    let raw = (-rank).max(0.0);
    (raw / (1.0 + raw)) as f32
}

fn row_to_chunk(row: &Row) -> rusqlite::Result<Chunk> {
    let locator: String = row.get(4)?;
    Ok(Chunk {
        chunk_id: ChunkId(row.get(0)?),
        deal_id: row.get(1)?,
        document_id: row.get(2)?,
        document_name: row.get(3)?,
        locator: serde_json::from_str(&locator).map_err(json_error)?,
        text: row.get(5)?,
        mime: row.get(6)?,
        supersedes_document: row.get(7)?,
        received_at: row.get(8)?,
    })
}

fn row_to_document(row: &Row) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        document_id: row.get(0)?,
        deal_id: row.get(1)?,
        name: row.get(2)?,
        first_seen_at: row.get(3)?,
    })
}

fn row_to_fact(row: &Row) -> rusqlite::Result<Fact> {
    let value: Option<String> = row.get(5)?;
    let period: Option<String> = row.get(6)?;
    let source_kind: String = row.get(9)?;
    let locator: String = row.get(11)?;
    let status: String = row.get(15)?;

    let value: Option<FactValue> = value
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(json_error)?;
    let period: Option<Period> = period
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(json_error)?;

    let kind = if source_kind == SourceKind::Conversation.as_str() {
        SourceKind::Conversation
    } else {
        SourceKind::Document
    };

    Ok(Fact {
        id: FactId(row.get(0)?),
        deal_id: row.get(1)?,
        content: row.get(2)?,
        entity_ref: row.get::<_, Option<String>>(3)?.map(EntityId),
        attribute: row.get(4)?,
        value,
        period,
        topic: row.get(7)?,
        confidence: row.get::<_, f64>(8)? as f32,
        source: Source {
            kind,
            document_id: row.get(10)?,
            locator: serde_json::from_str(&locator).map_err(json_error)?,
        },
        chunk_id: row.get::<_, Option<String>>(12)?.map(ChunkId),
        extraction_key: row.get(13)?,
        discovered_at: row.get(14)?,
        status: FactStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                15,
                Type::Text,
                format!("unknown fact status {}", status).into(),
            )
        })?,
    })
}

fn row_to_entity_base(row: &Row) -> rusqlite::Result<Entity> {
    let entity_type: String = row.get(3)?;
    Ok(Entity {
        id: EntityId(row.get(0)?),
        deal_id: row.get(1)?,
        name: row.get(2)?,
        entity_type: EntityType::from_storage(&entity_type),
        aliases: Vec::new(),
        created_at: row.get(4)?,
    })
}

fn row_to_relationship(row: &Row) -> rusqlite::Result<Relationship> {
    let kind: String = row.get(1)?;
    let kind = RelationKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown relation kind {}", kind).into(),
        )
    })?;

    let node = |kind_col: usize, id_col: usize| -> rusqlite::Result<NodeRef> {
        let node_kind: String = row.get(kind_col)?;
        NodeRef::from_parts(&node_kind, row.get(id_col)?).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                kind_col,
                Type::Text,
                format!("unknown node kind {}", node_kind).into(),
            )
        })
    };

    Ok(Relationship {
        id: RelationId(row.get(0)?),
        kind,
        source: node(2, 3)?,
        target: node(4, 5)?,
        rationale: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<ExtractionJob> {
    let status: String = row.get(3)?;
    Ok(ExtractionJob {
        chunk_id: ChunkId(row.get(0)?),
        pipeline_version: row.get(1)?,
        document_id: row.get(2)?,
        status: TierStatus::parse(&status).unwrap_or(TierStatus::Pending),
        attempts: row.get::<_, i64>(4)? as u32,
        last_error: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn json_error(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
}
