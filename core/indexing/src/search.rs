use deal_memory_ingestion::text;
use deal_memory_ingestion::{cosine_similarity, Embedder, HashingEmbedder, Result};
use deal_memory_schemas::{Chunk, ChunkId, Locator, QueryFilters};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub type SharedFastPath = Arc<Mutex<FastPathIndex>>;

const KEYWORD_WEIGHT: f32 = 0.6;
const SEMANTIC_WEIGHT: f32 = 0.4;
const MIN_SEMANTIC: f32 = 0.15;

/// Tier 1 index: FTS5 keywords plus hashed embeddings over raw chunks.
///
/// No extraction happens here. Hits are raw text and are reported as
/// unverified by the retrieval engine.
pub struct FastPathIndex {
    conn: Connection,
    embedder: Arc<dyn Embedder>,
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub keyword: f32,
    pub semantic: f32,
}

impl FastPathIndex {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let index = Self {
            conn,
            embedder: Arc::new(HashingEmbedder::default()),
        };
        index.init_schema()?;
        info!("Fast-path index initialized");
        Ok(index)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn into_shared(self) -> SharedFastPath {
        Arc::new(Mutex::new(self))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                document_name TEXT,
                locator TEXT NOT NULL,
                text TEXT NOT NULL,
                mime TEXT,
                received_at TEXT NOT NULL,
                vector TEXT NOT NULL
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                text,
                content='chunks',
                content_rowid='rowid'
            );

            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
            END;

            CREATE INDEX IF NOT EXISTS idx_chunks_deal ON chunks(deal_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);",
        )?;
        Ok(())
    }

    /// Index a chunk. Returns false when it was already indexed.
    pub fn ingest(&self, chunk: &Chunk) -> Result<bool> {
        let locator = serde_json::to_string(&chunk.locator)?;
        let vector = serde_json::to_string(&self.embedder.embed(&chunk.text))?;

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO chunks (chunk_id, deal_id, document_id, document_name,
                                           locator, text, mime, received_at, vector)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                chunk.chunk_id.0,
                chunk.deal_id,
                chunk.document_id,
                chunk.document_name,
                locator,
                chunk.text,
                chunk.mime,
                chunk.received_at,
                vector,
            ],
        )?;

        if inserted > 0 {
            debug!("Indexed chunk {} ({} chars)", chunk.chunk_id, chunk.text.len());
        }
        Ok(inserted > 0)
    }

    pub fn is_indexed(&self, chunk_id: &ChunkId) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM chunks WHERE chunk_id = ?1",
                params![chunk_id.0],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Rank chunks by keyword and embedding similarity.
    ///
    /// Only the deal, document and entity filters apply to raw chunks; the
    /// entity filter is a case-insensitive text match.
    pub fn query(&self, query: &str, filters: &QueryFilters, limit: usize) -> Result<Vec<ScoredChunk>> {
        debug!("Fast-path search for: {} (limit: {})", query, limit);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let deal_id = filters.deal_id.as_deref();
        let document_id = filters.document_id.as_deref();
        let mut keyword: HashMap<String, f32> = HashMap::new();

        if let Some(expression) = text::fts_match_expression(query) {
            let mut stmt = self.conn.prepare(
                "SELECT c.chunk_id, bm25(chunks_fts) AS rank
                 FROM chunks c
                 JOIN chunks_fts ON c.rowid = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1
                   AND (?2 IS NULL OR c.deal_id = ?2)
                   AND (?3 IS NULL OR c.document_id = ?3)
                 ORDER BY rank
                 LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![expression, deal_id, document_id, (limit * 3) as i64],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (chunk_id, rank) in rows {
                let raw = (-rank).max(0.0);
                keyword.insert(chunk_id, (raw / (1.0 + raw)) as f32);
            }
        }

        let query_vector = self.embedder.embed(query);
        let mut stmt = self.conn.prepare(
            "SELECT chunk_id, deal_id, document_id, document_name, locator, text, mime,
                    received_at, vector
             FROM chunks
             WHERE (?1 IS NULL OR deal_id = ?1) AND (?2 IS NULL OR document_id = ?2)",
        )?;
        let rows = stmt
            .query_map(params![deal_id, document_id], row_to_chunk_with_vector)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let entity = filters.entity.as_ref().map(|e| e.to_lowercase());
        let mut results: Vec<ScoredChunk> = rows
            .into_iter()
            .filter(|(chunk, _)| match &entity {
                Some(entity) => chunk.text.to_lowercase().contains(entity.as_str()),
                None => true,
            })
            .filter_map(|(chunk, vector)| {
                let keyword_score = keyword.get(&chunk.chunk_id.0).copied().unwrap_or(0.0);
                let semantic = cosine_similarity(&query_vector, &vector).max(0.0);
                if keyword_score == 0.0 && semantic < MIN_SEMANTIC {
                    return None;
                }
                Some(ScoredChunk {
                    score: KEYWORD_WEIGHT * keyword_score + SEMANTIC_WEIGHT * semantic,
                    keyword: keyword_score,
                    semantic,
                    chunk,
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        debug!("Fast path found {} chunks", results.len());
        Ok(results)
    }
}

fn row_to_chunk_with_vector(row: &Row) -> rusqlite::Result<(Chunk, Vec<f32>)> {
    let locator: String = row.get(4)?;
    let locator: Locator = serde_json::from_str(&locator)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let vector: String = row.get(8)?;
    let vector: Vec<f32> = serde_json::from_str(&vector)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;

    let chunk = Chunk {
        chunk_id: ChunkId(row.get(0)?),
        deal_id: row.get(1)?,
        document_id: row.get(2)?,
        document_name: row.get(3)?,
        locator,
        text: row.get(5)?,
        mime: row.get(6)?,
        supersedes_document: None,
        received_at: row.get(7)?,
    };
    Ok((chunk, vector))
}
