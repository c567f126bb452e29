//! SQLite-backed episodic memory with hybrid retrieval.
//!
//! # Schema
//! `chunks` holds the content rows, `chunks_fts` is an FTS5 index synced via
//! triggers, `chunks_vec` (created only when an embedding dimension is
//! configured) holds one embedding blob per chunk rowid, and `schema_meta`
//! records versioning facts.
//!
//! # Retrieval
//! Search runs a BM25 candidate query and, when an embedding is supplied, a
//! vector candidate query, then fuses the union with weighted scores, a
//! temporal half-life decay, and an MMR diversity pass.
//!
//! # Connection
//! A [`rusqlite::Connection`] wrapped in `Arc<Mutex<…>>` keeps the store
//! `Send + Sync` while honoring SQLite's single-writer requirement.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::error::{Result, RuntimeError};

use super::types::{MatchType, MemoryChunk, SearchOptions, SearchResult};

// ─── Schema ──────────────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY NOT NULL,
    agent_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    content TEXT NOT NULL,
    importance REAL NOT NULL DEFAULT 0.5,
    token_count INTEGER NOT NULL,
    source_type TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_chunks_agent_id ON chunks (agent_id);
CREATE INDEX IF NOT EXISTS idx_chunks_created_at ON chunks (created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    content,
    content='chunks',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES('delete', old.rowid, old.content);
END;
CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES('delete', old.rowid, old.content);
    INSERT INTO chunks_fts(rowid, content) VALUES (new.rowid, new.content);
END;

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

const VEC_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chunks_vec (
    rowid INTEGER PRIMARY KEY,
    embedding BLOB NOT NULL
);
"#;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Re-ranking knobs for hybrid search.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Half-life of the temporal decay, in days.
    pub half_life_days: f64,
    pub vector_weight: f64,
    pub bm25_weight: f64,
    /// MMR relevance-vs-diversity balance; 1.0 disables diversity.
    pub mmr_lambda: f64,
    /// Embedding dimension; `None` disables the vector table.
    pub embedding_dim: Option<usize>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            vector_weight: 0.6,
            bm25_weight: 0.4,
            mmr_lambda: 0.7,
            embedding_dim: None,
        }
    }
}

// ─── EpisodicMemoryStore ─────────────────────────────────────────────────────

/// Chunked episodic memory, shared between the memory-flush hook and the
/// memory tools.
pub struct EpisodicMemoryStore {
    conn: Arc<Mutex<Connection>>,
    config: MemoryStoreConfig,
}

impl EpisodicMemoryStore {
    /// Open (or create) the database at `path` and initialise the schema.
    pub fn open(path: &str, config: MemoryStoreConfig) -> Result<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(store_err)?;
        Self::init(conn, config)
    }

    /// In-memory store for tests.
    pub fn in_memory(config: MemoryStoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::init(conn, config)
    }

    fn init(conn: Connection, config: MemoryStoreConfig) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(store_err)?;
        if config.embedding_dim.is_some() {
            conn.execute_batch(VEC_SCHEMA_SQL).map_err(store_err)?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
            [],
        )
        .map_err(store_err)?;
        if let Some(dim) = config.embedding_dim {
            conn.execute(
                "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('embedding_dim', ?1)",
                params![dim.to_string()],
            )
            .map_err(store_err)?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// `true` when the vector table is enabled.
    pub fn vectors_enabled(&self) -> bool {
        self.config.embedding_dim.is_some()
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Insert or replace a chunk (and its embedding when vectors are enabled).
    pub fn upsert(&self, chunk: &MemoryChunk) -> Result<()> {
        if let (Some(dim), Some(embedding)) = (self.config.embedding_dim, &chunk.embedding) {
            if embedding.len() != dim {
                return Err(RuntimeError::MemoryStore(format!(
                    "embedding dimension mismatch: expected {dim}, got {}",
                    embedding.len()
                )));
            }
        }

        let importance = chunk.importance.clamp(0.0, 1.0);
        let metadata = serde_json::to_string(&chunk.metadata)?;

        let mut conn = self.lock();
        let tx = conn.transaction().map_err(store_err)?;

        // A REPLACE assigns a fresh rowid; drop the stale embedding row first.
        let old_rowid: Option<i64> = tx
            .query_row(
                "SELECT rowid FROM chunks WHERE id = ?1",
                params![chunk.id],
                |row| row.get(0),
            )
            .ok();
        if let Some(rowid) = old_rowid {
            if self.vectors_enabled() {
                tx.execute("DELETE FROM chunks_vec WHERE rowid = ?1", params![rowid])
                    .map_err(store_err)?;
            }
        }

        tx.execute(
            r#"
            INSERT OR REPLACE INTO chunks
                (id, agent_id, session_id, content, importance, token_count,
                 source_type, chunk_index, created_at, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                chunk.id,
                chunk.agent_id,
                chunk.session_id,
                chunk.content,
                importance,
                chunk.token_count as i64,
                chunk.source_type,
                chunk.chunk_index as i64,
                chunk.created_at.to_rfc3339(),
                metadata,
            ],
        )
        .map_err(store_err)?;

        if self.vectors_enabled() {
            if let Some(embedding) = &chunk.embedding {
                let rowid = tx.last_insert_rowid();
                tx.execute(
                    "INSERT OR REPLACE INTO chunks_vec (rowid, embedding) VALUES (?1, ?2)",
                    params![rowid, embedding_to_blob(embedding)],
                )
                .map_err(store_err)?;
            }
        }

        tx.commit().map_err(store_err)
    }

    /// Clamp `importance` to [0, 1] and apply it transactionally.
    pub fn update_importance(&self, chunk_id: &str, importance: f64) -> Result<()> {
        let clamped = importance.clamp(0.0, 1.0);
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(store_err)?;
        let updated = tx
            .execute(
                "UPDATE chunks SET importance = ?1 WHERE id = ?2",
                params![clamped, chunk_id],
            )
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        if updated == 0 {
            return Err(RuntimeError::MemoryStore(format!(
                "no chunk with id '{chunk_id}'"
            )));
        }
        Ok(())
    }

    pub fn delete(&self, agent_id: &str, chunk_id: &str) -> Result<bool> {
        let conn = self.lock();
        let removed = conn
            .execute(
                "DELETE FROM chunks WHERE id = ?1 AND agent_id = ?2",
                params![chunk_id, agent_id],
            )
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    /// Drop index rows whose backing chunk row disappeared.
    pub fn repair(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO chunks_fts(chunks_fts) VALUES('rebuild')",
            [],
        )
        .map_err(store_err)?;
        if self.vectors_enabled() {
            conn.execute(
                "DELETE FROM chunks_vec WHERE rowid NOT IN (SELECT rowid FROM chunks)",
                [],
            )
            .map_err(store_err)?;
        }
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn get(&self, agent_id: &str, chunk_id: &str) -> Result<Option<MemoryChunk>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1 AND agent_id = ?2"
            ))
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map(params![chunk_id, agent_id], row_to_chunk)
            .map_err(store_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(store_err)?)),
            None => Ok(None),
        }
    }

    pub fn count(&self, agent_id: &str) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE agent_id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(count as usize)
    }

    /// Hybrid search: BM25 + optional vector candidates, fused and re-ranked
    /// with temporal decay and MMR.
    pub fn search(&self, opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        if opts.max_results == 0 {
            return Ok(Vec::new());
        }
        let max_candidates = 4 * opts.max_results;

        let bm25 = self.bm25_candidates(opts, max_candidates)?;
        let vector = self.vector_candidates(opts, max_candidates)?;

        // Union by chunk id.
        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        let bm25_max = bm25
            .iter()
            .map(|(_, s)| *s)
            .fold(0.0_f64, f64::max)
            .max(f64::EPSILON);
        for (chunk, score) in bm25 {
            candidates
                .entry(chunk.id.clone())
                .or_insert_with(|| Candidate::new(chunk))
                .bm25 = Some(score / bm25_max);
        }
        for (chunk, similarity) in vector {
            candidates
                .entry(chunk.id.clone())
                .or_insert_with(|| Candidate::new(chunk))
                .vector = Some(similarity);
        }

        let now = Utc::now();
        let mut pool: Vec<Candidate> = candidates
            .into_values()
            .map(|mut c| {
                let fused = self.config.vector_weight * c.vector.unwrap_or(0.0)
                    + self.config.bm25_weight * c.bm25.unwrap_or(0.0);
                c.score = fused * decay_factor(&c.chunk.created_at, &now, self.config.half_life_days);
                c
            })
            .collect();
        pool.sort_by(|a, b| b.score.total_cmp(&a.score));

        Ok(self.mmr_select(pool, opts.max_results))
    }

    // ── Candidate queries ────────────────────────────────────────────────────

    fn bm25_candidates(
        &self,
        opts: &SearchOptions,
        max_candidates: usize,
    ) -> Result<Vec<(MemoryChunk, f64)>> {
        let fts_query = clean_fts_query(&opts.query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                r#"
                SELECT {CHUNK_COLUMNS_QUALIFIED}, -rank AS score
                FROM chunks_fts
                JOIN chunks c ON c.rowid = chunks_fts.rowid
                WHERE chunks_fts MATCH ?1 AND c.agent_id = ?2
                ORDER BY rank
                LIMIT ?3
                "#
            ))
            .map_err(store_err)?;

        let rows = stmt
            .query_map(
                params![fts_query, opts.agent_id, max_candidates as i64],
                |row| {
                    let chunk = row_to_chunk(row)?;
                    let score: f64 = row.get("score")?;
                    Ok((chunk, score))
                },
            )
            .map_err(store_err)?;

        let mut out = Vec::new();
        for row in rows {
            let (chunk, score) = row.map_err(store_err)?;
            if opts.filters.matches(&chunk) {
                out.push((chunk, score.max(0.0)));
            }
        }
        Ok(out)
    }

    fn vector_candidates(
        &self,
        opts: &SearchOptions,
        max_candidates: usize,
    ) -> Result<Vec<(MemoryChunk, f64)>> {
        let Some(query_embedding) = &opts.embedding else {
            return Ok(Vec::new());
        };
        if !self.vectors_enabled() {
            return Ok(Vec::new());
        }

        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                r#"
                SELECT {CHUNK_COLUMNS_QUALIFIED}, v.embedding AS embedding
                FROM chunks c
                JOIN chunks_vec v ON v.rowid = c.rowid
                WHERE c.agent_id = ?1
                "#
            ))
            .map_err(store_err)?;

        let rows = stmt
            .query_map(params![opts.agent_id], |row| {
                let mut chunk = row_to_chunk(row)?;
                let blob: Vec<u8> = row.get("embedding")?;
                chunk.embedding = Some(blob_to_embedding(&blob));
                Ok(chunk)
            })
            .map_err(store_err)?;

        let mut scored: Vec<(MemoryChunk, f64)> = Vec::new();
        for row in rows {
            let chunk = row.map_err(store_err)?;
            let Some(embedding) = &chunk.embedding else {
                continue;
            };
            let distance = l2_distance(query_embedding, embedding);
            let similarity = 1.0 / (1.0 + distance);
            scored.push((chunk, similarity));
        }

        // kNN-style match first, filters after.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(max_candidates);
        scored.retain(|(chunk, _)| opts.filters.matches(chunk));
        Ok(scored)
    }

    // ── MMR ──────────────────────────────────────────────────────────────────

    /// λ-balanced relevance-vs-diversity selection over the scored pool.
    fn mmr_select(&self, mut pool: Vec<Candidate>, max_results: usize) -> Vec<SearchResult> {
        let lambda = self.config.mmr_lambda;
        let mut selected: Vec<Candidate> = Vec::new();

        while selected.len() < max_results && !pool.is_empty() {
            let mut best_index = 0;
            let mut best_value = f64::NEG_INFINITY;
            for (index, candidate) in pool.iter().enumerate() {
                let redundancy = selected
                    .iter()
                    .map(|s| chunk_similarity(&candidate.chunk, &s.chunk))
                    .fold(0.0_f64, f64::max);
                let value = lambda * candidate.score - (1.0 - lambda) * redundancy;
                if value > best_value {
                    best_value = value;
                    best_index = index;
                }
            }
            selected.push(pool.swap_remove(best_index));
        }

        selected
            .into_iter()
            .map(|c| {
                let match_type = match (c.vector.is_some(), c.bm25.is_some()) {
                    (true, true) => MatchType::Hybrid,
                    (true, false) => MatchType::Vector,
                    _ => MatchType::Bm25,
                };
                SearchResult {
                    chunk: c.chunk,
                    score: c.score,
                    match_type,
                }
            })
            .collect()
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

const CHUNK_COLUMNS: &str = "id, agent_id, session_id, content, importance, token_count, \
                             source_type, chunk_index, created_at, metadata";
const CHUNK_COLUMNS_QUALIFIED: &str =
    "c.id, c.agent_id, c.session_id, c.content, c.importance, c.token_count, \
     c.source_type, c.chunk_index, c.created_at, c.metadata";

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryChunk> {
    let created_raw: String = row.get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let metadata_raw: String = row.get("metadata")?;
    Ok(MemoryChunk {
        id: row.get("id")?,
        agent_id: row.get("agent_id")?,
        session_id: row.get("session_id")?,
        content: row.get("content")?,
        importance: row.get("importance")?,
        token_count: row.get::<_, i64>("token_count")? as usize,
        source_type: row.get("source_type")?,
        chunk_index: row.get::<_, i64>("chunk_index")? as usize,
        created_at,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or(serde_json::Value::Null),
        embedding: None,
    })
}

fn store_err(e: rusqlite::Error) -> RuntimeError {
    RuntimeError::MemoryStore(e.to_string())
}

// ─── Scoring helpers ─────────────────────────────────────────────────────────

struct Candidate {
    chunk: MemoryChunk,
    bm25: Option<f64>,
    vector: Option<f64>,
    score: f64,
}

impl Candidate {
    fn new(chunk: MemoryChunk) -> Self {
        Self {
            chunk,
            bm25: None,
            vector: None,
            score: 0.0,
        }
    }
}

/// 0.5^(age_days / half_life).
fn decay_factor(created_at: &DateTime<Utc>, now: &DateTime<Utc>, half_life_days: f64) -> f64 {
    let age_days = (*now - *created_at).num_seconds().max(0) as f64 / 86_400.0;
    0.5_f64.powf(age_days / half_life_days.max(f64::EPSILON))
}

/// Strip FTS5 operators from a free-text query and OR-join the terms.
///
/// Deliberately approximate: quoting phrases would be stricter at a cost of
/// reduced recall.
fn clean_fts_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x - *y) as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

/// Inter-candidate similarity for MMR: cosine when both embeddings exist,
/// token Jaccard overlap otherwise.
fn chunk_similarity(a: &MemoryChunk, b: &MemoryChunk) -> f64 {
    if let (Some(ea), Some(eb)) = (&a.embedding, &b.embedding) {
        return cosine_similarity(ea, eb);
    }
    let tokens_a: std::collections::HashSet<String> = a
        .content
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let tokens_b: std::collections::HashSet<String> = b
        .content
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count() as f64;
    let union = tokens_a.union(&tokens_b).count() as f64;
    intersection / union
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryFilters;

    fn store() -> EpisodicMemoryStore {
        EpisodicMemoryStore::in_memory(MemoryStoreConfig::default()).expect("in-memory store")
    }

    fn vector_store(dim: usize) -> EpisodicMemoryStore {
        EpisodicMemoryStore::in_memory(MemoryStoreConfig {
            embedding_dim: Some(dim),
            ..Default::default()
        })
        .expect("in-memory vector store")
    }

    fn chunk(agent: &str, content: &str) -> MemoryChunk {
        MemoryChunk::new(agent, "s1", content)
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let store = store();
        let c = chunk("A", "The quick brown fox");
        store.upsert(&c).unwrap();

        let fetched = store.get("A", &c.id).unwrap().unwrap();
        assert_eq!(fetched.content, "The quick brown fox");
        assert_eq!(fetched.agent_id, "A");
    }

    #[test]
    fn reupsert_replaces_content() {
        let store = store();
        let mut c = chunk("A", "original content");
        store.upsert(&c).unwrap();
        c.content = "updated content".into();
        store.upsert(&c).unwrap();

        assert_eq!(store.count("A").unwrap(), 1);
        let fetched = store.get("A", &c.id).unwrap().unwrap();
        assert_eq!(fetched.content, "updated content");
    }

    #[test]
    fn importance_clamped_on_write_and_update() {
        let store = store();
        let mut c = chunk("A", "something worth remembering about the fox");
        c.importance = 7.5;
        store.upsert(&c).unwrap();
        assert!((store.get("A", &c.id).unwrap().unwrap().importance - 1.0).abs() < 1e-9);

        store.update_importance(&c.id, -3.0).unwrap();
        assert!(store.get("A", &c.id).unwrap().unwrap().importance.abs() < 1e-9);
    }

    #[test]
    fn update_importance_unknown_id_errors() {
        let store = store();
        let err = store.update_importance("ghost", 0.5).unwrap_err();
        assert!(matches!(err, RuntimeError::MemoryStore(_)));
    }

    #[test]
    fn hybrid_search_prefers_matching_chunks() {
        let store = store();
        for content in [
            "The quick brown fox jumps over the lazy dog",
            "TypeScript is a programming language",
            "The fox was very quick indeed",
        ] {
            store.upsert(&chunk("A", content)).unwrap();
        }

        let results = store.search(&SearchOptions::new("quick fox", "A")).unwrap();
        assert!(!results.is_empty());
        assert!(
            results[0].chunk.content.contains("fox"),
            "top result should be fox-related: {:?}",
            results[0].chunk.content
        );
        assert_eq!(results[0].match_type, MatchType::Bm25);
    }

    #[test]
    fn search_scopes_to_agent() {
        let store = store();
        store.upsert(&chunk("A", "alpha fox content")).unwrap();
        store.upsert(&chunk("B", "beta fox content")).unwrap();

        let results = store.search(&SearchOptions::new("fox", "A")).unwrap();
        assert!(results.iter().all(|r| r.chunk.agent_id == "A"));
    }

    #[test]
    fn search_respects_max_results() {
        let store = store();
        for i in 0..20 {
            store
                .upsert(&chunk("A", &format!("fox sighting number {i}")))
                .unwrap();
        }
        let mut opts = SearchOptions::new("fox", "A");
        opts.max_results = 5;
        assert_eq!(store.search(&opts).unwrap().len(), 5);
    }

    #[test]
    fn filters_apply_to_candidates() {
        let store = store();
        let mut important = chunk("A", "fox decision of great importance");
        important.importance = 0.9;
        let mut trivial = chunk("A", "fox trivia of little importance");
        trivial.importance = 0.1;
        store.upsert(&important).unwrap();
        store.upsert(&trivial).unwrap();

        let mut opts = SearchOptions::new("fox", "A");
        opts.filters = MemoryFilters {
            min_importance: Some(0.5),
            ..Default::default()
        };
        let results = store.search(&opts).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, important.id);
    }

    #[test]
    fn fts_operators_stripped_from_query() {
        let store = store();
        store.upsert(&chunk("A", "the fox ran")).unwrap();
        // Raw '"fox" AND (' would be an FTS5 syntax error if passed through.
        let results = store.search(&SearchOptions::new("\"fox\" (", "A")).unwrap();
        assert!(!results.is_empty());
    }

    #[test]
    fn vector_search_ranks_by_distance() {
        let store = vector_store(3);
        let mut near = chunk("A", "completely unrelated words here");
        near.embedding = Some(vec![1.0, 0.0, 0.0]);
        let mut far = chunk("A", "other unrelated words there");
        far.embedding = Some(vec![0.0, 1.0, 0.0]);
        store.upsert(&near).unwrap();
        store.upsert(&far).unwrap();

        let mut opts = SearchOptions::new("zzz-no-text-match", "A");
        opts.embedding = Some(vec![0.9, 0.1, 0.0]);
        let results = store.search(&opts).unwrap();
        assert_eq!(results[0].chunk.id, near.id);
        assert_eq!(results[0].match_type, MatchType::Vector);
    }

    #[test]
    fn hybrid_match_type_when_both_paths_hit() {
        let store = vector_store(2);
        let mut c = chunk("A", "the quick fox");
        c.embedding = Some(vec![1.0, 0.0]);
        store.upsert(&c).unwrap();

        let mut opts = SearchOptions::new("fox", "A");
        opts.embedding = Some(vec![1.0, 0.0]);
        let results = store.search(&opts).unwrap();
        assert_eq!(results[0].match_type, MatchType::Hybrid);
    }

    #[test]
    fn embedding_dimension_mismatch_rejected() {
        let store = vector_store(4);
        let mut c = chunk("A", "content");
        c.embedding = Some(vec![1.0, 2.0]);
        assert!(store.upsert(&c).is_err());
    }

    #[test]
    fn delete_and_repair() {
        let store = store();
        let c = chunk("A", "disposable fox fact");
        store.upsert(&c).unwrap();
        assert!(store.delete("A", &c.id).unwrap());
        assert!(!store.delete("A", &c.id).unwrap());
        store.repair().unwrap();
        assert!(store.search(&SearchOptions::new("fox", "A")).unwrap().is_empty());
    }

    #[test]
    fn open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let store =
            EpisodicMemoryStore::open(path.to_str().unwrap(), MemoryStoreConfig::default())
                .unwrap();
        store.upsert(&chunk("A", "persisted fox fact")).unwrap();
        assert_eq!(store.count("A").unwrap(), 1);
    }
}
