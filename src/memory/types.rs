//! Core types for the episodic memory subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── MemoryChunk ─────────────────────────────────────────────────────────────

/// One stored unit of episodic memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryChunk {
    pub id: String,
    pub agent_id: String,
    pub session_id: String,
    pub content: String,
    /// Relevance prior in [0, 1]; clamped on every write.
    pub importance: f64,
    pub token_count: usize,
    /// Provenance tag, e.g. `"conversation"`, `"document"`, `"compaction"`.
    pub source_type: String,
    /// Position of this chunk within its source document.
    pub chunk_index: usize,
    pub created_at: DateTime<Utc>,
    /// Free-form metadata map.
    #[serde(default)]
    pub metadata: Value,
    /// Optional embedding vector, stored when the vector table is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryChunk {
    pub fn new(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            token_count: content.len().div_ceil(4),
            content,
            importance: 0.5,
            source_type: "conversation".to_string(),
            chunk_index: 0,
            created_at: Utc::now(),
            metadata: Value::Object(Default::default()),
            embedding: None,
        }
    }
}

// ─── Search ──────────────────────────────────────────────────────────────────

/// Candidate filters applied to both retrieval paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilters {
    pub min_importance: Option<f64>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub source_types: Option<Vec<String>>,
}

impl MemoryFilters {
    pub fn matches(&self, chunk: &MemoryChunk) -> bool {
        if let Some(min) = self.min_importance {
            if chunk.importance < min {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if chunk.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if chunk.created_at > to {
                return false;
            }
        }
        if let Some(session) = &self.session_id {
            if &chunk.session_id != session {
                return false;
            }
        }
        if let Some(sources) = &self.source_types {
            if !sources.contains(&chunk.source_type) {
                return false;
            }
        }
        true
    }
}

/// One hybrid search request.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub query: String,
    pub agent_id: String,
    pub embedding: Option<Vec<f32>>,
    pub filters: MemoryFilters,
    pub max_results: usize,
}

impl SearchOptions {
    pub fn new(query: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            agent_id: agent_id.into(),
            embedding: None,
            filters: MemoryFilters::default(),
            max_results: 8,
        }
    }
}

/// Which retrieval path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Vector,
    Bm25,
    Hybrid,
}

/// A re-ranked search hit.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: MemoryChunk,
    pub score: f64,
    pub match_type: MatchType,
}
