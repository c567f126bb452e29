//! Agent-callable tools backed by the episodic memory store.
//!
//! These expose the store to the reasoning loop so the model can persist and
//! retrieve facts during a session. Store failures come back as structured
//! error payloads and never abort the loop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::memory::{
    EpisodicMemoryStore, MemoryChunk, MemoryFilters, SearchOptions,
    chunker::estimate_tokens, score_importance,
};

use super::traits::{Tool, required_str};

// ─── MemoryAppendTool ────────────────────────────────────────────────────────

/// Agent tool: persist a fact as an episodic chunk.
pub struct MemoryAppendTool {
    store: Arc<EpisodicMemoryStore>,
    agent_id: String,
}

impl MemoryAppendTool {
    pub fn new(store: Arc<EpisodicMemoryStore>, agent_id: impl Into<String>) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl Tool for MemoryAppendTool {
    fn name(&self) -> &str {
        "memory_append"
    }

    fn description(&self) -> &str {
        "Store a fact in persistent memory so it survives context compaction. \
         Use for decisions, preferences, and durable facts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["content"],
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Text to remember."
                },
                "session_id": {
                    "type": "string",
                    "description": "Session to attribute the memory to."
                },
                "importance": {
                    "type": "number",
                    "description": "Relevance prior in [0,1]; scored heuristically when omitted."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Value {
        let content = match required_str(&args, "content") {
            Ok(c) => c.to_string(),
            Err(e) => return e,
        };
        let session_id = args
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut chunk = MemoryChunk::new(self.agent_id.clone(), session_id, &content);
        chunk.importance = args
            .get("importance")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| score_importance(&content));
        chunk.token_count = estimate_tokens(&content);
        chunk.source_type = "tool".to_string();

        match self.store.upsert(&chunk) {
            Ok(()) => json!({ "stored": true, "chunk_id": chunk.id }),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }
}

// ─── MemorySearchTool ────────────────────────────────────────────────────────

/// Agent tool: hybrid search over episodic memory.
pub struct MemorySearchTool {
    store: Arc<EpisodicMemoryStore>,
    agent_id: String,
}

impl MemorySearchTool {
    pub fn new(store: Arc<EpisodicMemoryStore>, agent_id: impl Into<String>) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search persistent memory for relevant facts from earlier sessions."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Free-text search query."
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum hits to return (default 8)."
                },
                "session_id": {
                    "type": "string",
                    "description": "Restrict results to one session."
                },
                "min_importance": {
                    "type": "number",
                    "description": "Drop chunks below this importance."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Value {
        let query = match required_str(&args, "query") {
            Ok(q) => q.to_string(),
            Err(e) => return e,
        };

        let mut opts = SearchOptions::new(query, self.agent_id.clone());
        if let Some(n) = args.get("max_results").and_then(Value::as_u64) {
            opts.max_results = n as usize;
        }
        opts.filters = MemoryFilters {
            session_id: args
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            min_importance: args.get("min_importance").and_then(Value::as_f64),
            ..Default::default()
        };

        match self.store.search(&opts) {
            Ok(results) => {
                let hits: Vec<Value> = results
                    .iter()
                    .map(|r| {
                        json!({
                            "chunk_id": r.chunk.id,
                            "content": r.chunk.content,
                            "score": r.score,
                            "match_type": r.match_type,
                            "session_id": r.chunk.session_id,
                            "created_at": r.chunk.created_at.to_rfc3339(),
                        })
                    })
                    .collect();
                json!({ "results": hits })
            }
            Err(e) => json!({ "error": e.to_string() }),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
