//! The memory-flush hook: persists conversation history into the episodic
//! store before compaction drops it.

use std::sync::{Arc, RwLock};

use crate::{
    hooks::{HookEvent, HookHandle, HookPayload, HookRegistry},
    llm::ChatRole,
};

use super::{
    chunker::{ChunkerConfig, chunk_text, estimate_tokens},
    importance::score_importance,
    store::EpisodicMemoryStore,
    types::MemoryChunk,
};

/// Register a `memory_flush` handler that chunks the flushed history and
/// upserts it for `agent_id`.
///
/// `current_session` is read at flush time so chunks land in whatever
/// session the dispatch is serving.
pub fn register_memory_flush(
    hooks: &HookRegistry,
    store: Arc<EpisodicMemoryStore>,
    chunker: ChunkerConfig,
    agent_id: String,
    current_session: Arc<RwLock<Option<String>>>,
) -> HookHandle {
    hooks.register(HookEvent::MemoryFlush, 100, move |payload| {
        let store = store.clone();
        let chunker = chunker.clone();
        let agent_id = agent_id.clone();
        let current_session = current_session.clone();
        async move {
            let HookPayload::Messages(messages) = &payload else {
                return Ok(payload);
            };

            let transcript: String = messages
                .iter()
                .filter(|m| m.role != ChatRole::System && !m.content.is_empty())
                .map(|m| {
                    let role = match m.role {
                        ChatRole::User => "User",
                        ChatRole::Assistant => "Assistant",
                        ChatRole::Tool => "Tool",
                        ChatRole::System => "System",
                    };
                    format!("{role}: {}", m.content)
                })
                .collect::<Vec<_>>()
                .join("\n");

            let session_id = current_session
                .read()
                .ok()
                .and_then(|s| s.clone())
                .unwrap_or_default();

            for (index, content) in chunk_text(&transcript, &chunker).into_iter().enumerate() {
                let mut chunk = MemoryChunk::new(agent_id.clone(), session_id.clone(), &content);
                chunk.importance = score_importance(&content);
                chunk.token_count = estimate_tokens(&content);
                chunk.chunk_index = index;
                chunk.source_type = "conversation".to_string();
                if let Err(e) = store.upsert(&chunk) {
                    // Memory failures never affect the reasoning loop.
                    log::warn!("memory flush upsert failed: {e}");
                }
            }
            Ok(payload)
        }
    })
}
