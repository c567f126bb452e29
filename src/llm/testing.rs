//! Scripted provider shared by unit tests across the crate.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::stream;

use crate::error::{Result, RuntimeError};

use super::{
    provider::{ChunkStream, LLMProvider},
    types::{ChatMessage, CompletionOptions, StreamChunk, ToolSpec},
};

/// Provider that replays a fixed script of chunk sequences, one per call.
///
/// A call past the end of the script returns an error, which makes the
/// scripted provider double as an "always failing" provider when constructed
/// with no turns.
pub struct ScriptedProvider {
    name: &'static str,
    turns: Mutex<VecDeque<Vec<StreamChunk>>>,
    context_window: usize,
}

impl ScriptedProvider {
    pub fn new(name: &'static str, turns: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            name,
            turns: Mutex::new(turns.into()),
            context_window: 128_000,
        }
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }

    /// Convenience: a single text turn ending with `stop`.
    pub fn text_turn(text: &str) -> Vec<StreamChunk> {
        vec![
            StreamChunk::TextDelta { text: text.into() },
            StreamChunk::Done {
                finish_reason: "stop".into(),
            },
        ]
    }

    /// Convenience: a single tool-call turn.
    pub fn tool_turn(id: &str, name: &str, arguments: &str) -> Vec<StreamChunk> {
        vec![
            StreamChunk::ToolCallDelta {
                id: id.into(),
                name: Some(name.into()),
                arguments: arguments.into(),
            },
            StreamChunk::Done {
                finish_reason: "tool_calls".into(),
            },
        ]
    }

    pub fn into_arc(self) -> Arc<dyn LLMProvider> {
        Arc::new(self)
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn stream_completion(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
        _options: &CompletionOptions,
    ) -> Result<ChunkStream> {
        let next = {
            let mut turns = match self.turns.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            turns.pop_front()
        };
        match next {
            Some(chunks) => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok)))),
            None => Err(RuntimeError::ProviderUnavailable(format!(
                "provider '{}' script exhausted",
                self.name
            ))),
        }
    }

    fn count_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| m.content.len().div_ceil(4))
            .sum()
    }

    fn context_window(&self) -> usize {
        self.context_window
    }
}
