//! The provider collaborator contract.
//!
//! Concrete adaptors (HTTP bindings, local servers) live outside this crate;
//! the runtime only depends on this trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;

use super::types::{ChatMessage, CompletionOptions, StreamChunk, ToolSpec};

/// A lazy, finite sequence of streaming chunks with explicit terminals.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Contract every model backend must satisfy.
///
/// The chunk stream must be strictly ordered and end with at most one
/// terminal: a `Done` chunk or an `Err` item.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Stable provider identifier used in fallback ordering.
    fn name(&self) -> &str;

    /// Start a streaming completion.
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        options: &CompletionOptions,
    ) -> Result<ChunkStream>;

    /// Count the tokens the provider would charge for `messages`.
    fn count_tokens(&self, messages: &[ChatMessage]) -> usize;

    /// The provider's context window, in tokens.
    fn context_window(&self) -> usize;
}
