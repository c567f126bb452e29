pub mod provider;
pub mod service;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use provider::{ChunkStream, LLMProvider};
pub use service::LLMService;
pub use types::{
    ChatMessage, ChatRole, CompletionOptions, CompletionResponse, StreamChunk, TokenUsage,
    ToolCall, ToolSpec,
};
