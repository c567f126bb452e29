//! Events yielded by a dispatch stream.

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::llm::ToolCall;

/// The accumulated assistant turn carried by an `assistant_message` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantContent {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// One event in a dispatch stream.
///
/// A stream is strictly ordered and ends either after a terminal
/// `assistant_message` without tool calls, a `max_turns_reached`, or a
/// single `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AssistantMessage {
        content: AssistantContent,
    },
    ToolResult {
        name: String,
        tool_call_id: String,
        result: String,
    },
    ToolBlocked {
        name: String,
        reason: String,
    },
    MaxTurnsReached {
        turns: usize,
    },
    Error {
        error: String,
    },
}

impl AgentEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, AgentEvent::Error { .. })
    }
}

/// A lazy, finite dispatch event sequence.
pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;
