//! In-memory message list plus completion options for one agent session.
//!
//! The first message is always the system prompt; every mutation preserves
//! that invariant.

use crate::llm::{ChatMessage, ChatRole, CompletionOptions, ToolCall};

/// Ordered conversation history owned by one `AgentManager`.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    messages: Vec<ChatMessage>,
    options: CompletionOptions,
}

impl ConversationContext {
    /// Create a context seeded with the system prompt.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt)],
            options: CompletionOptions::default(),
        }
    }

    pub fn append_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn append_assistant(&mut self, content: impl Into<String>, tool_calls: Vec<ToolCall>) {
        self.messages
            .push(ChatMessage::assistant_with_tools(content, tool_calls));
    }

    pub fn append_tool(&mut self, tool_call_id: impl Into<String>, content: impl Into<String>) {
        self.messages.push(ChatMessage::tool(tool_call_id, content));
    }

    /// Replace the entire message list.
    ///
    /// The caller is responsible for keeping a system message at index 0;
    /// a list that starts differently is rejected.
    pub fn replace_messages(&mut self, messages: Vec<ChatMessage>) {
        debug_assert!(
            messages
                .first()
                .is_some_and(|m| m.role == ChatRole::System),
            "context must start with a system message"
        );
        self.messages = messages;
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// All messages except the system prompt.
    pub fn non_system(&self) -> &[ChatMessage] {
        &self.messages[1..]
    }

    /// The system prompt content.
    pub fn system_content(&self) -> &str {
        &self.messages[0].content
    }

    pub fn set_system_content(&mut self, content: impl Into<String>) {
        self.messages[0].content = content.into();
    }

    pub fn options(&self) -> &CompletionOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: CompletionOptions) {
        self.options = options;
    }

    /// Up to `n` trailing user→assistant(+tool) groupings, chronological.
    ///
    /// Walks backwards from the end collecting trailing tool/assistant
    /// messages until a user message is hit (inclusive), then repeats.
    pub fn last_exchanges(&self, n: usize) -> Vec<ChatMessage> {
        let mut collected: Vec<ChatMessage> = Vec::new();
        let mut exchanges = 0;
        let mut index = self.messages.len();

        while index > 1 && exchanges < n {
            index -= 1;
            let message = &self.messages[index];
            collected.push(message.clone());
            if message.role == ChatRole::User {
                exchanges += 1;
            }
        }

        collected.reverse();
        collected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> ConversationContext {
        let mut ctx = ConversationContext::new("sys");
        ctx.append_user("q1");
        ctx.append_assistant("a1", vec![]);
        ctx.append_user("q2");
        ctx.append_assistant(
            "a2",
            vec![ToolCall {
                id: "tc1".into(),
                name: "search".into(),
                arguments: "{}".into(),
            }],
        );
        ctx.append_tool("tc1", "results");
        ctx.append_assistant("a2-final", vec![]);
        ctx
    }

    #[test]
    fn first_message_is_system() {
        let ctx = ConversationContext::new("persona");
        assert_eq!(ctx.messages()[0].role, ChatRole::System);
        assert_eq!(ctx.system_content(), "persona");
    }

    #[test]
    fn non_system_excludes_prompt() {
        let ctx = filled();
        assert_eq!(ctx.non_system().len(), ctx.messages().len() - 1);
        assert!(ctx.non_system().iter().all(|m| m.role != ChatRole::System));
    }

    #[test]
    fn last_exchanges_groups_trailing_tools() {
        let ctx = filled();
        let last = ctx.last_exchanges(1);
        // q2, a2(+tc1), tool(tc1), a2-final
        assert_eq!(last.len(), 4);
        assert_eq!(last[0].role, ChatRole::User);
        assert_eq!(last[0].content, "q2");
        assert_eq!(last[3].content, "a2-final");
    }

    #[test]
    fn last_exchanges_two_groups_chronological() {
        let ctx = filled();
        let last = ctx.last_exchanges(2);
        assert_eq!(last.len(), 6);
        assert_eq!(last[0].content, "q1");
        assert_eq!(last[1].content, "a1");
        assert_eq!(last[2].content, "q2");
    }

    #[test]
    fn last_exchanges_more_than_available() {
        let ctx = filled();
        let last = ctx.last_exchanges(10);
        assert_eq!(last.len(), ctx.messages().len() - 1);
    }

    #[test]
    fn last_exchanges_zero_is_empty() {
        assert!(filled().last_exchanges(0).is_empty());
    }
}
