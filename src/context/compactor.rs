//! Token-budget compaction via summarization.
//!
//! When the conversation approaches the provider's context window, the full
//! non-system history is summarized by the model and the context is rebuilt
//! as persona + summary + the last few exchanges. The `memory_flush` hook
//! fires before the history is dropped so the memory subsystem can persist
//! it; `session_compact` fires after the rebuild.

use std::sync::Arc;

use crate::{
    error::Result,
    hooks::{HookEvent, HookPayload, HookRegistry},
    llm::{ChatMessage, ChatRole, CompletionOptions, LLMService},
};

use super::conversation::ConversationContext;

const SUMMARY_PROMPT: &str = "Summarize the conversation so far in a compact form. \
     Preserve decisions made, facts established, open tasks, and any \
     constraints the user stated. Write plain prose, no preamble.";

/// How many trailing exchanges survive a compaction. Tunable policy, not an
/// invariant.
const KEEP_EXCHANGES: usize = 3;

/// Compaction policy bound to one agent's LLM service.
pub struct ContextCompactor {
    llm: Arc<LLMService>,
    hooks: Arc<HookRegistry>,
    persona: String,
    reserve_tokens: usize,
}

impl ContextCompactor {
    pub fn new(
        llm: Arc<LLMService>,
        hooks: Arc<HookRegistry>,
        persona: impl Into<String>,
        reserve_tokens: usize,
    ) -> Self {
        Self {
            llm,
            hooks,
            persona: persona.into(),
            reserve_tokens,
        }
    }

    /// `true` when the context no longer leaves `reserve_tokens` of headroom.
    pub fn needs_compaction(&self, ctx: &ConversationContext) -> Result<bool> {
        let used = self.llm.count_tokens(ctx.messages())?;
        let window = self.llm.context_window()?;
        Ok(used >= window.saturating_sub(self.reserve_tokens))
    }

    /// Summarize and rebuild the context in place.
    pub async fn compact(&self, ctx: &mut ConversationContext) -> Result<()> {
        self.hooks
            .fire(
                HookEvent::MemoryFlush,
                HookPayload::Messages(ctx.messages().to_vec()),
            )
            .await?;

        let summary = self.summarize(ctx.non_system()).await;
        let tail = ctx.last_exchanges(KEEP_EXCHANGES);

        let mut rebuilt = Vec::with_capacity(tail.len() + 2);
        rebuilt.push(ChatMessage::system(self.persona.clone()));
        rebuilt.push(ChatMessage::assistant(format!(
            "[Conversation summary]\n{summary}"
        )));
        rebuilt.extend(tail);
        ctx.replace_messages(rebuilt);

        self.hooks
            .fire(
                HookEvent::SessionCompact,
                HookPayload::Messages(ctx.messages().to_vec()),
            )
            .await?;
        Ok(())
    }

    /// Ask the model for a summary; fall back to a count marker if it fails.
    async fn summarize(&self, history: &[ChatMessage]) -> String {
        let excerpt: String = history
            .iter()
            .filter_map(|m| match m.role {
                ChatRole::User => Some(format!("User: {}", m.content)),
                ChatRole::Assistant if !m.content.is_empty() => {
                    Some(format!("Assistant: {}", m.content))
                }
                ChatRole::Tool => Some(format!("Tool: {}", m.content)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let request = vec![ChatMessage::user(format!("{SUMMARY_PROMPT}\n\n{excerpt}"))];
        match self
            .llm
            .stream_completion(&request, &[], &CompletionOptions::default())
            .await
        {
            Ok(response) => response.text,
            Err(e) => {
                log::warn!("compaction summary failed, using fallback: {e}");
                format!("[{} messages compacted]", history.len())
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{StreamChunk, testing::ScriptedProvider};

    fn llm_with(turns: Vec<Vec<StreamChunk>>, window: usize) -> Arc<LLMService> {
        let provider = ScriptedProvider::new("mock", turns).with_context_window(window);
        let svc = LLMService::new(vec![provider.into_arc()], vec![]);
        svc.bind_session("s1").expect("bind");
        Arc::new(svc)
    }

    fn busy_context() -> ConversationContext {
        let mut ctx = ConversationContext::new("persona");
        for i in 0..6 {
            ctx.append_user(format!("question number {i} with some padding text"));
            ctx.append_assistant(format!("answer number {i} with some padding text"), vec![]);
        }
        ctx
    }

    #[tokio::test]
    async fn needs_compaction_respects_reserve() {
        let llm = llm_with(vec![], 100);
        let compactor = ContextCompactor::new(llm, Arc::new(HookRegistry::new()), "persona", 90);
        let ctx = busy_context();
        // window 100 - reserve 90 = 10 tokens; the history is far larger.
        assert!(compactor.needs_compaction(&ctx).unwrap());
    }

    #[tokio::test]
    async fn no_compaction_with_headroom() {
        let llm = llm_with(vec![], 1_000_000);
        let compactor = ContextCompactor::new(llm, Arc::new(HookRegistry::new()), "persona", 100);
        let ctx = busy_context();
        assert!(!compactor.needs_compaction(&ctx).unwrap());
    }

    #[tokio::test]
    async fn compact_rebuilds_with_summary_and_tail() {
        let llm = llm_with(vec![ScriptedProvider::text_turn("the summary")], 100);
        let hooks = Arc::new(HookRegistry::new());
        let compactor = ContextCompactor::new(llm, hooks, "persona", 10);

        let mut ctx = busy_context();
        compactor.compact(&mut ctx).await.unwrap();

        let messages = ctx.messages();
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[0].content, "persona");
        assert!(messages[1].content.starts_with("[Conversation summary]\n"));
        assert!(messages[1].content.contains("the summary"));
        // Last 3 exchanges = 6 messages.
        assert_eq!(messages.len(), 2 + 6);
    }

    #[tokio::test]
    async fn compact_fires_flush_and_compact_hooks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let llm = llm_with(vec![ScriptedProvider::text_turn("s")], 100);
        let hooks = Arc::new(HookRegistry::new());
        let flushed = Arc::new(AtomicUsize::new(0));
        let compacted = Arc::new(AtomicUsize::new(0));

        let counter = flushed.clone();
        hooks.register(HookEvent::MemoryFlush, 0, move |p| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(p) }
        });
        let counter = compacted.clone();
        hooks.register(HookEvent::SessionCompact, 0, move |p| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(p) }
        });

        let compactor = ContextCompactor::new(llm, hooks, "persona", 10);
        let mut ctx = busy_context();
        compactor.compact(&mut ctx).await.unwrap();

        assert_eq!(flushed.load(Ordering::SeqCst), 1);
        assert_eq!(compacted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn summary_failure_uses_fallback_marker() {
        // No scripted turns: the summary call fails.
        let llm = llm_with(vec![], 100);
        let compactor =
            ContextCompactor::new(llm, Arc::new(HookRegistry::new()), "persona", 10);
        let mut ctx = busy_context();
        compactor.compact(&mut ctx).await.unwrap();
        assert!(ctx.messages()[1].content.contains("messages compacted"));
    }
}
