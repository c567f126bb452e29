//! `LLMService` — provider binding, fallback rotation, and streaming
//! accumulation.
//!
//! The service owns an ordered provider list. [`LLMService::bind_session`]
//! activates the first provider for a session; completion calls without an
//! active binding fail with [`RuntimeError::ProviderUnavailable`]. When the
//! active provider errors, the configured fallbacks are tried in order
//! (excluding the active one) and the first success wins.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::StreamExt;

use crate::error::{Result, RuntimeError};

use super::{
    provider::{ChunkStream, LLMProvider},
    types::{
        ChatMessage, CompletionOptions, CompletionResponse, StreamChunk, TokenUsage, ToolCall,
        ToolSpec,
    },
};

// ─── LLMService ──────────────────────────────────────────────────────────────

struct ServiceState {
    /// (session id, index into `providers`) of the active binding.
    active: Option<(String, usize)>,
    /// Accumulated usage per session, folded from every `Usage` chunk.
    session_usage: HashMap<String, TokenUsage>,
}

/// Provider front-end shared by one agent.
pub struct LLMService {
    providers: Vec<Arc<dyn LLMProvider>>,
    /// Fallback rotation, by provider name, in configured order.
    fallbacks: Vec<String>,
    state: Mutex<ServiceState>,
}

impl LLMService {
    pub fn new(providers: Vec<Arc<dyn LLMProvider>>, fallbacks: Vec<String>) -> Self {
        Self {
            providers,
            fallbacks,
            state: Mutex::new(ServiceState {
                active: None,
                session_usage: HashMap::new(),
            }),
        }
    }

    /// Bind the first configured provider to `session_id`.
    pub fn bind_session(&self, session_id: &str) -> Result<()> {
        if self.providers.is_empty() {
            return Err(RuntimeError::ProviderUnavailable(
                "no providers configured".into(),
            ));
        }
        let mut state = self.lock();
        state.active = Some((session_id.to_string(), 0));
        Ok(())
    }

    /// Drop the active binding. Safe to call when none is active.
    pub fn unbind_session(&self) {
        self.lock().active = None;
    }

    /// Usage accumulated for `session_id` across all calls.
    pub fn session_usage(&self, session_id: &str) -> TokenUsage {
        self.lock()
            .session_usage
            .get(session_id)
            .copied()
            .unwrap_or_default()
    }

    /// The active provider's context window.
    pub fn context_window(&self) -> Result<usize> {
        Ok(self.active_provider()?.1.context_window())
    }

    /// The first configured provider's context window, usable before any
    /// session is bound (e.g. when sizing the pruner at init).
    pub fn default_context_window(&self) -> usize {
        self.providers.first().map_or(0, |p| p.context_window())
    }

    /// Delegate token counting to the active provider.
    pub fn count_tokens(&self, messages: &[ChatMessage]) -> Result<usize> {
        Ok(self.active_provider()?.1.count_tokens(messages))
    }

    /// Raw streaming API: provider chunks pass through unchanged.
    ///
    /// On failure of the active provider, the fallback rotation is applied.
    pub async fn stream_raw(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        options: &CompletionOptions,
    ) -> Result<ChunkStream> {
        let (_, provider) = self.active_provider()?;
        match provider.stream_completion(messages, tools, options).await {
            Ok(stream) => Ok(stream),
            Err(primary_err) => {
                self.try_fallbacks(provider.name(), messages, tools, options, primary_err)
                    .await
            }
        }
    }

    /// Stream a completion and accumulate it into one response value.
    pub async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        options: &CompletionOptions,
    ) -> Result<CompletionResponse> {
        let session_id = self.active_provider()?.0;
        let mut stream = self.stream_raw(messages, tools, options).await?;
        let mut acc = Accumulator::default();

        while let Some(chunk) = stream.next().await {
            acc.push(chunk?);
        }

        if let Some(usage) = acc.usage {
            self.lock()
                .session_usage
                .entry(session_id)
                .or_default()
                .fold(&usage);
        }
        Ok(acc.into_response())
    }

    // ── Internal ─────────────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn active_provider(&self) -> Result<(String, Arc<dyn LLMProvider>)> {
        let state = self.lock();
        let (session, index) = state.active.clone().ok_or_else(|| {
            RuntimeError::ProviderUnavailable("no active session binding".into())
        })?;
        let provider = self.providers.get(index).cloned().ok_or_else(|| {
            RuntimeError::ProviderUnavailable(format!("provider index {index} out of range"))
        })?;
        Ok((session, provider))
    }

    /// Iterate configured fallbacks (excluding `active_name`) and return the
    /// first successful stream.
    async fn try_fallbacks(
        &self,
        active_name: &str,
        messages: &[ChatMessage],
        tools: &[ToolSpec],
        options: &CompletionOptions,
        mut last_err: RuntimeError,
    ) -> Result<ChunkStream> {
        for name in &self.fallbacks {
            if name == active_name {
                continue;
            }
            let Some(provider) = self.providers.iter().find(|p| p.name() == name) else {
                continue;
            };
            log::warn!("llm: provider '{active_name}' failed, trying fallback '{name}'");
            match provider.stream_completion(messages, tools, options).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

// ─── Accumulator ─────────────────────────────────────────────────────────────

/// Folds a chunk sequence into one [`CompletionResponse`].
#[derive(Default)]
struct Accumulator {
    text: String,
    call_order: Vec<String>,
    calls: HashMap<String, (Option<String>, String)>,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
}

impl Accumulator {
    fn push(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::TextDelta { text } => self.text.push_str(&text),
            StreamChunk::ToolCallDelta {
                id,
                name,
                arguments,
            } => {
                let entry = self.calls.entry(id.clone()).or_insert_with(|| {
                    self.call_order.push(id);
                    (None, String::new())
                });
                if entry.0.is_none() {
                    entry.0 = name;
                }
                entry.1.push_str(&arguments);
            }
            StreamChunk::Usage(usage) => {
                self.usage.get_or_insert_with(TokenUsage::default).fold(&usage);
            }
            StreamChunk::Done { finish_reason } => self.finish_reason = Some(finish_reason),
        }
    }

    fn into_response(mut self) -> CompletionResponse {
        let tool_calls: Vec<ToolCall> = self
            .call_order
            .iter()
            .filter_map(|id| {
                let (name, arguments) = self.calls.remove(id)?;
                Some(ToolCall {
                    id: id.clone(),
                    name: name.unwrap_or_default(),
                    arguments,
                })
            })
            .collect();
        CompletionResponse {
            text: self.text,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedProvider;

    fn service_with(scripts: Vec<(&'static str, Vec<Vec<StreamChunk>>)>) -> LLMService {
        let fallbacks: Vec<String> = scripts.iter().map(|(n, _)| n.to_string()).collect();
        let providers: Vec<Arc<dyn LLMProvider>> = scripts
            .into_iter()
            .map(|(name, turns)| Arc::new(ScriptedProvider::new(name, turns)) as Arc<dyn LLMProvider>)
            .collect();
        LLMService::new(providers, fallbacks)
    }

    #[tokio::test]
    async fn completion_without_binding_fails() {
        let svc = service_with(vec![("p1", vec![])]);
        let err = svc
            .stream_completion(&[], &[], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn bind_with_no_providers_fails() {
        let svc = LLMService::new(vec![], vec![]);
        assert!(svc.bind_session("s1").is_err());
    }

    #[tokio::test]
    async fn text_deltas_accumulate() {
        let svc = service_with(vec![(
            "p1",
            vec![vec![
                StreamChunk::TextDelta { text: "Hel".into() },
                StreamChunk::TextDelta { text: "lo!".into() },
                StreamChunk::Done {
                    finish_reason: "stop".into(),
                },
            ]],
        )]);
        svc.bind_session("s1").unwrap();
        let resp = svc
            .stream_completion(&[], &[], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.text, "Hello!");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert!(resp.tool_calls.is_none());
    }

    #[tokio::test]
    async fn tool_call_deltas_merge_by_id() {
        let svc = service_with(vec![(
            "p1",
            vec![vec![
                StreamChunk::ToolCallDelta {
                    id: "tc1".into(),
                    name: Some("search".into()),
                    arguments: "{\"q\":".into(),
                },
                StreamChunk::ToolCallDelta {
                    id: "tc1".into(),
                    name: None,
                    arguments: "\"rust\"}".into(),
                },
                StreamChunk::Done {
                    finish_reason: "tool_calls".into(),
                },
            ]],
        )]);
        svc.bind_session("s1").unwrap();
        let resp = svc
            .stream_completion(&[], &[], &CompletionOptions::default())
            .await
            .unwrap();
        let calls = resp.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments, "{\"q\":\"rust\"}");
    }

    #[tokio::test]
    async fn usage_folds_into_session_accumulator() {
        let usage = TokenUsage {
            input_tokens: 7,
            output_tokens: 3,
            total_tokens: 10,
        };
        let svc = service_with(vec![(
            "p1",
            vec![
                vec![
                    StreamChunk::Usage(usage),
                    StreamChunk::Done {
                        finish_reason: "stop".into(),
                    },
                ],
                vec![
                    StreamChunk::Usage(usage),
                    StreamChunk::Done {
                        finish_reason: "stop".into(),
                    },
                ],
            ],
        )]);
        svc.bind_session("s1").unwrap();
        for _ in 0..2 {
            svc.stream_completion(&[], &[], &CompletionOptions::default())
                .await
                .unwrap();
        }
        let total = svc.session_usage("s1");
        assert_eq!(total.input_tokens, 14);
        assert_eq!(total.total_tokens, 20);
    }

    #[tokio::test]
    async fn fallback_rotation_skips_active_provider() {
        let svc = service_with(vec![
            ("broken", vec![]), // no scripted turns -> always errors
            (
                "backup",
                vec![vec![
                    StreamChunk::TextDelta {
                        text: "from backup".into(),
                    },
                    StreamChunk::Done {
                        finish_reason: "stop".into(),
                    },
                ]],
            ),
        ]);
        svc.bind_session("s1").unwrap();
        let resp = svc
            .stream_completion(&[], &[], &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.text, "from backup");
    }
}
