//! The tool-using turn loop.
//!
//! # Algorithm
//!
//! ```text
//! fire before_agent_start
//!       │
//!       ▼
//! turn: fire turn_start → assemble context (context_assemble chain)
//!       │
//!       ▼
//! stream LLM completion → yield assistant_message → append to context
//!       │
//!       ├── no tool calls → fire turn_end + agent_end → done
//!       ▼
//! for each tool call, in model order:
//!   fire tool_call   → blocked? → yield tool_blocked, synthesize result
//!   fire tool_execution_start → execute handler → fire tool_execution_end
//!   truncate result → yield tool_result → append to context
//!       │
//!       ▼
//! fire turn_end; next turn (bounded by max_turns)
//! ```
//!
//! Any unhandled failure yields a single `error` event and ends the stream.

use std::sync::{Arc, Mutex};

use async_stream::stream;
use futures::Stream;
use serde_json::Value;

use crate::{
    error::RuntimeError,
    hooks::{AssembledContext, HookEvent, HookPayload, HookRegistry, ToolCallGate},
    llm::{LLMService, ToolCall},
    tools::{PolicyEngine, ToolRegistry},
};

use super::events::{AgentEvent, AssistantContent};
use crate::context::ConversationContext;

/// Tool results larger than this are clipped before they re-enter context.
const MAX_TOOL_RESULT_CHARS: usize = 50_000;

/// Loop bounds.
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub max_turns: usize,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self { max_turns: 100 }
    }
}

/// Run the reasoning loop, yielding events lazily.
///
/// The caller owns persistence; the loop only mutates the in-memory context.
pub fn agent_loop(
    llm: Arc<LLMService>,
    ctx: Arc<tokio::sync::Mutex<ConversationContext>>,
    tools: Arc<Mutex<ToolRegistry>>,
    policy: Arc<PolicyEngine>,
    hooks: Arc<HookRegistry>,
    config: AgentLoopConfig,
) -> impl Stream<Item = AgentEvent> + Send {
    stream! {
        if let Err(e) = hooks.fire(HookEvent::BeforeAgentStart, HookPayload::Empty).await {
            yield AgentEvent::Error { error: e.to_string() };
            return;
        }

        let mut turns = 0usize;
        loop {
            turns += 1;
            if turns > config.max_turns {
                yield AgentEvent::MaxTurnsReached { turns: config.max_turns };
                return;
            }

            if let Err(e) = hooks.fire(HookEvent::TurnStart, HookPayload::Empty).await {
                yield AgentEvent::Error { error: e.to_string() };
                return;
            }

            // ── Assemble ───────────────────────────────────────────────────
            let default_assembled = {
                let ctx = ctx.lock().await;
                AssembledContext {
                    messages: ctx.messages().to_vec(),
                    options: ctx.options().clone(),
                }
            };
            let assembled = match hooks
                .fire(HookEvent::ContextAssemble, HookPayload::Assembled(default_assembled.clone()))
                .await
            {
                Ok(HookPayload::Assembled(a)) => a,
                Ok(_) => default_assembled,
                Err(e) => {
                    yield AgentEvent::Error { error: e.to_string() };
                    return;
                }
            };

            // ── Stream completion ──────────────────────────────────────────
            let specs = {
                let registry = match tools.lock() {
                    Ok(g) => g,
                    Err(p) => p.into_inner(),
                };
                registry.list_primary(&policy)
            };
            let response = match llm
                .stream_completion(&assembled.messages, &specs, &assembled.options)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    yield AgentEvent::Error { error: e.to_string() };
                    return;
                }
            };

            let tool_calls: Vec<ToolCall> = response.tool_calls.clone().unwrap_or_default();
            yield AgentEvent::AssistantMessage {
                content: AssistantContent {
                    text: response.text.clone(),
                    tool_calls: response.tool_calls.clone(),
                    finish_reason: response.finish_reason.clone(),
                },
            };
            ctx.lock().await.append_assistant(response.text, tool_calls.clone());

            // ── Terminal turn ──────────────────────────────────────────────
            if tool_calls.is_empty() {
                for event in [HookEvent::TurnEnd, HookEvent::AgentEnd] {
                    if let Err(e) = hooks.fire(event, HookPayload::Empty).await {
                        yield AgentEvent::Error { error: e.to_string() };
                        return;
                    }
                }
                return;
            }

            // ── Execute tool calls in model order ──────────────────────────
            for call in &tool_calls {
                let arguments: Value = match serde_json::from_str(&call.arguments) {
                    Ok(v) => v,
                    Err(e) => {
                        // Malformed arguments are a structured result, not a
                        // stream failure.
                        let result = serde_json::json!({
                            "error": format!("invalid arguments: {e}")
                        })
                        .to_string();
                        yield AgentEvent::ToolResult {
                            name: call.name.clone(),
                            tool_call_id: call.id.clone(),
                            result: result.clone(),
                        };
                        ctx.lock().await.append_tool(call.id.clone(), result);
                        continue;
                    }
                };

                // Gate through the tool_call chain.
                let gate = ToolCallGate::new(call.name.clone(), arguments.clone());
                let blocked_reason = match hooks
                    .fire(HookEvent::ToolCall, HookPayload::ToolCall(gate))
                    .await
                {
                    Ok(HookPayload::ToolCall(g)) if g.blocked => {
                        Some(g.reason.unwrap_or_else(|| "blocked".to_string()))
                    }
                    Ok(_) => None,
                    Err(RuntimeError::HookBlocked { reason }) => Some(reason),
                    Err(e) => {
                        yield AgentEvent::Error { error: e.to_string() };
                        return;
                    }
                };

                if let Some(reason) = blocked_reason {
                    yield AgentEvent::ToolBlocked {
                        name: call.name.clone(),
                        reason: reason.clone(),
                    };
                    let synthetic =
                        serde_json::json!({ "error": format!("Tool blocked: {reason}") })
                            .to_string();
                    ctx.lock().await.append_tool(call.id.clone(), synthetic);
                    continue;
                }

                if let Err(e) = hooks
                    .fire(
                        HookEvent::ToolExecutionStart,
                        HookPayload::ToolExecution { name: call.name.clone(), result: None },
                    )
                    .await
                {
                    yield AgentEvent::Error { error: e.to_string() };
                    return;
                }

                let handler = {
                    let registry = match tools.lock() {
                        Ok(g) => g,
                        Err(p) => p.into_inner(),
                    };
                    registry.get(&call.name)
                };
                let result: Value = match handler {
                    Some(tool) => tool.execute(arguments).await,
                    None => serde_json::json!({
                        "error": format!("Tool '{}' is not registered", call.name)
                    }),
                };

                if let Err(e) = hooks
                    .fire(
                        HookEvent::ToolExecutionEnd,
                        HookPayload::ToolExecution {
                            name: call.name.clone(),
                            result: Some(result.clone()),
                        },
                    )
                    .await
                {
                    yield AgentEvent::Error { error: e.to_string() };
                    return;
                }

                let serialized = result.to_string();
                let truncated = truncate_result(&serialized);
                yield AgentEvent::ToolResult {
                    name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    result: truncated.clone(),
                };
                ctx.lock().await.append_tool(call.id.clone(), truncated);

                if let Err(e) = hooks
                    .fire(
                        HookEvent::ToolResult,
                        HookPayload::ToolExecution {
                            name: call.name.clone(),
                            result: Some(result),
                        },
                    )
                    .await
                {
                    yield AgentEvent::Error { error: e.to_string() };
                    return;
                }
            }

            if let Err(e) = hooks.fire(HookEvent::TurnEnd, HookPayload::Empty).await {
                yield AgentEvent::Error { error: e.to_string() };
                return;
            }
        }
    }
}

/// Clip a serialized tool result to [`MAX_TOOL_RESULT_CHARS`], appending a
/// marker when content was dropped.
fn truncate_result(serialized: &str) -> String {
    if serialized.len() <= MAX_TOOL_RESULT_CHARS {
        return serialized.to_string();
    }
    let mut end = MAX_TOOL_RESULT_CHARS;
    while end > 0 && !serialized.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[truncated: {} chars, showing first {}]",
        &serialized[..end],
        serialized.len(),
        end
    )
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedProvider;
    use crate::llm::StreamChunk;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value) -> Value {
            args.get("message").cloned().unwrap_or(json!("(empty)"))
        }
    }

    struct CountingTool(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "danger"
        }
        fn description(&self) -> &str {
            "should never run when blocked"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> Value {
            self.0.fetch_add(1, Ordering::SeqCst);
            json!("ran")
        }
    }

    fn setup(
        turns: Vec<Vec<StreamChunk>>,
    ) -> (
        Arc<LLMService>,
        Arc<tokio::sync::Mutex<ConversationContext>>,
        Arc<Mutex<ToolRegistry>>,
        Arc<PolicyEngine>,
        Arc<HookRegistry>,
    ) {
        let llm = Arc::new(LLMService::new(
            vec![ScriptedProvider::new("mock", turns).into_arc()],
            vec![],
        ));
        llm.bind_session("s1").expect("bind");

        let mut ctx = ConversationContext::new("sys");
        ctx.append_user("Hi");

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        (
            llm,
            Arc::new(tokio::sync::Mutex::new(ctx)),
            Arc::new(Mutex::new(registry)),
            Arc::new(PolicyEngine::allow_all()),
            Arc::new(HookRegistry::new()),
        )
    }

    async fn collect(
        llm: Arc<LLMService>,
        ctx: Arc<tokio::sync::Mutex<ConversationContext>>,
        tools: Arc<Mutex<ToolRegistry>>,
        policy: Arc<PolicyEngine>,
        hooks: Arc<HookRegistry>,
        config: AgentLoopConfig,
    ) -> Vec<AgentEvent> {
        agent_loop(llm, ctx, tools, policy, hooks, config)
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn text_only_single_turn() {
        let (llm, ctx, tools, policy, hooks) = setup(vec![ScriptedProvider::text_turn("Hello!")]);
        let events = collect(llm, ctx.clone(), tools, policy, hooks, Default::default()).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentEvent::AssistantMessage { content } => {
                assert_eq!(content.text, "Hello!");
                assert!(content.tool_calls.is_none());
                assert_eq!(content.finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // The assistant turn landed in context.
        assert_eq!(ctx.lock().await.messages().last().unwrap().content, "Hello!");
    }

    #[tokio::test]
    async fn tool_call_then_text() {
        let (llm, ctx, tools, policy, hooks) = setup(vec![
            ScriptedProvider::tool_turn("tc1", "echo", r#"{"message":"ping"}"#),
            ScriptedProvider::text_turn("Here are the results."),
        ]);
        let events = collect(llm, ctx, tools, policy, hooks, Default::default()).await;

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                AgentEvent::AssistantMessage { .. } => "assistant_message",
                AgentEvent::ToolResult { .. } => "tool_result",
                AgentEvent::ToolBlocked { .. } => "tool_blocked",
                AgentEvent::MaxTurnsReached { .. } => "max_turns_reached",
                AgentEvent::Error { .. } => "error",
            })
            .collect();
        assert_eq!(kinds, vec!["assistant_message", "tool_result", "assistant_message"]);

        match &events[1] {
            AgentEvent::ToolResult { name, tool_call_id, result } => {
                assert_eq!(name, "echo");
                assert_eq!(tool_call_id, "tc1");
                assert!(result.contains("ping"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn max_turns_reached() {
        let turns: Vec<Vec<StreamChunk>> = (0..10)
            .map(|i| ScriptedProvider::tool_turn(&format!("tc{i}"), "echo", r#"{"message":"looping"}"#))
            .collect();
        let (llm, ctx, tools, policy, hooks) = setup(turns);
        let events = collect(
            llm,
            ctx,
            tools,
            policy,
            hooks,
            AgentLoopConfig { max_turns: 3 },
        )
        .await;

        assert!(matches!(
            events.last(),
            Some(AgentEvent::MaxTurnsReached { turns: 3 })
        ));
        // 3 full turns before the bound: (assistant + tool_result) x 3.
        assert_eq!(events.len(), 7);
    }

    #[tokio::test]
    async fn tool_blocked_by_hook() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (llm, ctx, tools, policy, hooks) = setup(vec![
            ScriptedProvider::tool_turn("tc1", "danger", "{}"),
            ScriptedProvider::text_turn("Understood, skipping that."),
        ]);
        {
            let mut registry = tools.lock().unwrap();
            registry.register(Arc::new(CountingTool(ran.clone())));
        }
        hooks.register(HookEvent::ToolCall, 0, |payload| async move {
            match payload {
                HookPayload::ToolCall(gate) if gate.name == "danger" => {
                    Ok(HookPayload::ToolCall(gate.block("Too risky")))
                }
                other => Ok(other),
            }
        });

        let events = collect(llm, ctx.clone(), tools, policy, hooks, Default::default()).await;

        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolBlocked { name, reason } if name == "danger" && reason == "Too risky"
        )));
        assert_eq!(ran.load(Ordering::SeqCst), 0, "blocked handler must not run");
        assert!(
            matches!(events.last(), Some(AgentEvent::AssistantMessage { .. })),
            "loop continues after a blocked call"
        );
        // Synthetic tool result landed in context for the blocked call.
        let ctx = ctx.lock().await;
        assert!(ctx
            .messages()
            .iter()
            .any(|m| m.tool_call_id.as_deref() == Some("tc1")
                && m.content.contains("Tool blocked: Too risky")));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let (llm, ctx, tools, policy, hooks) = setup(vec![
            ScriptedProvider::tool_turn("tc1", "nonexistent", "{}"),
            ScriptedProvider::text_turn("Could not find that tool."),
        ]);
        let events = collect(llm, ctx, tools, policy, hooks, Default::default()).await;
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolResult { result, .. } if result.contains("not registered")
        )));
    }

    #[tokio::test]
    async fn provider_failure_yields_single_error() {
        let (llm, ctx, tools, policy, hooks) = setup(vec![]); // script exhausted immediately
        let events = collect(llm, ctx, tools, policy, hooks, Default::default()).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
    }

    #[tokio::test]
    async fn result_and_blocked_counts_cover_all_calls() {
        // One turn with two calls: the first blocked, the second executed.
        let turn = vec![
            StreamChunk::ToolCallDelta {
                id: "tc1".into(),
                name: Some("danger".into()),
                arguments: "{}".into(),
            },
            StreamChunk::ToolCallDelta {
                id: "tc2".into(),
                name: Some("echo".into()),
                arguments: r#"{"message":"ok"}"#.into(),
            },
            StreamChunk::Done {
                finish_reason: "tool_calls".into(),
            },
        ];
        let (llm, ctx, tools, policy, hooks) =
            setup(vec![turn, ScriptedProvider::text_turn("done")]);
        hooks.register(HookEvent::ToolCall, 0, |payload| async move {
            match payload {
                HookPayload::ToolCall(gate) if gate.name == "danger" => {
                    Err(RuntimeError::blocked("no"))
                }
                other => Ok(other),
            }
        });

        let events = collect(llm, ctx, tools, policy, hooks, Default::default()).await;
        let outcomes = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    AgentEvent::ToolResult { .. } | AgentEvent::ToolBlocked { .. }
                )
            })
            .count();
        assert_eq!(outcomes, 2);
    }

    #[test]
    fn truncation_appends_marker() {
        let long = "x".repeat(MAX_TOOL_RESULT_CHARS + 100);
        let clipped = truncate_result(&long);
        assert!(clipped.contains("[truncated:"));
        assert!(clipped.len() < long.len() + 100);

        let short = "short";
        assert_eq!(truncate_result(short), "short");
    }
}
