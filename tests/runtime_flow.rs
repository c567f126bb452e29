//! End-to-end flows over the public API: gateway ingress to agent dispatch
//! and back to the originator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::time::timeout;

use agentic_os::prelude::*;

// ─── Scripted provider ───────────────────────────────────────────────────────

/// Replays fixed chunk sequences, one per completion call.
struct ScriptedProvider {
    turns: Mutex<Vec<Vec<StreamChunk>>>,
}

impl ScriptedProvider {
    fn text_turns(texts: &[&str]) -> Arc<dyn LLMProvider> {
        let turns = texts
            .iter()
            .map(|text| {
                vec![
                    StreamChunk::TextDelta {
                        text: (*text).to_string(),
                    },
                    StreamChunk::Done {
                        finish_reason: "stop".into(),
                    },
                ]
            })
            .rev()
            .collect();
        Arc::new(Self {
            turns: Mutex::new(turns),
        })
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_completion(
        &self,
        _messages: &[ChatMessage],
        _tools: &[ToolSpec],
        _options: &CompletionOptions,
    ) -> Result<ChunkStream> {
        let next = self.turns.lock().unwrap().pop();
        match next {
            Some(chunks) => Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok)))),
            None => Err(RuntimeError::ProviderUnavailable("script exhausted".into())),
        }
    }

    fn count_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| m.content.len().div_ceil(4)).sum()
    }

    fn context_window(&self) -> usize {
        128_000
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn config_for(dir: &tempfile::TempDir, agent_id: &str) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.base_path = dir.path().to_path_buf();
    config.gateway.bind_addr = "127.0.0.1:0".into();
    config.agents = vec![AgentDefinition {
        id: agent_id.to_string(),
        name: agent_id.to_string(),
        ..Default::default()
    }];
    config
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn gateway_ingress_reaches_agent_and_replies_by_correlation() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AppBootstrap::new(config_for(&dir, "main"))
        .with_providers(vec![ScriptedProvider::text_turns(&["hello back"])])
        .build()
        .await
        .unwrap();
    runtime.start().await.unwrap();

    let mut responses = runtime.gateway.on_response_for_correlation("corr-1");
    let request = AgentMessage::task_request("channel://webchat", "main", "hello there", None)
        .with_correlation("corr-1");
    runtime.gateway.handle_incoming(request, None);

    let first = timeout(Duration::from_secs(3), responses.recv())
        .await
        .expect("response within deadline")
        .expect("listener still registered");
    assert_eq!(first.message_type, EnvelopeType::TaskResponse);
    let event: AgentEvent = serde_json::from_value(first.data["event"].clone()).unwrap();
    match event {
        AgentEvent::AssistantMessage { content } => assert_eq!(content.text, "hello back"),
        other => panic!("unexpected event {other:?}"),
    }

    let done = timeout(Duration::from_secs(3), responses.recv())
        .await
        .expect("done within deadline")
        .expect("listener still registered");
    assert_eq!(done.message_type, EnvelopeType::TaskDone);
}

#[tokio::test]
async fn duplicate_ingress_produces_one_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AppBootstrap::new(config_for(&dir, "main"))
        .with_providers(vec![ScriptedProvider::text_turns(&["only once"])])
        .build()
        .await
        .unwrap();
    runtime.start().await.unwrap();

    let mut responses = runtime.gateway.on_response_for_correlation("corr-dup");
    for _ in 0..2 {
        let request =
            AgentMessage::task_request("channel://webchat", "main", "dedupe me", None)
                .with_correlation("corr-dup")
                .with_idempotency_key("stable-key");
        runtime.gateway.handle_incoming(request, None);
    }

    // Exactly one response + one done; a second dispatch would also fail the
    // provider (script has one turn) and surface a task.error.
    let mut kinds = Vec::new();
    while let Ok(Some(message)) = timeout(Duration::from_millis(1500), responses.recv()).await {
        kinds.push(message.message_type);
    }
    assert_eq!(
        kinds,
        vec![EnvelopeType::TaskResponse, EnvelopeType::TaskDone]
    );
}

#[tokio::test]
async fn session_continues_across_dispatches() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = AppBootstrap::new(config_for(&dir, "main"))
        .with_providers(vec![ScriptedProvider::text_turns(&["first", "second"])])
        .build()
        .await
        .unwrap();

    let manager = runtime.local_registry.get("main").unwrap();

    let stream = manager.dispatch("one", None).await.unwrap();
    let _: Vec<AgentEvent> = futures::StreamExt::collect(stream).await;
    let session = manager.current_session().unwrap();

    let stream = manager.dispatch("two", Some(session.clone())).await.unwrap();
    let _: Vec<AgentEvent> = futures::StreamExt::collect(stream).await;

    let replayed = runtime
        .session_store
        .replay("main", &session)
        .await
        .unwrap();
    // user/assistant for each dispatch.
    assert_eq!(replayed.len(), 4);
    assert_eq!(replayed[0].content, "one");
    assert_eq!(replayed[1].content, "first");
    assert_eq!(replayed[2].content, "two");
    assert_eq!(replayed[3].content, "second");
}
