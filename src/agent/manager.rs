//! `AgentManager` — the per-agent lifecycle state machine and dispatch
//! entry point.
//!
//! The manager exclusively owns its `ConversationContext`, `HookRegistry`,
//! and per-session `LLMService` binding. Dispatches run the turn loop and
//! persist every assistant message and tool result to the session log; the
//! status machine serializes dispatches (a RUNNING agent refuses a second
//! `dispatch` until the stream completes back to READY).

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
};

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::{
    context::{
        AssemblerConfig, ContextCompactor, ContextPruner, ConversationContext, PromptAssembler,
        RuntimeInfo, SkillRef,
    },
    error::{Result, RuntimeError},
    gateway::{AgentMessage, Broker, EnvelopeType},
    hooks::{HookEvent, HookHandle, HookPayload, HookRegistry},
    llm::{ChatMessage, LLMService, ToolCall},
    memory::{ChunkerConfig, EpisodicMemoryStore, register_memory_flush},
    orchestration::{
        AgentScheduler, ScheduledTask, TaskPriority,
        scheduler::{DoneCallback, ErrorCallback, EventCallback},
    },
    session::SessionStore,
    tools::{PolicyConfig, PolicyEngine, ToolRegistry},
};

use super::{
    events::{AgentEvent, EventStream},
    loop_::{AgentLoopConfig, agent_loop},
    state::{AgentControlBlock, AgentStatus},
};

// ─── AgentDefinition ─────────────────────────────────────────────────────────

fn default_priority() -> u8 {
    1
}
fn default_reserve_tokens() -> usize {
    2_048
}
fn default_max_turns() -> usize {
    100
}

/// Declarative configuration of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Explicit persona; `agents/<id>/SOUL.md` wins when present.
    pub persona: Option<String>,
    pub model: String,
    pub priority: u8,
    pub skills: Vec<SkillRef>,
    pub assembler: AssemblerConfig,
    pub policy: PolicyConfig,
    pub reserve_tokens: usize,
    pub max_turns: usize,
}

impl Default for AgentDefinition {
    fn default() -> Self {
        Self {
            id: "main".to_string(),
            name: "Main".to_string(),
            description: String::new(),
            persona: None,
            model: String::new(),
            priority: default_priority(),
            skills: Vec::new(),
            assembler: AssemblerConfig::default(),
            policy: PolicyConfig::default(),
            reserve_tokens: default_reserve_tokens(),
            max_turns: default_max_turns(),
        }
    }
}

// ─── AgentSnapshot ───────────────────────────────────────────────────────────

/// Point-in-time serialization of an agent's in-memory context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
    pub loop_iteration: usize,
    pub pending_tool_calls: Vec<ToolCall>,
    pub saved_at: DateTime<Utc>,
}

// ─── AgentManager ────────────────────────────────────────────────────────────

pub struct AgentManager {
    definition: AgentDefinition,
    base_path: PathBuf,
    status: Arc<RwLock<AgentStatus>>,
    control: Arc<Mutex<AgentControlBlock>>,
    hooks: Arc<HookRegistry>,
    llm: Mutex<Option<Arc<LLMService>>>,
    session_store: Arc<SessionStore>,
    memory: Option<Arc<EpisodicMemoryStore>>,
    tools: Arc<Mutex<ToolRegistry>>,
    policy: Arc<PolicyEngine>,
    ctx: Mutex<Option<Arc<tokio::sync::Mutex<ConversationContext>>>>,
    persona: RwLock<String>,
    compactor: Mutex<Option<Arc<ContextCompactor>>>,
    handles: Mutex<Vec<HookHandle>>,
    current_session: Arc<RwLock<Option<String>>>,
    inbox_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AgentManager {
    pub fn new(
        definition: AgentDefinition,
        base_path: impl Into<PathBuf>,
        session_store: Arc<SessionStore>,
        tools: Arc<Mutex<ToolRegistry>>,
        policy: Arc<PolicyEngine>,
        memory: Option<Arc<EpisodicMemoryStore>>,
    ) -> Self {
        let control = AgentControlBlock::new(definition.id.clone(), definition.priority);
        Self {
            base_path: base_path.into(),
            status: Arc::new(RwLock::new(AgentStatus::Registered)),
            control: Arc::new(Mutex::new(control)),
            hooks: Arc::new(HookRegistry::new()),
            llm: Mutex::new(None),
            session_store,
            memory,
            tools,
            policy,
            ctx: Mutex::new(None),
            persona: RwLock::new(String::new()),
            compactor: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            current_session: Arc::new(RwLock::new(None)),
            inbox_task: Mutex::new(None),
            definition,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn hooks(&self) -> Arc<HookRegistry> {
        self.hooks.clone()
    }

    pub fn status(&self) -> AgentStatus {
        *read_lock(&self.status)
    }

    /// Current control block with the live status folded in.
    pub fn control_block(&self) -> AgentControlBlock {
        let mut block = lock(&self.control).clone();
        block.status = self.status();
        block
    }

    pub fn current_session(&self) -> Option<String> {
        read_lock(&self.current_session).clone()
    }

    fn agent_dir(&self) -> PathBuf {
        self.base_path.join("agents").join(&self.definition.id)
    }

    fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.agent_dir()
            .join("snapshots")
            .join(format!("{session_id}.json"))
    }

    /// Apply a transition, failing hard on any edge outside the matrix. The
    /// status is left untouched on failure.
    pub fn transition(&self, to: AgentStatus) -> Result<()> {
        let mut status = write_lock(&self.status);
        if !status.can_transition(to) {
            return Err(RuntimeError::InvalidTransition {
                from: status.to_string(),
                to: to.to_string(),
            });
        }
        *status = to;
        lock(&self.control).status = to;
        Ok(())
    }

    // ── init ─────────────────────────────────────────────────────────────────

    /// REGISTERED → INITIALIZING → READY: prepare the workspace, load the
    /// persona, build the compactor, and register the prompt-assembly chain.
    pub async fn init(&self, llm: Arc<LLMService>) -> Result<()> {
        self.transition(AgentStatus::Initializing)?;

        let agent_dir = self.agent_dir();
        tokio::fs::create_dir_all(agent_dir.join("snapshots")).await?;

        let persona = match tokio::fs::read_to_string(agent_dir.join("SOUL.md")).await {
            Ok(soul) => soul,
            Err(_) => self.definition.persona.clone().unwrap_or_else(|| {
                format!(
                    "You are {}. {}",
                    self.definition.name, self.definition.description
                )
            }),
        };
        *write_lock(&self.persona) = persona.clone();

        *lock(&self.compactor) = Some(Arc::new(ContextCompactor::new(
            llm.clone(),
            self.hooks.clone(),
            persona,
            self.definition.reserve_tokens,
        )));

        let mut handles = PromptAssembler::new(
            self.definition.assembler.clone(),
            agent_dir,
            self.tools.clone(),
            self.definition.skills.clone(),
            RuntimeInfo {
                os: std::env::consts::OS.to_string(),
                model: self.definition.model.clone(),
                timezone: std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string()),
                repo_root: self.base_path.display().to_string(),
                agent_id: self.definition.id.clone(),
                agent_name: self.definition.name.clone(),
            },
        )
        .register(&self.hooks);

        handles.push(ContextPruner::new(llm.default_context_window()).register(&self.hooks));

        if let Some(memory) = &self.memory {
            handles.push(register_memory_flush(
                &self.hooks,
                memory.clone(),
                ChunkerConfig::default(),
                self.definition.id.clone(),
                self.current_session.clone(),
            ));
        }
        lock(&self.handles).extend(handles);

        *lock(&self.llm) = Some(llm);
        self.transition(AgentStatus::Ready)
    }

    // ── dispatch ─────────────────────────────────────────────────────────────

    /// Run one user message through the agent, yielding events.
    ///
    /// The agent goes READY → RUNNING for the lifetime of the returned
    /// stream and back to READY on exhaustion; an `error` event forces
    /// ERROR. Setup failures also force ERROR and propagate.
    #[tracing::instrument(name = "agent.dispatch", skip_all, fields(agent = %self.definition.id))]
    pub async fn dispatch(
        &self,
        message: &str,
        session_id: Option<String>,
    ) -> Result<EventStream> {
        self.transition(AgentStatus::Running)?;
        match self.prepare_dispatch(message, session_id).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.force_error();
                Err(e)
            }
        }
    }

    async fn prepare_dispatch(
        &self,
        message: &str,
        session_id: Option<String>,
    ) -> Result<EventStream> {
        let llm = lock(&self.llm)
            .clone()
            .ok_or_else(|| RuntimeError::ProviderUnavailable("agent not initialized".into()))?;

        // The input chain may rewrite the message or refuse it outright
        // (e.g. an authentication hook).
        let message = match self
            .hooks
            .fire(HookEvent::Input, HookPayload::Text(message.to_string()))
            .await?
        {
            HookPayload::Text(text) => text,
            _ => message.to_string(),
        };
        let message = message.as_str();
        self.hooks
            .fire(HookEvent::AgentStart, HookPayload::Empty)
            .await?;

        let header = self
            .session_store
            .ensure_session(&self.definition.id, session_id.as_deref(), None)
            .await?;
        let session_id = header.session_id;
        llm.bind_session(&session_id)?;

        // Reload context from the session log when none is in memory.
        let existing_ctx = lock(&self.ctx).clone();
        let ctx_arc = match existing_ctx {
            Some(existing) => existing,
            None => {
                let replayed = self
                    .session_store
                    .replay(&self.definition.id, &session_id)
                    .await
                    .unwrap_or_default();
                let persona = read_lock(&self.persona).clone();
                let mut ctx = ConversationContext::new(persona.clone());
                if !replayed.is_empty() {
                    let mut messages = vec![ChatMessage::system(persona)];
                    messages.extend(replayed);
                    ctx.replace_messages(messages);
                }
                let arc = Arc::new(tokio::sync::Mutex::new(ctx));
                *lock(&self.ctx) = Some(arc.clone());
                arc
            }
        };

        ctx_arc.lock().await.append_user(message);
        self.session_store
            .append_message(&self.definition.id, &session_id, &ChatMessage::user(message))
            .await?;

        let existing_compactor = lock(&self.compactor).clone();
        if let Some(compactor) = existing_compactor {
            let mut guard = ctx_arc.lock().await;
            if compactor.needs_compaction(&guard)? {
                log::info!("agent {}: compacting context", self.definition.id);
                compactor.compact(&mut guard).await?;
            }
        }

        *write_lock(&self.current_session) = Some(session_id.clone());

        let inner = agent_loop(
            llm.clone(),
            ctx_arc,
            self.tools.clone(),
            self.policy.clone(),
            self.hooks.clone(),
            AgentLoopConfig {
                max_turns: self.definition.max_turns,
            },
        );

        let store = self.session_store.clone();
        let agent_id = self.definition.id.clone();
        let status = self.status.clone();
        let control = self.control.clone();
        let out = stream! {
            futures::pin_mut!(inner);
            let mut failed = false;
            let mut assistant_turns = 0usize;

            while let Some(event) = inner.next().await {
                match &event {
                    AgentEvent::AssistantMessage { content } => {
                        assistant_turns += 1;
                        let msg = ChatMessage::assistant_with_tools(
                            content.text.clone(),
                            content.tool_calls.clone().unwrap_or_default(),
                        );
                        if let Err(e) = store.append_message(&agent_id, &session_id, &msg).await {
                            log::warn!("agent {agent_id}: failed to persist assistant turn: {e}");
                        }
                    }
                    AgentEvent::ToolResult { tool_call_id, result, .. } => {
                        let msg = ChatMessage::tool(tool_call_id.clone(), result.clone());
                        if let Err(e) = store.append_message(&agent_id, &session_id, &msg).await {
                            log::warn!("agent {agent_id}: failed to persist tool result: {e}");
                        }
                    }
                    AgentEvent::Error { .. } => failed = true,
                    _ => {}
                }
                let terminal_error = event.is_error();
                yield event;
                if terminal_error {
                    break;
                }
            }

            llm.unbind_session();
            {
                let mut block = lock(&control);
                block.loop_iteration += assistant_turns;
                block.usage = llm.session_usage(&session_id);
                block.last_active_at = Utc::now();
            }
            let next = if failed { AgentStatus::Error } else { AgentStatus::Ready };
            let mut current = write_lock(&status);
            if current.can_transition(next) {
                *current = next;
                lock(&control).status = next;
            }
        };
        Ok(Box::pin(out))
    }

    // ── suspend / resume / terminate ─────────────────────────────────────────

    /// Transition to SUSPENDED and write a snapshot of the in-memory context.
    pub async fn suspend(&self) -> Result<()> {
        let session_id = self
            .current_session()
            .ok_or_else(|| RuntimeError::Internal("no active session to snapshot".into()))?;
        let ctx_arc = lock(&self.ctx)
            .clone()
            .ok_or_else(|| RuntimeError::Internal("no in-memory context to snapshot".into()))?;

        self.transition(AgentStatus::Suspended)?;

        let messages = ctx_arc.lock().await.messages().to_vec();
        let snapshot = AgentSnapshot {
            agent_id: self.definition.id.clone(),
            session_id: session_id.clone(),
            messages,
            loop_iteration: lock(&self.control).loop_iteration,
            pending_tool_calls: Vec::new(),
            saved_at: Utc::now(),
        };
        let path = self.snapshot_path(&session_id);
        tokio::fs::write(&path, serde_json::to_string_pretty(&snapshot)?).await?;
        lock(&self.control).snapshot_ref = Some(path.display().to_string());
        Ok(())
    }

    /// Restore the context from the snapshot written at suspend.
    pub async fn resume(&self) -> Result<()> {
        if self.status() != AgentStatus::Suspended {
            return Err(RuntimeError::InvalidTransition {
                from: self.status().to_string(),
                to: AgentStatus::Ready.to_string(),
            });
        }
        let session_id = self
            .current_session()
            .ok_or_else(|| RuntimeError::Internal("no session to resume".into()))?;

        let raw = tokio::fs::read_to_string(self.snapshot_path(&session_id)).await?;
        let snapshot: AgentSnapshot = serde_json::from_str(&raw)?;

        let mut ctx = ConversationContext::new(read_lock(&self.persona).clone());
        if !snapshot.messages.is_empty() {
            ctx.replace_messages(snapshot.messages);
        }
        *lock(&self.ctx) = Some(Arc::new(tokio::sync::Mutex::new(ctx)));
        lock(&self.control).loop_iteration = snapshot.loop_iteration;

        self.transition(AgentStatus::Ready)
    }

    /// Tear the agent down: drop the inbox subscription, dispose the prompt
    /// handlers, flush memory, and transition to TERMINATED.
    pub async fn terminate(&self) -> Result<()> {
        if let Some(task) = lock(&self.inbox_task).take() {
            // Aborting drops the consumer, which unsubscribes from the inbox.
            task.abort();
        }

        let handles: Vec<HookHandle> = lock(&self.handles).drain(..).collect();
        for handle in &handles {
            self.hooks.unregister(handle);
        }

        if let Some(ctx_arc) = lock(&self.ctx).clone() {
            let messages = ctx_arc.lock().await.messages().to_vec();
            if let Err(e) = self
                .hooks
                .fire(HookEvent::MemoryFlush, HookPayload::Messages(messages))
                .await
            {
                log::warn!("agent {}: terminate flush failed: {e}", self.definition.id);
            }
        }

        self.transition(AgentStatus::Terminated)
    }

    // ── Inbox consumption ────────────────────────────────────────────────────

    /// Consume this agent's inbox: every `task.request` is scheduled as a
    /// dispatch, with its events published back to the envelope's `replyTo`.
    ///
    /// Returns the broker consumer id so the gateway can pause it when this
    /// agent's breaker opens.
    pub async fn subscribe_inbox(
        self: &Arc<Self>,
        broker: Arc<dyn Broker>,
        scheduler: Arc<AgentScheduler>,
    ) -> Result<u64> {
        let subject = format!("agent.{}.inbox", self.definition.id);
        let mut sub = broker.consume("AGENT_TASKS", &subject).await?;
        let consumer_id = sub.id;

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = sub.recv().await {
                let message = delivery.message.clone();
                delivery.ack();
                if message.message_type != EnvelopeType::TaskRequest {
                    continue;
                }
                let text = message.data["text"].as_str().unwrap_or_default().to_string();
                if text.is_empty() {
                    log::debug!("agent {}: empty task.request dropped", manager.definition.id);
                    continue;
                }
                let session_id = message
                    .data
                    .get("sessionId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let priority = match message
                    .metadata
                    .get("x-priority")
                    .and_then(|v| v.as_str())
                {
                    Some("delegation") => TaskPriority::Delegation,
                    Some("background") => TaskPriority::Background,
                    _ => TaskPriority::User,
                };
                let correlation = message
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| message.id.clone());

                let task = ScheduledTask::new(&manager.definition.id, &text)
                    .with_session(session_id)
                    .with_priority(priority)
                    .with_correlation(Some(correlation.clone()));

                let replies = ReplyPublisher::new(
                    broker.clone(),
                    message.reply_to.clone(),
                    format!("agent://{}", manager.definition.id),
                    message.source.clone(),
                    correlation,
                );
                let on_event: EventCallback = {
                    let replies = replies.clone();
                    Arc::new(move |event: AgentEvent| replies.event(&event))
                };
                let on_done: DoneCallback = {
                    let replies = replies.clone();
                    Arc::new(move || replies.done())
                };
                let on_error: ErrorCallback = {
                    let replies = replies.clone();
                    Arc::new(move |error: String| replies.error(&error))
                };
                scheduler.enqueue(task, manager.clone(), on_event, on_done, on_error);
            }
        });
        *lock(&self.inbox_task) = Some(handle);
        Ok(consumer_id)
    }

    fn force_error(&self) {
        let mut status = write_lock(&self.status);
        if status.can_transition(AgentStatus::Error) {
            *status = AgentStatus::Error;
            lock(&self.control).status = AgentStatus::Error;
        }
    }
}

// ─── ReplyPublisher ──────────────────────────────────────────────────────────

/// Orders reply publishes behind a single drain task so events reach the
/// reply inbox in dispatch order.
#[derive(Clone)]
struct ReplyPublisher {
    tx: tokio::sync::mpsc::UnboundedSender<(EnvelopeType, serde_json::Value)>,
}

impl ReplyPublisher {
    fn new(
        broker: Arc<dyn Broker>,
        reply_to: Option<String>,
        source: String,
        target: String,
        correlation: String,
    ) -> Self {
        let (tx, mut rx) =
            tokio::sync::mpsc::unbounded_channel::<(EnvelopeType, serde_json::Value)>();
        if let Some(reply_to) = reply_to {
            tokio::spawn(async move {
                while let Some((message_type, data)) = rx.recv().await {
                    let message = AgentMessage::new(
                        message_type,
                        source.clone(),
                        target.clone(),
                        data,
                    )
                    .with_correlation(correlation.clone());
                    if let Err(e) = broker.publish(&reply_to, &message).await {
                        log::warn!("reply publish to '{reply_to}' failed: {e}");
                    }
                }
            });
        }
        Self { tx }
    }

    fn event(&self, event: &AgentEvent) {
        let _ = self.tx.send((
            EnvelopeType::TaskResponse,
            serde_json::json!({ "event": event }),
        ));
    }

    fn done(&self) {
        let _ = self
            .tx
            .send((EnvelopeType::TaskDone, serde_json::json!({})));
    }

    fn error(&self, error: &str) {
        let _ = self.tx.send((
            EnvelopeType::TaskError,
            serde_json::json!({ "error": error }),
        ));
    }
}

// Poison-tolerant lock helpers; the runtime treats a poisoned lock as
// recoverable shared state.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
