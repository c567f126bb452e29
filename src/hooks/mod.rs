//! `HookRegistry` — ordered, prioritized, interceptable lifecycle events.
//!
//! Every cross-cutting concern (prompt assembly, pruning, memory flush, tool
//! gating) hangs off a named event as a prioritized handler. `fire` runs the
//! handlers registered for the event in ascending priority order, threading
//! an accumulator through the chain; a handler may refuse the operation with
//! [`RuntimeError::HookBlocked`], which short-circuits the chain and surfaces
//! the reason to the caller.
//!
//! Handlers registered while a `fire` is in flight take effect on the next
//! fire: the chain snapshot is taken before the first handler runs.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{
    error::{Result, RuntimeError},
    llm::{ChatMessage, CompletionOptions},
};

// ─── HookEvent ───────────────────────────────────────────────────────────────

/// The recognized lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    Input,
    BeforeAgentStart,
    AgentStart,
    TurnStart,
    ContextAssemble,
    ToolCall,
    ToolExecutionStart,
    ToolExecutionEnd,
    ToolResult,
    TurnEnd,
    AgentEnd,
    MemoryFlush,
    SessionCompact,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::Input => "input",
            HookEvent::BeforeAgentStart => "before_agent_start",
            HookEvent::AgentStart => "agent_start",
            HookEvent::TurnStart => "turn_start",
            HookEvent::ContextAssemble => "context_assemble",
            HookEvent::ToolCall => "tool_call",
            HookEvent::ToolExecutionStart => "tool_execution_start",
            HookEvent::ToolExecutionEnd => "tool_execution_end",
            HookEvent::ToolResult => "tool_result",
            HookEvent::TurnEnd => "turn_end",
            HookEvent::AgentEnd => "agent_end",
            HookEvent::MemoryFlush => "memory_flush",
            HookEvent::SessionCompact => "session_compact",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── HookPayload ─────────────────────────────────────────────────────────────

/// The messages-plus-options struct threaded through `context_assemble`.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub options: CompletionOptions,
}

/// Gate record threaded through `tool_call`; a handler may set `blocked`.
#[derive(Debug, Clone)]
pub struct ToolCallGate {
    pub name: String,
    pub arguments: Value,
    pub blocked: bool,
    pub reason: Option<String>,
}

impl ToolCallGate {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            blocked: false,
            reason: None,
        }
    }

    pub fn block(mut self, reason: impl Into<String>) -> Self {
        self.blocked = true;
        self.reason = Some(reason.into());
        self
    }
}

/// Accumulator passed through a hook chain.
#[derive(Debug, Clone)]
pub enum HookPayload {
    Empty,
    /// Free text (`input`).
    Text(String),
    /// Messages snapshot (`memory_flush`, `session_compact`).
    Messages(Vec<ChatMessage>),
    /// Assembled prompt (`context_assemble`).
    Assembled(AssembledContext),
    /// Tool-call gate (`tool_call`).
    ToolCall(ToolCallGate),
    /// Tool execution marker (`tool_execution_start`/`_end`, `tool_result`).
    ToolExecution {
        name: String,
        result: Option<Value>,
    },
    /// Anything else.
    Value(Value),
}

// ─── HookRegistry ────────────────────────────────────────────────────────────

/// Boxed async handler: receives the accumulator, returns the next value.
pub type HookFn =
    Arc<dyn Fn(HookPayload) -> BoxFuture<'static, Result<HookPayload>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: u64,
    priority: i32,
    handler: HookFn,
}

/// Handle returned by [`HookRegistry::register`]; pass back to
/// [`HookRegistry::unregister`] to dispose the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookHandle {
    pub event: HookEvent,
    id: u64,
}

/// Maps a lifecycle event to its ordered handler chain.
pub struct HookRegistry {
    chains: Mutex<HashMap<HookEvent, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` on `event` at `priority` (lower runs first).
    ///
    /// Within the same priority, handlers run in registration order.
    pub fn register<F, Fut>(&self, event: HookEvent, priority: i32, handler: F) -> HookHandle
    where
        F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<HookPayload>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let registration = Registration {
            id,
            priority,
            handler: Arc::new(move |payload| Box::pin(handler(payload))),
        };
        let mut chains = self.lock();
        chains.entry(event).or_default().push(registration);
        HookHandle { event, id }
    }

    /// Dispose a handler. Returns `true` if it was still registered.
    pub fn unregister(&self, handle: &HookHandle) -> bool {
        let mut chains = self.lock();
        let Some(chain) = chains.get_mut(&handle.event) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|r| r.id != handle.id);
        let removed = chain.len() != before;
        if chain.is_empty() {
            chains.remove(&handle.event);
        }
        removed
    }

    /// Number of handlers currently registered for `event`.
    pub fn handler_count(&self, event: HookEvent) -> usize {
        self.lock().get(&event).map_or(0, Vec::len)
    }

    /// Run the chain registered for `event` over `seed`.
    ///
    /// Handlers run in ascending priority order against a snapshot taken at
    /// call time. The final accumulator is returned; a
    /// [`RuntimeError::HookBlocked`] from any handler short-circuits and
    /// propagates, as does any other failure.
    pub async fn fire(&self, event: HookEvent, seed: HookPayload) -> Result<HookPayload> {
        let snapshot: Vec<Registration> = {
            let chains = self.lock();
            let mut chain = chains.get(&event).cloned().unwrap_or_default();
            // Stable sort keeps registration order within equal priorities.
            chain.sort_by_key(|r| r.priority);
            chain
        };

        let mut acc = seed;
        for registration in snapshot {
            acc = (registration.handler)(acc).await.map_err(|e| {
                if e.is_blocked() {
                    log::debug!("hook chain '{event}' blocked: {e}");
                }
                e
            })?;
        }
        Ok(acc)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<HookEvent, Vec<Registration>>> {
        match self.chains.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn text(payload: &HookPayload) -> String {
        match payload {
            HookPayload::Text(s) => s.clone(),
            other => panic!("expected Text payload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fire_with_no_handlers_returns_seed() {
        let registry = HookRegistry::new();
        let out = registry
            .fire(HookEvent::Input, HookPayload::Text("hi".into()))
            .await
            .unwrap();
        assert_eq!(text(&out), "hi");
    }

    #[tokio::test]
    async fn handlers_run_in_ascending_priority_order() {
        let registry = HookRegistry::new();
        registry.register(HookEvent::Input, 20, |p| async move {
            Ok(HookPayload::Text(format!("{}b", text(&p))))
        });
        registry.register(HookEvent::Input, 10, |p| async move {
            Ok(HookPayload::Text(format!("{}a", text(&p))))
        });
        registry.register(HookEvent::Input, 30, |p| async move {
            Ok(HookPayload::Text(format!("{}c", text(&p))))
        });

        let out = registry
            .fire(HookEvent::Input, HookPayload::Text(String::new()))
            .await
            .unwrap();
        assert_eq!(text(&out), "abc");
    }

    #[tokio::test]
    async fn equal_priority_preserves_registration_order() {
        let registry = HookRegistry::new();
        registry.register(HookEvent::Input, 5, |p| async move {
            Ok(HookPayload::Text(format!("{}1", text(&p))))
        });
        registry.register(HookEvent::Input, 5, |p| async move {
            Ok(HookPayload::Text(format!("{}2", text(&p))))
        });

        let out = registry
            .fire(HookEvent::Input, HookPayload::Text(String::new()))
            .await
            .unwrap();
        assert_eq!(text(&out), "12");
    }

    #[tokio::test]
    async fn blocked_handler_short_circuits_chain() {
        let registry = HookRegistry::new();
        let later_ran = Arc::new(AtomicUsize::new(0));
        registry.register(HookEvent::ToolCall, 1, |_| async move {
            Err(RuntimeError::blocked("too risky"))
        });
        let counter = later_ran.clone();
        registry.register(HookEvent::ToolCall, 2, move |p| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(p) }
        });

        let err = registry
            .fire(HookEvent::ToolCall, HookPayload::Empty)
            .await
            .unwrap_err();
        assert!(err.is_blocked());
        assert_eq!(later_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unregister_removes_handler() {
        let registry = HookRegistry::new();
        let handle = registry.register(HookEvent::TurnStart, 0, |p| async move { Ok(p) });
        assert_eq!(registry.handler_count(HookEvent::TurnStart), 1);
        assert!(registry.unregister(&handle));
        assert_eq!(registry.handler_count(HookEvent::TurnStart), 0);
        assert!(!registry.unregister(&handle));
    }

    #[tokio::test]
    async fn registration_during_fire_takes_effect_next_fire() {
        let registry = Arc::new(HookRegistry::new());
        let registry_inner = registry.clone();
        registry.register(HookEvent::Input, 0, move |p| {
            let registry = registry_inner.clone();
            async move {
                registry.register(HookEvent::Input, 1, |p| async move {
                    Ok(HookPayload::Text(format!("{}+", text(&p))))
                });
                Ok(p)
            }
        });

        let first = registry
            .fire(HookEvent::Input, HookPayload::Text("x".into()))
            .await
            .unwrap();
        assert_eq!(text(&first), "x", "late registration must not fire this round");

        let second = registry
            .fire(HookEvent::Input, HookPayload::Text("x".into()))
            .await
            .unwrap();
        assert_eq!(text(&second), "x+");
    }
}
