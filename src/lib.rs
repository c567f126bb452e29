//! agentic-os — a multi-agent runtime.
//!
//! A fleet of long-lived LLM-backed agents runs behind a durable messaging
//! gateway. External clients publish `task.request` envelopes; the gateway
//! fans them into per-agent inboxes through lane-ordered, idempotent,
//! breaker-gated ingress; each agent consumes its inbox through a
//! concurrency-limited scheduler and runs a tool-using reasoning loop with
//! lifecycle hooks, persistent sessions, and episodic memory. Responses
//! stream back to the originator over reply inboxes — including across
//! nodes via the federated registry.

pub mod agent;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod llm;
pub mod memory;
pub mod orchestration;
pub mod session;
pub mod tools;

/// Convenience re-exports for the most commonly used types.
///
/// ```rust
/// use agentic_os::prelude::*;
/// ```
pub mod prelude {
    // Agent lifecycle
    pub use crate::agent::{
        AgentDefinition, AgentEvent, AgentManager, AgentStatus, EventStream,
    };

    // LLM collaborator contract
    pub use crate::llm::{
        ChatMessage, ChatRole, ChunkStream, CompletionOptions, LLMProvider, LLMService,
        StreamChunk, ToolCall, ToolSpec,
    };

    // Hooks
    pub use crate::hooks::{HookEvent, HookPayload, HookRegistry};

    // Tool system
    pub use crate::tools::{PolicyEngine, Tool, ToolRegistry};

    // Memory subsystem
    pub use crate::memory::{EpisodicMemoryStore, MemoryChunk, SearchOptions};

    // Gateway
    pub use crate::gateway::{AgentMessage, Broker, EnvelopeType, GatewayServer};

    // Orchestration
    pub use crate::orchestration::{
        AgentRouter, AgentScheduler, Binding, FederatedAgentRegistry, ScheduledTask,
        TaskPriority,
    };

    // Sessions & configuration
    pub use crate::bootstrap::{AppBootstrap, Runtime};
    pub use crate::config::{RuntimeConfig, load_default_config};
    pub use crate::error::{Result, RuntimeError};
    pub use crate::session::SessionStore;
}
