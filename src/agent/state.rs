//! Agent lifecycle states and the control block.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

// ─── AgentStatus ─────────────────────────────────────────────────────────────

/// Lifecycle state of a managed agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Registered,
    Initializing,
    Ready,
    Running,
    Suspended,
    Error,
    Terminated,
}

impl AgentStatus {
    /// The transition matrix. Any edge not listed here is invalid.
    pub fn can_transition(self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Registered, Initializing)
                | (Initializing, Ready)
                | (Ready, Running)
                | (Ready, Suspended)
                | (Ready, Terminated)
                | (Running, Ready)
                | (Running, Suspended)
                | (Running, Terminated)
                | (Running, Error)
                | (Suspended, Ready)
                | (Suspended, Terminated)
                | (Error, Terminated)
                | (Error, Initializing)
        )
    }

    /// `true` for the states in which the router may deliver work.
    pub fn is_available(self) -> bool {
        matches!(self, AgentStatus::Ready | AgentStatus::Running)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Registered => "REGISTERED",
            AgentStatus::Initializing => "INITIALIZING",
            AgentStatus::Ready => "READY",
            AgentStatus::Running => "RUNNING",
            AgentStatus::Suspended => "SUSPENDED",
            AgentStatus::Error => "ERROR",
            AgentStatus::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

// ─── AgentControlBlock ───────────────────────────────────────────────────────

/// Bookkeeping snapshot surfaced for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentControlBlock {
    pub agent_id: String,
    pub status: AgentStatus,
    pub priority: u8,
    pub loop_iteration: usize,
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl AgentControlBlock {
    pub fn new(agent_id: impl Into<String>, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            status: AgentStatus::Registered,
            priority,
            loop_iteration: 0,
            usage: TokenUsage::default(),
            snapshot_ref: None,
            created_at: now,
            last_active_at: now,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
