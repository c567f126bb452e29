//! Error taxonomy for the runtime.
//!
//! Each variant maps to a recovery policy:
//! - [`RuntimeError::Validation`] is returned to the tool caller as a
//!   structured payload, never propagated out of the loop.
//! - [`RuntimeError::HookBlocked`] terminates the current hook chain; in the
//!   `tool_call` chain it converts to a `tool_blocked` event.
//! - [`RuntimeError::ProviderUnavailable`] and
//!   [`RuntimeError::InvalidTransition`] are fatal for the caller.
//! - [`RuntimeError::SessionCorrupt`] renders the whole session unreadable.
//! - [`RuntimeError::MemoryStore`] is surfaced to the tool caller and does
//!   not affect the reasoning loop.

use std::time::Duration;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Unified error type for all runtime subsystems.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Tool argument schema mismatch.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A hook handler refused the operation and short-circuited the chain.
    #[error("blocked by hook: {reason}")]
    HookBlocked { reason: String },

    /// No provider is configured, or no session binding is active.
    #[error("LLM provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A lifecycle transition outside the state machine's edge set.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A session log line failed to parse.
    #[error("session corrupt: {0}")]
    SessionCorrupt(String),

    /// Episodic memory storage failure.
    #[error("memory store error: {0}")]
    MemoryStore(String),

    /// Broker publish/subscribe failure.
    #[error("broker error: {0}")]
    Broker(String),

    /// Idempotency store round-trip failure.
    #[error("idempotency store error: {0}")]
    Idempotency(String),

    /// An orchestration call exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl RuntimeError {
    /// Shorthand for the hook-chain refusal.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::HookBlocked {
            reason: reason.into(),
        }
    }

    /// `true` when this error is a hook refusal rather than a failure.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::HookBlocked { .. })
    }
}
