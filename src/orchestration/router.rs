//! Binding resolution with per-agent circuit breaking.
//!
//! Bindings are declarative rules mapping (channel, peer, team, account)
//! combinations to agents. The router scores every binding against the
//! incoming message facts, sorts descending, and returns the first
//! candidate whose agent is present, available, and breaker-healthy. The
//! router's breakers are its own — independent of the gateway's.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gateway::CircuitBreaker;

use super::registry::AgentRegistry;

// ─── Binding ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Binding {
    pub channel: Option<String>,
    pub peer: Option<String>,
    pub team: Option<String>,
    pub account: Option<String>,
    pub agent_id: String,
    pub priority: Option<i64>,
    /// Forwarded to dispatch as `x-binding-overrides`.
    pub overrides: Option<Value>,
}

/// The selected agent plus the binding that won (for override propagation).
#[derive(Debug, Clone)]
pub struct ResolvedBinding {
    pub agent_id: String,
    pub binding: Binding,
}

// ─── AgentRouter ─────────────────────────────────────────────────────────────

pub struct AgentRouter {
    bindings: Vec<Binding>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl AgentRouter {
    pub fn new(bindings: Vec<Binding>) -> Self {
        Self {
            bindings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the best binding for the message facts, or `None`.
    pub fn resolve(
        &self,
        channel_type: &str,
        sender_id: &str,
        conversation_id: &str,
        registry: &AgentRegistry,
    ) -> Option<ResolvedBinding> {
        let mut scored: Vec<(i64, &Binding)> = self
            .bindings
            .iter()
            .filter_map(|binding| {
                score(binding, channel_type, sender_id, conversation_id)
                    .map(|s| (s, binding))
            })
            .collect();
        // Stable sort keeps config order among equal scores.
        scored.sort_by_key(|(score, _)| std::cmp::Reverse(*score));

        for (_, binding) in scored {
            let Some(manager) = registry.get(&binding.agent_id) else {
                continue;
            };
            if !manager.status().is_available() {
                continue;
            }
            if !self.breaker_for(&binding.agent_id).is_allowed() {
                continue;
            }
            return Some(ResolvedBinding {
                agent_id: binding.agent_id.clone(),
                binding: binding.clone(),
            });
        }
        None
    }

    pub fn record_success(&self, agent_id: &str) {
        self.breaker_for(agent_id).record_success();
    }

    pub fn record_failure(&self, agent_id: &str) {
        self.breaker_for(agent_id).record_failure();
    }

    fn breaker_for(&self, agent_id: &str) -> CircuitBreaker {
        let mut breakers = match self.breakers.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        breakers
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }
}

/// Score a binding; `None` disqualifies it.
fn score(
    binding: &Binding,
    channel_type: &str,
    sender_id: &str,
    conversation_id: &str,
) -> Option<i64> {
    let mut score = binding.priority.unwrap_or(0);

    if let Some(peer) = &binding.peer {
        if peer != sender_id {
            return None;
        }
        score += 4;
    }
    if let Some(team) = &binding.team {
        if team != conversation_id {
            return None;
        }
        score += 2;
    }
    if binding.account.is_some() {
        score += 2;
    }
    if let Some(channel) = &binding.channel {
        if channel == channel_type {
            score += 1;
        } else if channel != "default" {
            return None;
        }
    }
    Some(score)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
