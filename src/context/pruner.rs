//! Hard context pruning with orphan repair.
//!
//! Runs inside `context_assemble` after the enrichment handlers (priority
//! 500) so the budget applies to the fully assembled prompt. The system
//! message always survives; history is retained from the newest message
//! backwards until the budget is spent, then tool/assistant pairings broken
//! by the cut are repaired.

use std::collections::HashSet;
use std::sync::Arc;

use crate::{
    hooks::{HookEvent, HookHandle, HookPayload, HookRegistry},
    llm::{ChatMessage, ChatRole},
};

/// Priority of the pruning handler within `context_assemble`.
pub const PRUNER_PRIORITY: i32 = 500;

const DEFAULT_MAX_HISTORY_SHARE: f64 = 0.5;

/// Token-budget enforcement for assembled prompts.
#[derive(Debug, Clone)]
pub struct ContextPruner {
    context_window: usize,
    max_history_share: f64,
}

impl ContextPruner {
    pub fn new(context_window: usize) -> Self {
        Self {
            context_window,
            max_history_share: DEFAULT_MAX_HISTORY_SHARE,
        }
    }

    pub fn with_max_history_share(mut self, share: f64) -> Self {
        self.max_history_share = share;
        self
    }

    /// Register the pruning handler on `context_assemble`.
    pub fn register(self, hooks: &HookRegistry) -> HookHandle {
        let pruner = Arc::new(self);
        hooks.register(HookEvent::ContextAssemble, PRUNER_PRIORITY, move |payload| {
            let pruner = pruner.clone();
            async move {
                Ok(match payload {
                    HookPayload::Assembled(mut assembled) => {
                        assembled.messages = pruner.prune(&assembled.messages);
                        HookPayload::Assembled(assembled)
                    }
                    other => other,
                })
            }
        })
    }

    /// Prune `messages` to the history budget, repairing orphans.
    pub fn prune(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let Some((system, history)) = messages.split_first() else {
            return Vec::new();
        };

        let system_tokens = estimate_tokens(system);
        let history_budget = (self.context_window.saturating_sub(system_tokens))
            .min((self.context_window as f64 * self.max_history_share) as usize);

        // Walk backward keeping messages while they fit.
        let mut remaining = history_budget;
        let mut first_kept = history.len();
        for (index, message) in history.iter().enumerate().rev() {
            let tokens = estimate_tokens(message);
            if tokens > remaining {
                break;
            }
            remaining -= tokens;
            first_kept = index;
        }

        let mut kept: Vec<ChatMessage> = history[first_kept..].to_vec();
        repair_orphans(&mut kept);

        let mut result = Vec::with_capacity(kept.len() + 1);
        result.push(system.clone());
        result.extend(kept);
        result
    }
}

/// ceil(chars / 4); assistant messages also pay for each tool call's
/// name + arguments + id.
pub fn estimate_tokens(message: &ChatMessage) -> usize {
    let mut chars = message.content.len();
    if message.role == ChatRole::Assistant {
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                chars += call.name.len() + call.arguments.len() + call.id.len();
            }
        }
    }
    chars.div_ceil(4)
}

/// Drop tool messages with no surviving caller, then strip assistant tool
/// calls with no surviving result.
fn repair_orphans(messages: &mut Vec<ChatMessage>) {
    let surviving_call_ids: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == ChatRole::Assistant)
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|c| c.id.clone())
        .collect();

    messages.retain(|m| {
        m.role != ChatRole::Tool
            || m.tool_call_id
                .as_ref()
                .is_some_and(|id| surviving_call_ids.contains(id))
    });

    let surviving_tool_ids: HashSet<String> = messages
        .iter()
        .filter(|m| m.role == ChatRole::Tool)
        .filter_map(|m| m.tool_call_id.clone())
        .collect();

    for message in messages.iter_mut() {
        if message.role != ChatRole::Assistant {
            continue;
        }
        if let Some(calls) = message.tool_calls.take() {
            let kept: Vec<_> = calls
                .into_iter()
                .filter(|c| surviving_tool_ids.contains(&c.id))
                .collect();
            message.tool_calls = if kept.is_empty() { None } else { Some(kept) };
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
