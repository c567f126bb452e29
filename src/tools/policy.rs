//! Allow/deny tool policy with group expansion and pinned MCP tools.
//!
//! Rules are plain tool names or `group:<name>` references that expand to
//! the group's member tools. Deny always wins; an empty allow list means
//! "everything not denied".

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Declarative policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Named tool groups referenced as `group:<name>`.
    pub groups: HashMap<String, Vec<String>>,
    /// MCP tools surfaced in the primary tools list instead of the catalog.
    pub pinned_mcp: Vec<String>,
}

/// Compiled allow/deny decision engine.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    allow: HashSet<String>,
    deny: HashSet<String>,
    allow_all: bool,
    pinned_mcp: HashSet<String>,
}

impl PolicyEngine {
    pub fn new(config: &PolicyConfig) -> Self {
        let allow = expand(&config.allow, &config.groups);
        let deny = expand(&config.deny, &config.groups);
        Self {
            allow_all: allow.is_empty(),
            allow,
            deny,
            pinned_mcp: config.pinned_mcp.iter().cloned().collect(),
        }
    }

    /// Permissive engine: everything allowed, nothing pinned.
    pub fn allow_all() -> Self {
        Self::new(&PolicyConfig::default())
    }

    /// Deny wins; otherwise the allow list (or allow-all) decides.
    pub fn is_allowed(&self, tool_name: &str) -> bool {
        if self.deny.contains(tool_name) {
            return false;
        }
        self.allow_all || self.allow.contains(tool_name)
    }

    /// `true` when an MCP tool is pinned into the primary tools list.
    pub fn is_pinned(&self, tool_name: &str) -> bool {
        self.pinned_mcp.contains(tool_name)
    }
}

fn expand(rules: &[String], groups: &HashMap<String, Vec<String>>) -> HashSet<String> {
    let mut expanded = HashSet::new();
    for rule in rules {
        match rule.strip_prefix("group:") {
            Some(group_name) => {
                if let Some(members) = groups.get(group_name) {
                    expanded.extend(members.iter().cloned());
                } else {
                    log::warn!("policy references unknown group '{group_name}'");
                }
            }
            None => {
                expanded.insert(rule.clone());
            }
        }
    }
    expanded
}

// ─── Tests ───────────────────────────────────────────────────────────────────
