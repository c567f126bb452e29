//! Central registry of available tools, tracked by source.

use std::{collections::HashMap, sync::Arc};

use crate::llm::ToolSpec;

use super::{
    policy::PolicyEngine,
    traits::{Tool, ToolSource},
};

struct Entry {
    tool: Arc<dyn Tool>,
    source: ToolSource,
}

/// Registry shared by the agent loop and the prompt assembler.
///
/// Wrap in `Arc<std::sync::Mutex<ToolRegistry>>` if registration must happen
/// post-startup; for one-time wiring at boot, `Arc<ToolRegistry>` with a
/// fully populated registry is sufficient.
pub struct ToolRegistry {
    tools: HashMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a builtin tool. Overwrites any previous tool with the name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.register_with_source(tool, ToolSource::Builtin);
    }

    /// Register a tool with an explicit source.
    pub fn register_with_source(&mut self, tool: Arc<dyn Tool>, source: ToolSource) {
        self.tools
            .insert(tool.name().to_string(), Entry { tool, source });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|e| e.tool.clone())
    }

    pub fn source(&self, name: &str) -> Option<&ToolSource> {
        self.tools.get(name).map(|e| &e.source)
    }

    /// Unregister every tool contributed by `source` (e.g. when a plugin or
    /// MCP server is torn down). Returns how many were removed.
    pub fn remove_source(&mut self, source: &ToolSource) -> usize {
        let before = self.tools.len();
        self.tools.retain(|_, entry| entry.source != *source);
        before - self.tools.len()
    }

    /// All registered tool specs, sorted by name for stable prompts.
    pub fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|e| e.tool.spec()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Specs surfaced to the model: policy-allowed tools, with MCP tools
    /// included only when pinned (the rest stay in the catalog).
    pub fn list_primary(&self, policy: &PolicyEngine) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|e| policy.is_allowed(e.tool.name()))
            .filter(|e| match &e.source {
                ToolSource::Mcp(_) => policy.is_pinned(e.tool.name()),
                _ => true,
            })
            .map(|e| e.tool.spec())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::policy::PolicyConfig;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct DummyTool(&'static str);

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "a test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> Value {
            json!("done")
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy")));
        assert!(reg.get("dummy").is_some());
        assert!(reg.get("nonexistent").is_none());
        assert_eq!(reg.source("dummy"), Some(&ToolSource::Builtin));
    }

    #[test]
    fn overwrite_same_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy")));
        reg.register(Arc::new(DummyTool("dummy")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_source_drops_only_that_source() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("builtin_tool")));
        reg.register_with_source(
            Arc::new(DummyTool("plug_a")),
            ToolSource::Plugin("p1".into()),
        );
        reg.register_with_source(
            Arc::new(DummyTool("plug_b")),
            ToolSource::Plugin("p1".into()),
        );

        let removed = reg.remove_source(&ToolSource::Plugin("p1".into()));
        assert_eq!(removed, 2);
        assert!(reg.get("builtin_tool").is_some());
        assert!(reg.get("plug_a").is_none());
    }

    #[test]
    fn list_primary_hides_unpinned_mcp() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("builtin_tool")));
        reg.register_with_source(
            Arc::new(DummyTool("mcp_pinned")),
            ToolSource::Mcp("srv".into()),
        );
        reg.register_with_source(
            Arc::new(DummyTool("mcp_catalog_only")),
            ToolSource::Mcp("srv".into()),
        );

        let policy = PolicyEngine::new(&PolicyConfig {
            pinned_mcp: vec!["mcp_pinned".into()],
            ..Default::default()
        });
        let names: Vec<String> = reg
            .list_primary(&policy)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert!(names.contains(&"builtin_tool".to_string()));
        assert!(names.contains(&"mcp_pinned".to_string()));
        assert!(!names.contains(&"mcp_catalog_only".to_string()));
    }

    #[test]
    fn list_primary_respects_deny() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("allowed")));
        reg.register(Arc::new(DummyTool("denied")));

        let policy = PolicyEngine::new(&PolicyConfig {
            deny: vec!["denied".into()],
            ..Default::default()
        });
        let names: Vec<String> = reg
            .list_primary(&policy)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["allowed".to_string()]);
    }
}
