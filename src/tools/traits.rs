//! The tool capability contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ToolSpec;

/// Where a tool came from. Policy rules and catalog listings distinguish
/// runtime builtins from plugin- and MCP-provided tools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    /// Compiled into the runtime.
    Builtin,
    /// Registered by a named plugin.
    Plugin(String),
    /// Exposed by a named MCP server.
    Mcp(String),
}

impl std::fmt::Display for ToolSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolSource::Builtin => write!(f, "builtin"),
            ToolSource::Plugin(name) => write!(f, "plugin:{name}"),
            ToolSource::Mcp(name) => write!(f, "mcp:{name}"),
        }
    }
}

/// A capability the agent loop can invoke.
///
/// Implementations must be `Send + Sync` so they can be held in a shared
/// `Arc<dyn Tool>` registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"memory_search"`.
    fn name(&self) -> &str;

    /// Human-readable description used in provider `tools` payloads.
    fn description(&self) -> &str;

    /// JSON Schema object describing the accepted parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute with already-parsed arguments.
    ///
    /// Failures are returned as a structured error value, never panicked;
    /// the loop feeds the result back to the model either way.
    async fn execute(&self, args: Value) -> Value;

    /// Provider-facing summary.
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Build the structured error payload tools return on bad arguments.
pub fn validation_error(message: impl std::fmt::Display) -> Value {
    serde_json::json!({ "error": format!("invalid arguments: {message}") })
}

/// Pull a required string argument out of a JSON object.
pub fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, Value> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| validation_error(format!("missing required string field '{key}'")))
}
