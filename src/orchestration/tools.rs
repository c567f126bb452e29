//! Orchestration tools: spawn, send, supervise, pipeline, broadcast.
//!
//! These expose multi-agent coordination to the reasoning loop. Every
//! dispatch is raced against a timeout; in parallel modes a failed branch
//! becomes a rejected entry while the others continue.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::{
    agent::AgentEvent,
    tools::{Tool, required_str},
};

use super::registry::{AgentEntry, FederatedAgentRegistry, REMOTE_DISPATCH_TIMEOUT};

// ─── Dispatch helper ─────────────────────────────────────────────────────────

/// Drive one dispatch to completion and return the final assistant text.
async fn collect_final_text(
    entry: Arc<dyn AgentEntry>,
    message: &str,
    session_id: Option<String>,
    deadline: Duration,
) -> std::result::Result<String, String> {
    let run = async {
        let mut stream = entry
            .dispatch(message, session_id)
            .await
            .map_err(|e| e.to_string())?;
        let mut last_text = String::new();
        while let Some(event) = stream.next().await {
            match event {
                AgentEvent::AssistantMessage { content } => last_text = content.text,
                AgentEvent::Error { error } => return Err(error),
                _ => {}
            }
        }
        Ok(last_text)
    };
    match tokio::time::timeout(deadline, run).await {
        Ok(result) => result,
        Err(_) => Err(format!("timed out after {deadline:?}")),
    }
}

fn branch_result(agent_id: &str, outcome: std::result::Result<String, String>) -> Value {
    match outcome {
        Ok(output) => json!({ "agent_id": agent_id, "ok": true, "output": output }),
        Err(error) => json!({ "agent_id": agent_id, "ok": false, "error": error }),
    }
}

// ─── AgentSpawnTool ──────────────────────────────────────────────────────────

/// Run a delegated task on another agent in a fresh session.
pub struct AgentSpawnTool {
    registry: Arc<FederatedAgentRegistry>,
    timeout: Duration,
}

impl AgentSpawnTool {
    pub fn new(registry: Arc<FederatedAgentRegistry>) -> Self {
        Self {
            registry,
            timeout: REMOTE_DISPATCH_TIMEOUT,
        }
    }
}

#[async_trait]
impl Tool for AgentSpawnTool {
    fn name(&self) -> &str {
        "agent_spawn"
    }

    fn description(&self) -> &str {
        "Delegate a task to another agent in a fresh session and return its final answer."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["agent_id", "task"],
            "properties": {
                "agent_id": { "type": "string", "description": "Target agent id." },
                "task": { "type": "string", "description": "Task description for the agent." }
            }
        })
    }

    async fn execute(&self, args: Value) -> Value {
        let agent_id = match required_str(&args, "agent_id") {
            Ok(v) => v.to_string(),
            Err(e) => return e,
        };
        let task = match required_str(&args, "task") {
            Ok(v) => v.to_string(),
            Err(e) => return e,
        };
        let entry = self.registry.get(&agent_id);
        branch_result(
            &agent_id,
            collect_final_text(entry, &task, None, self.timeout).await,
        )
    }
}

// ─── AgentSendTool ───────────────────────────────────────────────────────────

/// Send a message into an agent's ongoing session.
pub struct AgentSendTool {
    registry: Arc<FederatedAgentRegistry>,
    timeout: Duration,
}

impl AgentSendTool {
    pub fn new(registry: Arc<FederatedAgentRegistry>) -> Self {
        Self {
            registry,
            timeout: REMOTE_DISPATCH_TIMEOUT,
        }
    }
}

#[async_trait]
impl Tool for AgentSendTool {
    fn name(&self) -> &str {
        "agent_send"
    }

    fn description(&self) -> &str {
        "Send a message to another agent, optionally continuing one of its sessions."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["agent_id", "message"],
            "properties": {
                "agent_id": { "type": "string" },
                "message": { "type": "string" },
                "session_id": { "type": "string", "description": "Session to continue." }
            }
        })
    }

    async fn execute(&self, args: Value) -> Value {
        let agent_id = match required_str(&args, "agent_id") {
            Ok(v) => v.to_string(),
            Err(e) => return e,
        };
        let message = match required_str(&args, "message") {
            Ok(v) => v.to_string(),
            Err(e) => return e,
        };
        let session_id = args
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let entry = self.registry.get(&agent_id);
        branch_result(
            &agent_id,
            collect_final_text(entry, &message, session_id, self.timeout).await,
        )
    }
}

// ─── AgentSuperviseTool ──────────────────────────────────────────────────────

/// Run a batch of tasks across agents, in parallel or sequentially.
pub struct AgentSuperviseTool {
    registry: Arc<FederatedAgentRegistry>,
    timeout: Duration,
}

impl AgentSuperviseTool {
    pub fn new(registry: Arc<FederatedAgentRegistry>) -> Self {
        Self {
            registry,
            timeout: REMOTE_DISPATCH_TIMEOUT,
        }
    }
}

#[async_trait]
impl Tool for AgentSuperviseTool {
    fn name(&self) -> &str {
        "agent_supervise"
    }

    fn description(&self) -> &str {
        "Run several tasks across agents. Parallel mode races all branches; \
         sequential mode runs them in order. Failed branches are reported, \
         not fatal."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["tasks"],
            "properties": {
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["agent_id", "task"],
                        "properties": {
                            "agent_id": { "type": "string" },
                            "task": { "type": "string" }
                        }
                    }
                },
                "mode": {
                    "type": "string",
                    "enum": ["parallel", "sequential"],
                    "default": "parallel"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Value {
        let Some(tasks) = args.get("tasks").and_then(Value::as_array) else {
            return json!({ "error": "invalid arguments: missing 'tasks' array" });
        };
        let pairs: Vec<(String, String)> = tasks
            .iter()
            .filter_map(|t| {
                Some((
                    t.get("agent_id")?.as_str()?.to_string(),
                    t.get("task")?.as_str()?.to_string(),
                ))
            })
            .collect();
        if pairs.len() != tasks.len() {
            return json!({ "error": "invalid arguments: every task needs agent_id and task" });
        }
        let sequential = args.get("mode").and_then(Value::as_str) == Some("sequential");

        let results: Vec<Value> = if sequential {
            let mut results = Vec::with_capacity(pairs.len());
            for (agent_id, task) in &pairs {
                let entry = self.registry.get(agent_id);
                let outcome = collect_final_text(entry, task, None, self.timeout).await;
                results.push(branch_result(agent_id, outcome));
            }
            results
        } else {
            let branches = pairs.iter().map(|(agent_id, task)| {
                let entry = self.registry.get(agent_id);
                let timeout = self.timeout;
                async move {
                    branch_result(
                        agent_id,
                        collect_final_text(entry, task, None, timeout).await,
                    )
                }
            });
            futures::future::join_all(branches).await
        };

        let succeeded = results
            .iter()
            .filter(|r| r["ok"].as_bool().unwrap_or(false))
            .count();
        json!({
            "results": results,
            "success_count": succeeded,
            "failure_count": pairs.len() - succeeded,
        })
    }
}

// ─── AgentPipelineTool ───────────────────────────────────────────────────────

/// Chain agents: each stage's output feeds the next stage's prompt.
pub struct AgentPipelineTool {
    registry: Arc<FederatedAgentRegistry>,
    timeout: Duration,
}

impl AgentPipelineTool {
    pub fn new(registry: Arc<FederatedAgentRegistry>) -> Self {
        Self {
            registry,
            timeout: REMOTE_DISPATCH_TIMEOUT,
        }
    }
}

#[async_trait]
impl Tool for AgentPipelineTool {
    fn name(&self) -> &str {
        "agent_pipeline"
    }

    fn description(&self) -> &str {
        "Run input through a chain of agents; each stage receives the previous stage's output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["stages", "input"],
            "properties": {
                "stages": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["agent_id"],
                        "properties": {
                            "agent_id": { "type": "string" },
                            "prompt": {
                                "type": "string",
                                "description": "Stage instruction prefixed to the incoming text."
                            }
                        }
                    }
                },
                "input": { "type": "string" }
            }
        })
    }

    async fn execute(&self, args: Value) -> Value {
        let Some(stages) = args.get("stages").and_then(Value::as_array) else {
            return json!({ "error": "invalid arguments: missing 'stages' array" });
        };
        let mut current = match required_str(&args, "input") {
            Ok(v) => v.to_string(),
            Err(e) => return e,
        };

        let mut outputs = Vec::with_capacity(stages.len());
        for (index, stage) in stages.iter().enumerate() {
            let Some(agent_id) = stage.get("agent_id").and_then(Value::as_str) else {
                return json!({ "error": format!("invalid arguments: stage {index} missing agent_id") });
            };
            let message = match stage.get("prompt").and_then(Value::as_str) {
                Some(prompt) => format!("{prompt}\n\n{current}"),
                None => current.clone(),
            };
            let entry = self.registry.get(agent_id);
            match collect_final_text(entry, &message, None, self.timeout).await {
                Ok(output) => {
                    outputs.push(json!({ "agent_id": agent_id, "output": output.clone() }));
                    current = output;
                }
                Err(error) => {
                    return json!({
                        "error": error,
                        "failed_stage": index,
                        "agent_id": agent_id,
                        "stages": outputs,
                    });
                }
            }
        }
        json!({ "output": current, "stages": outputs })
    }
}

// ─── AgentBroadcastTool ──────────────────────────────────────────────────────

/// Send one message to many agents in parallel.
pub struct AgentBroadcastTool {
    registry: Arc<FederatedAgentRegistry>,
    timeout: Duration,
}

impl AgentBroadcastTool {
    pub fn new(registry: Arc<FederatedAgentRegistry>) -> Self {
        Self {
            registry,
            timeout: REMOTE_DISPATCH_TIMEOUT,
        }
    }
}

#[async_trait]
impl Tool for AgentBroadcastTool {
    fn name(&self) -> &str {
        "agent_broadcast"
    }

    fn description(&self) -> &str {
        "Send the same message to several agents at once and collect every answer."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["agent_ids", "message"],
            "properties": {
                "agent_ids": { "type": "array", "items": { "type": "string" } },
                "message": { "type": "string" }
            }
        })
    }

    async fn execute(&self, args: Value) -> Value {
        let Some(ids) = args.get("agent_ids").and_then(Value::as_array) else {
            return json!({ "error": "invalid arguments: missing 'agent_ids' array" });
        };
        let agent_ids: Vec<String> = ids
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        let message = match required_str(&args, "message") {
            Ok(v) => v.to_string(),
            Err(e) => return e,
        };

        let branches = agent_ids.iter().map(|agent_id| {
            let entry = self.registry.get(agent_id);
            let message = message.clone();
            let timeout = self.timeout;
            async move {
                branch_result(
                    agent_id,
                    collect_final_text(entry, &message, None, timeout).await,
                )
            }
        });
        let results = futures::future::join_all(branches).await;
        json!({ "results": results })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentDefinition, AgentManager};
    use crate::gateway::InProcessBroker;
    use crate::llm::{LLMService, testing::ScriptedProvider};
    use crate::orchestration::registry::AgentRegistry;
    use crate::session::SessionStore;
    use crate::tools::{PolicyEngine, ToolRegistry};
    use std::sync::Mutex;

    async fn registry_with_agents(
        dir: &tempfile::TempDir,
        agents: Vec<(&str, Vec<&str>)>,
    ) -> Arc<FederatedAgentRegistry> {
        let local = Arc::new(AgentRegistry::new());
        for (id, replies) in agents {
            let manager = Arc::new(AgentManager::new(
                AgentDefinition {
                    id: id.to_string(),
                    name: id.to_string(),
                    ..Default::default()
                },
                dir.path(),
                Arc::new(SessionStore::new(dir.path())),
                Arc::new(Mutex::new(ToolRegistry::new())),
                Arc::new(PolicyEngine::allow_all()),
                None,
            ));
            let turns = replies.into_iter().map(ScriptedProvider::text_turn).collect();
            let llm = Arc::new(LLMService::new(
                vec![ScriptedProvider::new("mock", turns).into_arc()],
                vec![],
            ));
            manager.init(llm).await.unwrap();
            local.register(manager);
        }
        Arc::new(FederatedAgentRegistry::new(
            local,
            Arc::new(InProcessBroker::new()),
        ))
    }

    #[tokio::test]
    async fn spawn_returns_final_text() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_agents(&dir, vec![("worker", vec!["task done"])]).await;
        let tool = AgentSpawnTool::new(registry);

        let out = tool
            .execute(json!({ "agent_id": "worker", "task": "do the thing" }))
            .await;
        assert_eq!(out["ok"], json!(true));
        assert_eq!(out["output"], json!("task done"));
    }

    #[tokio::test]
    async fn supervise_parallel_reports_mixed_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        // "broken" has no scripted replies, so its dispatch errors.
        let registry = registry_with_agents(
            &dir,
            vec![("ok-agent", vec!["fine"]), ("broken", vec![])],
        )
        .await;
        let tool = AgentSuperviseTool::new(registry);

        let out = tool
            .execute(json!({
                "tasks": [
                    { "agent_id": "ok-agent", "task": "t1" },
                    { "agent_id": "broken", "task": "t2" }
                ],
                "mode": "parallel"
            }))
            .await;

        assert_eq!(out["success_count"], json!(1));
        assert_eq!(out["failure_count"], json!(1));
        let results = out["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn pipeline_chains_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_agents(
            &dir,
            vec![("upper", vec!["STAGE ONE OUT"]), ("final", vec!["finished"])],
        )
        .await;
        let tool = AgentPipelineTool::new(registry);

        let out = tool
            .execute(json!({
                "stages": [
                    { "agent_id": "upper", "prompt": "uppercase this" },
                    { "agent_id": "final" }
                ],
                "input": "raw text"
            }))
            .await;

        assert_eq!(out["output"], json!("finished"));
        assert_eq!(out["stages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn broadcast_collects_all_answers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_agents(
            &dir,
            vec![("a", vec!["answer-a"]), ("b", vec!["answer-b"])],
        )
        .await;
        let tool = AgentBroadcastTool::new(registry);

        let out = tool
            .execute(json!({ "agent_ids": ["a", "b"], "message": "ping" }))
            .await;
        let results = out["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r["ok"] == json!(true)));
    }

    #[tokio::test]
    async fn missing_arguments_are_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_agents(&dir, vec![]).await;
        let tool = AgentSpawnTool::new(registry);
        let out = tool.execute(json!({ "agent_id": "x" })).await;
        assert!(out["error"].as_str().unwrap().contains("task"));
    }
}
