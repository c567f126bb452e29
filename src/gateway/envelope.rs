//! The `AgentMessage` gateway envelope.
//!
//! Every payload crossing the broker is wrapped in this envelope, which
//! carries routing (`source`/`target` URIs), correlation, idempotency, and
//! free-form metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeType {
    #[serde(rename = "task.request")]
    TaskRequest,
    #[serde(rename = "task.response")]
    TaskResponse,
    #[serde(rename = "task.done")]
    TaskDone,
    #[serde(rename = "task.error")]
    TaskError,
    #[serde(rename = "system.dlq")]
    SystemDlq,
}

fn default_specversion() -> String {
    "1.0".to_string()
}

/// The gateway envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: String,
    #[serde(default = "default_specversion")]
    pub specversion: String,
    #[serde(rename = "type")]
    pub message_type: EnvelopeType,
    /// `agent://<id>` or `orchestrator://local`.
    pub source: String,
    pub target: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl AgentMessage {
    pub fn new(
        message_type: EnvelopeType,
        source: impl Into<String>,
        target: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            specversion: default_specversion(),
            message_type,
            source: source.into(),
            target: target.into(),
            time: Utc::now(),
            data,
            correlation_id: None,
            causation_id: None,
            idempotency_key: None,
            reply_to: None,
            metadata: HashMap::new(),
        }
    }

    /// A `task.request` targeting `agent://<agent_id>`.
    pub fn task_request(
        source: impl Into<String>,
        agent_id: &str,
        text: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        let mut data = serde_json::json!({ "text": text.into() });
        if let Some(session) = session_id {
            data["sessionId"] = Value::String(session);
        }
        Self::new(
            EnvelopeType::TaskRequest,
            source,
            format!("agent://{agent_id}"),
            data,
        )
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// The broker idempotency key: `idempotency_key ?? id`.
    pub fn dedup_key(&self) -> &str {
        self.idempotency_key.as_deref().unwrap_or(&self.id)
    }

    /// The ordering lane: `source:target:correlationId`.
    pub fn lane_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source,
            self.target,
            self.correlation_id.as_deref().unwrap_or("-")
        )
    }

    /// The agent id addressed by `target`, when it is an `agent://` URI.
    pub fn target_agent(&self) -> Option<&str> {
        self.target.strip_prefix("agent://")
    }

    /// Inbox subject for the targeted agent.
    pub fn inbox_subject(&self) -> Option<String> {
        self.target_agent().map(|id| format!("agent.{id}.inbox"))
    }
}
