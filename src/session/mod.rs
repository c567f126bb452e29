//! Append-only per-session logs.
//!
//! # File format
//! `sessions/<agentId>/<sessionId>.jsonl` — line 0 is a `session_header`
//! object, subsequent lines are `session_entry` objects, each UTF-8 JSON
//! terminated by `\n`. Blank lines are tolerated on read; any unparseable
//! line makes the whole session unreadable (`SessionCorrupt`).
//!
//! # Concurrency
//! Appends to the same session serialize on a per-session async mutex;
//! distinct sessions write independently.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{
    error::{Result, RuntimeError},
    llm::{ChatMessage, ChatRole, ToolCall},
};

// ─── Line types ──────────────────────────────────────────────────────────────

/// Line 0 of every session file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeader {
    pub session_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One appended conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub timestamp: DateTime<Utc>,
}

impl SessionEntry {
    /// Build an entry from an in-memory message.
    pub fn from_message(message: &ChatMessage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            role: message.role,
            content: message.content.clone(),
            tool_call_id: message.tool_call_id.clone(),
            tool_calls: message.tool_calls.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Reconstruct the in-memory message this entry records.
    pub fn to_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionLine {
    SessionHeader(SessionHeader),
    SessionEntry(SessionEntry),
}

// ─── SessionStore ────────────────────────────────────────────────────────────

/// Owns the persisted session logs under `<base>/sessions/`.
pub struct SessionStore {
    base: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_dir(&self, agent_id: &str) -> PathBuf {
        self.base.join("sessions").join(agent_id)
    }

    fn session_path(&self, agent_id: &str, session_id: &str) -> PathBuf {
        self.session_dir(agent_id).join(format!("{session_id}.jsonl"))
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Create a new session and write its header line.
    pub async fn create_session(
        &self,
        agent_id: &str,
        channel: Option<String>,
    ) -> Result<SessionHeader> {
        let header = SessionHeader {
            session_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            channel,
            created_at: Utc::now(),
        };
        tokio::fs::create_dir_all(self.session_dir(agent_id)).await?;
        let path = self.session_path(agent_id, &header.session_id);
        let line = serde_json::to_string(&SessionLine::SessionHeader(header.clone()))?;
        tokio::fs::write(&path, format!("{line}\n")).await?;
        Ok(header)
    }

    /// Use `session_id` when its log exists, adopt it when it does not, or
    /// mint a fresh session when `None`.
    ///
    /// Adopting a caller-supplied id keeps cross-node dispatches (which name
    /// sessions created elsewhere) appendable locally.
    pub async fn ensure_session(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        channel: Option<String>,
    ) -> Result<SessionHeader> {
        match session_id {
            Some(id) if self.exists(agent_id, id).await => {
                let (header, _) = self.read(agent_id, id).await?;
                Ok(header)
            }
            Some(id) => {
                let header = SessionHeader {
                    session_id: id.to_string(),
                    agent_id: agent_id.to_string(),
                    channel,
                    created_at: Utc::now(),
                };
                tokio::fs::create_dir_all(self.session_dir(agent_id)).await?;
                let line = serde_json::to_string(&SessionLine::SessionHeader(header.clone()))?;
                tokio::fs::write(self.session_path(agent_id, id), format!("{line}\n")).await?;
                Ok(header)
            }
            None => self.create_session(agent_id, channel).await,
        }
    }

    pub async fn exists(&self, agent_id: &str, session_id: &str) -> bool {
        tokio::fs::try_exists(self.session_path(agent_id, session_id))
            .await
            .unwrap_or(false)
    }

    /// Append one entry; appends to the same session are strictly monotonic.
    pub async fn append(
        &self,
        agent_id: &str,
        session_id: &str,
        entry: SessionEntry,
    ) -> Result<()> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let path = self.session_path(agent_id, session_id);
        let line = serde_json::to_string(&SessionLine::SessionEntry(entry))?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Append an in-memory message as a fresh entry.
    pub async fn append_message(
        &self,
        agent_id: &str,
        session_id: &str,
        message: &ChatMessage,
    ) -> Result<()> {
        self.append(agent_id, session_id, SessionEntry::from_message(message))
            .await
    }

    /// Read the header and all entries of a session.
    pub async fn read(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<(SessionHeader, Vec<SessionEntry>)> {
        let path = self.session_path(agent_id, session_id);
        let raw = tokio::fs::read_to_string(&path).await?;
        parse_session(&path, &raw)
    }

    /// Reconstruct the conversation messages in append order.
    pub async fn replay(&self, agent_id: &str, session_id: &str) -> Result<Vec<ChatMessage>> {
        let (_, entries) = self.read(agent_id, session_id).await?;
        Ok(entries.iter().map(SessionEntry::to_message).collect())
    }

    /// All session ids recorded for `agent_id`.
    pub async fn list_sessions(&self, agent_id: &str) -> Result<Vec<String>> {
        let dir = self.session_dir(agent_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".jsonl") {
                sessions.push(id.to_string());
            }
        }
        sessions.sort();
        Ok(sessions)
    }

    /// Fork a session into a new one.
    ///
    /// Entries up to and including `at_entry_id` (or the whole log when
    /// `None`) are copied into the fork with fresh ids; each copied entry's
    /// `parent_id` points back at the entry it was forked from.
    pub async fn fork(
        &self,
        agent_id: &str,
        session_id: &str,
        at_entry_id: Option<&str>,
    ) -> Result<SessionHeader> {
        let (source_header, entries) = self.read(agent_id, session_id).await?;
        let fork_header = self
            .create_session(agent_id, source_header.channel.clone())
            .await?;

        for entry in &entries {
            let copied = SessionEntry {
                id: Uuid::new_v4().to_string(),
                parent_id: Some(entry.id.clone()),
                role: entry.role,
                content: entry.content.clone(),
                tool_call_id: entry.tool_call_id.clone(),
                tool_calls: entry.tool_calls.clone(),
                timestamp: entry.timestamp,
            };
            self.append(agent_id, &fork_header.session_id, copied)
                .await?;
            if at_entry_id == Some(entry.id.as_str()) {
                break;
            }
        }
        Ok(fork_header)
    }
}

fn parse_session(path: &Path, raw: &str) -> Result<(SessionHeader, Vec<SessionEntry>)> {
    let mut header: Option<SessionHeader> = None;
    let mut entries = Vec::new();

    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: SessionLine = serde_json::from_str(line).map_err(|e| {
            RuntimeError::SessionCorrupt(format!(
                "{}: line {}: {e}",
                path.display(),
                line_no + 1
            ))
        })?;
        match parsed {
            SessionLine::SessionHeader(h) if header.is_none() => header = Some(h),
            SessionLine::SessionHeader(_) => {
                return Err(RuntimeError::SessionCorrupt(format!(
                    "{}: duplicate session_header at line {}",
                    path.display(),
                    line_no + 1
                )));
            }
            SessionLine::SessionEntry(e) => entries.push(e),
        }
    }

    let header = header.ok_or_else(|| {
        RuntimeError::SessionCorrupt(format!("{}: missing session_header", path.display()))
    })?;
    Ok((header, entries))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
