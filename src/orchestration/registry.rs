//! Local and federated agent registries.
//!
//! The local registry holds this node's `AgentManager`s. The federated
//! wrapper answers `get` with the local entry when present and otherwise
//! hands back a cached remote entry that dispatches over the broker via a
//! reply inbox. `has`/`get_all`/`get_available` stay local-only so
//! diagnostics reflect this node.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_stream::stream;
use async_trait::async_trait;

use crate::{
    agent::{AgentEvent, AgentManager, AgentStatus, EventStream},
    error::Result,
    gateway::{AgentMessage, Broker, EnvelopeType},
};

/// Default deadline for a remote dispatch.
pub const REMOTE_DISPATCH_TIMEOUT: Duration = Duration::from_secs(120);

// ─── AgentEntry ──────────────────────────────────────────────────────────────

/// The dispatch capability shared by local managers and remote proxies.
#[async_trait]
pub trait AgentEntry: Send + Sync {
    fn id(&self) -> String;
    fn status(&self) -> AgentStatus;
    async fn dispatch(&self, message: &str, session_id: Option<String>) -> Result<EventStream>;
}

#[async_trait]
impl AgentEntry for AgentManager {
    fn id(&self) -> String {
        self.agent_id().to_string()
    }

    fn status(&self) -> AgentStatus {
        AgentManager::status(self)
    }

    async fn dispatch(&self, message: &str, session_id: Option<String>) -> Result<EventStream> {
        AgentManager::dispatch(self, message, session_id).await
    }
}

// ─── AgentRegistry (local) ───────────────────────────────────────────────────

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentManager>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, manager: Arc<AgentManager>) {
        write(&self.agents).insert(manager.agent_id().to_string(), manager);
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentManager>> {
        read(&self.agents).get(agent_id).cloned()
    }

    pub fn has(&self, agent_id: &str) -> bool {
        read(&self.agents).contains_key(agent_id)
    }

    pub fn get_all(&self) -> Vec<Arc<AgentManager>> {
        read(&self.agents).values().cloned().collect()
    }

    /// Agents the router may deliver to (READY or RUNNING).
    pub fn get_available(&self) -> Vec<Arc<AgentManager>> {
        read(&self.agents)
            .values()
            .filter(|m| m.status().is_available())
            .cloned()
            .collect()
    }

    pub fn remove(&self, agent_id: &str) -> Option<Arc<AgentManager>> {
        write(&self.agents).remove(agent_id)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

// ─── FederatedAgentRegistry ──────────────────────────────────────────────────

/// Local-first registry with remote-dispatch fallback.
pub struct FederatedAgentRegistry {
    local: Arc<AgentRegistry>,
    broker: Arc<dyn Broker>,
    /// Remote entries hold no per-call state and may be recreated freely.
    remote_cache: Mutex<HashMap<String, Arc<RemoteAgentRegistryEntry>>>,
    timeout: Duration,
}

impl FederatedAgentRegistry {
    pub fn new(local: Arc<AgentRegistry>, broker: Arc<dyn Broker>) -> Self {
        Self {
            local,
            broker,
            remote_cache: Mutex::new(HashMap::new()),
            timeout: REMOTE_DISPATCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local(&self) -> &AgentRegistry {
        &self.local
    }

    /// Local entry when present, otherwise a (cached) remote proxy.
    pub fn get(&self, agent_id: &str) -> Arc<dyn AgentEntry> {
        if let Some(local) = self.local.get(agent_id) {
            return local;
        }
        let mut cache = match self.remote_cache.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        cache
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                Arc::new(RemoteAgentRegistryEntry {
                    agent_id: agent_id.to_string(),
                    broker: self.broker.clone(),
                    timeout: self.timeout,
                })
            })
            .clone()
    }

    pub fn has(&self, agent_id: &str) -> bool {
        self.local.has(agent_id)
    }

    pub fn get_all(&self) -> Vec<Arc<AgentManager>> {
        self.local.get_all()
    }

    pub fn get_available(&self) -> Vec<Arc<AgentManager>> {
        self.local.get_available()
    }
}

// ─── RemoteAgentRegistryEntry ────────────────────────────────────────────────

/// Proxy that dispatches to an agent hosted on another node.
pub struct RemoteAgentRegistryEntry {
    agent_id: String,
    broker: Arc<dyn Broker>,
    timeout: Duration,
}

#[async_trait]
impl AgentEntry for RemoteAgentRegistryEntry {
    fn id(&self) -> String {
        self.agent_id.clone()
    }

    /// Remote liveness is unknown; the proxy reports READY and lets the
    /// dispatch timeout decide.
    fn status(&self) -> AgentStatus {
        AgentStatus::Ready
    }

    async fn dispatch(&self, message: &str, session_id: Option<String>) -> Result<EventStream> {
        // Subscribe to the reply inbox strictly before publishing so no
        // response can slip past the race.
        let inbox = self.broker.new_inbox();
        let mut replies = self.broker.subscribe(&inbox).await?;

        let request = AgentMessage::task_request(
            "orchestrator://local",
            &self.agent_id,
            message,
            session_id,
        )
        .with_reply_to(inbox);
        self.broker
            .publish(&format!("agent.{}.inbox", self.agent_id), &request)
            .await?;

        let deadline = self.timeout;
        let agent_id = self.agent_id.clone();
        let out = stream! {
            loop {
                let next = tokio::time::timeout(deadline, replies.recv()).await;
                match next {
                    Err(_) => {
                        yield AgentEvent::Error {
                            error: format!(
                                "remote dispatch to '{agent_id}' timed out after {deadline:?}"
                            ),
                        };
                        break;
                    }
                    Ok(None) => {
                        yield AgentEvent::Error {
                            error: format!("reply inbox for '{agent_id}' closed"),
                        };
                        break;
                    }
                    Ok(Some(delivery)) => match delivery.message.message_type {
                        EnvelopeType::TaskResponse => {
                            match serde_json::from_value::<AgentEvent>(
                                delivery.message.data["event"].clone(),
                            ) {
                                Ok(event) => yield event,
                                Err(e) => {
                                    yield AgentEvent::Error {
                                        error: format!("malformed remote event: {e}"),
                                    };
                                    break;
                                }
                            }
                        }
                        EnvelopeType::TaskDone => break,
                        EnvelopeType::TaskError => {
                            let error = delivery.message.data["error"]
                                .as_str()
                                .unwrap_or("remote error")
                                .to_string();
                            yield AgentEvent::Error { error };
                            break;
                        }
                        _ => continue,
                    },
                }
            }
            // `replies` drops here, unsubscribing on completion and
            // cancellation alike.
        };
        Ok(Box::pin(out))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
