//! Runtime configuration schema.
//!
//! Every section carries serde defaults so a partial (or missing) config
//! file still yields a complete [`RuntimeConfig`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{agent::AgentDefinition, orchestration::Binding};

fn default_base_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".agentic-os"))
        .unwrap_or_else(|| PathBuf::from(".agentic-os"))
}

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub bind_addr: String,
    pub idempotency_ttl_secs: u64,
    pub auth_token: Option<String>,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8710".to_string(),
            idempotency_ttl_secs: 600,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_concurrent: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// Fallback rotation, by provider name, in order.
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub enabled: bool,
    pub db_file: String,
    pub half_life_days: f64,
    pub vector_weight: f64,
    pub bm25_weight: f64,
    pub mmr_lambda: f64,
    pub embedding_dim: Option<usize>,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            db_file: "memory.db".to_string(),
            half_life_days: 30.0,
            vector_weight: 0.6,
            bm25_weight: 0.4,
            mmr_lambda: 0.7,
            embedding_dim: None,
        }
    }
}

// ─── RuntimeConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub base_path: PathBuf,
    pub gateway: GatewaySection,
    pub scheduler: SchedulerSection,
    pub llm: LlmSection,
    pub memory: MemorySection,
    /// Redis used for multi-node idempotency; in-process store when unset.
    pub redis_url: Option<String>,
    pub agents: Vec<AgentDefinition>,
    pub bindings: Vec<Binding>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            gateway: GatewaySection::default(),
            scheduler: SchedulerSection::default(),
            llm: LlmSection::default(),
            memory: MemorySection::default(),
            redis_url: None,
            agents: Vec::new(),
            bindings: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn memory_store_config(&self) -> crate::memory::MemoryStoreConfig {
        crate::memory::MemoryStoreConfig {
            half_life_days: self.memory.half_life_days,
            vector_weight: self.memory.vector_weight,
            bm25_weight: self.memory.bm25_weight,
            mmr_lambda: self.memory.mmr_lambda,
            embedding_dim: self.memory.embedding_dim,
        }
    }

    pub fn gateway_config(&self) -> crate::gateway::GatewayConfig {
        crate::gateway::GatewayConfig {
            bind_addr: self.gateway.bind_addr.clone(),
            idempotency_ttl: std::time::Duration::from_secs(self.gateway.idempotency_ttl_secs),
            auth_token: self.gateway.auth_token.clone(),
        }
    }
}
