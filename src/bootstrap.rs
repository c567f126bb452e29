//! Composition root: build the broker, gateway, registries, and wire every
//! configured agent.

use std::sync::{Arc, Mutex};

use crate::{
    agent::{AgentDefinition, AgentManager},
    config::RuntimeConfig,
    error::Result,
    gateway::{
        Broker, GatewayServer, IdempotencyStore, InMemoryIdempotencyStore, InProcessBroker,
        RedisIdempotencyStore, StreamConfig,
    },
    llm::{LLMProvider, LLMService},
    memory::EpisodicMemoryStore,
    orchestration::{
        AgentBroadcastTool, AgentPipelineTool, AgentRegistry, AgentRouter, AgentScheduler,
        AgentSendTool, AgentSpawnTool, AgentSuperviseTool, FederatedAgentRegistry,
    },
    session::SessionStore,
    tools::{MemoryAppendTool, MemorySearchTool, PolicyEngine, ToolRegistry},
};

/// Everything a running node is made of.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub broker: Arc<dyn Broker>,
    pub gateway: Arc<GatewayServer>,
    pub session_store: Arc<SessionStore>,
    pub memory: Option<Arc<EpisodicMemoryStore>>,
    pub scheduler: Arc<AgentScheduler>,
    pub local_registry: Arc<AgentRegistry>,
    pub registry: Arc<FederatedAgentRegistry>,
    pub router: Arc<AgentRouter>,
    providers: Vec<Arc<dyn LLMProvider>>,
}

/// Builder that assembles a [`Runtime`] from configuration.
pub struct AppBootstrap {
    config: RuntimeConfig,
    providers: Vec<Arc<dyn LLMProvider>>,
    broker: Option<Arc<dyn Broker>>,
}

impl AppBootstrap {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            broker: None,
        }
    }

    /// Provider adaptors are linked by the embedding application.
    pub fn with_providers(mut self, providers: Vec<Arc<dyn LLMProvider>>) -> Self {
        self.providers = providers;
        self
    }

    /// Override the broker (e.g. a networked backend).
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Build the runtime and wire every configured agent.
    pub async fn build(self) -> Result<Runtime> {
        let config = self.config;
        tokio::fs::create_dir_all(&config.base_path).await?;

        let broker: Arc<dyn Broker> = self
            .broker
            .unwrap_or_else(|| Arc::new(InProcessBroker::new()));
        for stream in [
            StreamConfig::agent_tasks(),
            StreamConfig::agent_events(),
            StreamConfig::system(),
        ] {
            broker.ensure_stream(stream).await?;
        }

        let idempotency: Arc<dyn IdempotencyStore> = match &config.redis_url {
            Some(url) => match RedisIdempotencyStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    log::warn!("redis unavailable ({e}), using in-process idempotency");
                    Arc::new(InMemoryIdempotencyStore::new())
                }
            },
            None => Arc::new(InMemoryIdempotencyStore::new()),
        };

        let gateway = GatewayServer::new(broker.clone(), idempotency, config.gateway_config());
        let session_store = Arc::new(SessionStore::new(&config.base_path));

        let memory = if config.memory.enabled {
            let db_path = config.base_path.join(&config.memory.db_file);
            let store = EpisodicMemoryStore::open(
                &db_path.display().to_string(),
                config.memory_store_config(),
            )?;
            Some(Arc::new(store))
        } else {
            None
        };

        let scheduler = AgentScheduler::new(config.scheduler.max_concurrent);
        let local_registry = Arc::new(AgentRegistry::new());
        let registry = Arc::new(FederatedAgentRegistry::new(
            local_registry.clone(),
            broker.clone(),
        ));
        let router = Arc::new(AgentRouter::new(config.bindings.clone()));

        if self.providers.is_empty() {
            log::warn!("no LLM providers wired; dispatches will fail until one is linked");
        }

        let runtime = Runtime {
            config,
            broker,
            gateway,
            session_store,
            memory,
            scheduler,
            local_registry,
            registry,
            router,
            providers: self.providers,
        };

        for definition in runtime.config.agents.clone() {
            runtime.wire_agent(definition).await?;
        }
        Ok(runtime)
    }
}

impl Runtime {
    /// Wire one agent: tools, policy, manager init, inbox subscription, and
    /// registry membership.
    pub async fn wire_agent(&self, definition: AgentDefinition) -> Result<Arc<AgentManager>> {
        let mut tools = ToolRegistry::new();
        if let Some(memory) = &self.memory {
            tools.register(Arc::new(MemoryAppendTool::new(
                memory.clone(),
                definition.id.clone(),
            )));
            tools.register(Arc::new(MemorySearchTool::new(
                memory.clone(),
                definition.id.clone(),
            )));
        }
        tools.register(Arc::new(AgentSpawnTool::new(self.registry.clone())));
        tools.register(Arc::new(AgentSendTool::new(self.registry.clone())));
        tools.register(Arc::new(AgentSuperviseTool::new(self.registry.clone())));
        tools.register(Arc::new(AgentPipelineTool::new(self.registry.clone())));
        tools.register(Arc::new(AgentBroadcastTool::new(self.registry.clone())));

        let policy = Arc::new(PolicyEngine::new(&definition.policy));
        let agent_id = definition.id.clone();
        let manager = Arc::new(AgentManager::new(
            definition,
            &self.config.base_path,
            self.session_store.clone(),
            Arc::new(Mutex::new(tools)),
            policy,
            self.memory.clone(),
        ));

        let llm = Arc::new(LLMService::new(
            self.providers.clone(),
            self.config.llm.fallbacks.clone(),
        ));
        manager.init(llm).await?;

        let consumer_id = manager
            .subscribe_inbox(self.broker.clone(), self.scheduler.clone())
            .await?;
        self.gateway
            .register_agent_consumer(&agent_id, "AGENT_TASKS", consumer_id);

        self.local_registry.register(manager.clone());
        Ok(manager)
    }

    /// Start serving the gateway; returns the bound address.
    pub async fn start(&self) -> Result<std::net::SocketAddr> {
        self.gateway.start().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
