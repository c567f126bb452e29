pub mod registry;
pub mod router;
pub mod scheduler;
pub mod tools;

pub use registry::{
    AgentEntry, AgentRegistry, FederatedAgentRegistry, REMOTE_DISPATCH_TIMEOUT,
    RemoteAgentRegistryEntry,
};
pub use router::{AgentRouter, Binding, ResolvedBinding};
pub use scheduler::{AgentScheduler, ScheduledTask, TaskPriority};
pub use tools::{
    AgentBroadcastTool, AgentPipelineTool, AgentSendTool, AgentSpawnTool, AgentSuperviseTool,
};
