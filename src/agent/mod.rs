pub mod events;
pub mod loop_;
pub mod manager;
pub mod state;

pub use events::{AgentEvent, AssistantContent, EventStream};
pub use loop_::{AgentLoopConfig, agent_loop};
pub use manager::{AgentDefinition, AgentManager, AgentSnapshot};
pub use state::{AgentControlBlock, AgentStatus};
