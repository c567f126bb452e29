pub mod memory_tools;
pub mod policy;
pub mod registry;
pub mod traits;

pub use memory_tools::{MemoryAppendTool, MemorySearchTool};
pub use policy::{PolicyConfig, PolicyEngine};
pub use registry::ToolRegistry;
pub use traits::{Tool, ToolSource, required_str, validation_error};
