pub mod chunker;
pub mod hook;
pub mod importance;
pub mod store;
pub mod types;

pub use chunker::{ChunkerConfig, chunk_text};
pub use hook::register_memory_flush;
pub use importance::score_importance;
pub use store::{EpisodicMemoryStore, MemoryStoreConfig};
pub use types::{MatchType, MemoryChunk, MemoryFilters, SearchOptions, SearchResult};
