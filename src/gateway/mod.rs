pub mod breaker;
pub mod broker;
pub mod envelope;
pub mod idempotency;
pub mod lane;
pub mod server;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use broker::{Broker, Delivery, InProcessBroker, RetentionPolicy, StreamConfig, Subscription};
pub use envelope::{AgentMessage, EnvelopeType};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore};
pub use lane::LaneQueue;
pub use server::{GatewayConfig, GatewayServer};
