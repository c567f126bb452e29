//! Idempotency check-and-set stores.
//!
//! The gateway dedupes every ingress message by `idempotencyKey ?? id`
//! within a TTL. The in-process store is the default; the Redis adaptor
//! (SET NX EX) shares the contract for multi-node deployments.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::error::{Result, RuntimeError};

/// Check-and-set contract: returns `true` when the key was fresh (claimed),
/// `false` when it was already seen inside its TTL.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// `true` when the backing store is reachable.
    async fn healthy(&self) -> bool {
        true
    }
}

// ─── InMemoryIdempotencyStore ────────────────────────────────────────────────

/// TTL map held in process.
pub struct InMemoryIdempotencyStore {
    seen: Mutex<HashMap<String, Instant>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        seen.retain(|_, expires| *expires > now);
        if seen.contains_key(key) {
            return Ok(false);
        }
        seen.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

// ─── RedisIdempotencyStore ───────────────────────────────────────────────────

/// Redis adaptor: `SET key 1 NX EX ttl`.
pub struct RedisIdempotencyStore {
    manager: redis::aio::ConnectionManager,
    /// Namespace prefix so several runtimes can share one Redis.
    prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RuntimeError::Idempotency(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| RuntimeError::Idempotency(e.to_string()))?;
        Ok(Self {
            manager,
            prefix: "gateway:idem:".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn check_and_set(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let namespaced = format!("{}{key}", self.prefix);
        let outcome: Option<String> = redis::cmd("SET")
            .arg(&namespaced)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| RuntimeError::Idempotency(e.to_string()))?;
        // SET NX returns OK when the key was claimed, nil when it existed.
        Ok(outcome.is_some())
    }

    async fn healthy(&self) -> bool {
        let mut conn = self.manager.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
