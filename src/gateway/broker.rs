//! Durable publish/subscribe contract and the in-process implementation.
//!
//! The [`Broker`] trait captures what the gateway needs from a messaging
//! backbone: named streams with retention policies, bounded redelivery with
//! an ack deadline, a max-deliveries advisory, ephemeral reply inboxes, and
//! consumer pause/resume. The in-process implementation ships in-tree; a
//! networked backend slots in behind the same trait.
//!
//! # Streams
//! - `WorkQueue`: each message is owned by one consumer at a time and
//!   removed on ack; unacked messages are redelivered after `ack_wait`, and
//!   after `max_deliver` attempts an advisory is published on
//!   `advisory.max_deliveries.<stream>`.
//! - `Interest`: fan-out to the consumers present at publish time.
//! - `Limits`: fan-out plus retained copies pruned by `max_age`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};

use super::envelope::AgentMessage;

/// Subject prefix for max-deliveries advisories.
pub const ADVISORY_PREFIX: &str = "advisory.max_deliveries";

// ─── Stream configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    WorkQueue,
    Interest,
    Limits,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub max_deliver: u32,
    pub ack_wait: Duration,
    pub max_age: Option<Duration>,
}

impl StreamConfig {
    /// `AGENT_TASKS`: agent inboxes, delivered-once-consumed.
    pub fn agent_tasks() -> Self {
        Self {
            name: "AGENT_TASKS".into(),
            subjects: vec!["agent.*.inbox".into()],
            retention: RetentionPolicy::WorkQueue,
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
            max_age: None,
        }
    }

    /// `AGENT_EVENTS`: the agent event bus.
    pub fn agent_events() -> Self {
        Self {
            name: "AGENT_EVENTS".into(),
            subjects: vec!["agent.events.>".into()],
            retention: RetentionPolicy::Interest,
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
            max_age: None,
        }
    }

    /// `SYSTEM`: system subjects with 7-day retention.
    pub fn system() -> Self {
        Self {
            name: "SYSTEM".into(),
            subjects: vec!["system.>".into()],
            retention: RetentionPolicy::Limits,
            max_deliver: 3,
            ack_wait: Duration::from_secs(30),
            max_age: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

// ─── Delivery & Subscription ─────────────────────────────────────────────────

/// One message handed to a subscriber.
pub struct Delivery {
    pub subject: String,
    pub message: AgentMessage,
    /// 1-based delivery attempt for workqueue streams, 1 otherwise.
    pub deliveries: u32,
    ack: Option<Box<dyn FnOnce() + Send>>,
}

impl Delivery {
    /// Acknowledge; a no-op on non-workqueue deliveries.
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            ack();
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("deliveries", &self.deliveries)
            .finish()
    }
}

/// A live subscription; dropping it unsubscribes.
pub struct Subscription {
    pub id: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next delivery; `None` when the broker side closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

// ─── Broker trait ────────────────────────────────────────────────────────────

#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently create a stream.
    async fn ensure_stream(&self, config: StreamConfig) -> Result<()>;

    /// Publish onto a subject (stream-backed or ephemeral).
    async fn publish(&self, subject: &str, message: &AgentMessage) -> Result<()>;

    /// Ephemeral subscription (reply inboxes, advisories).
    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    /// Durable consumer on a stream, filtered by subject.
    async fn consume(&self, stream: &str, subject: &str) -> Result<Subscription>;

    async fn pause_consumer(&self, stream: &str, consumer_id: u64) -> Result<()>;

    async fn resume_consumer(&self, stream: &str, consumer_id: u64) -> Result<()>;

    /// Allocate a unique reply-inbox subject.
    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", Uuid::new_v4().simple())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

// ─── Subject matching ────────────────────────────────────────────────────────

/// NATS-style wildcard match: `*` is one token, `>` matches the remainder.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ─── In-process implementation ───────────────────────────────────────────────

struct StoredMessage {
    seq: u64,
    subject: String,
    message: AgentMessage,
    deliveries: u32,
    /// (consumer id, ack deadline) while an attempt is outstanding.
    assigned: Option<(u64, Instant)>,
    stored_at: Instant,
}

struct ConsumerState {
    id: u64,
    filter: String,
    tx: mpsc::UnboundedSender<Delivery>,
    paused: bool,
}

struct StreamState {
    config: StreamConfig,
    messages: Vec<StoredMessage>,
    next_seq: u64,
    consumers: Vec<ConsumerState>,
}

struct EphemeralSub {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct BrokerInner {
    streams: HashMap<String, StreamState>,
    ephemeral: Vec<EphemeralSub>,
    next_id: u64,
    ticker_started: bool,
}

/// Tokio-backed broker used for single-node deployments and tests.
pub struct InProcessBroker {
    inner: Arc<Mutex<BrokerInner>>,
    tick_interval: Duration,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::with_tick_interval(Duration::from_millis(250))
    }

    /// Redelivery scan cadence; tests shrink this.
    pub fn with_tick_interval(tick_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                streams: HashMap::new(),
                ephemeral: Vec::new(),
                next_id: 1,
                ticker_started: false,
            })),
            tick_interval,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerInner> {
        lock_inner(&self.inner)
    }

    /// Start the redelivery/pruning ticker on first use.
    fn ensure_ticker(&self) {
        let mut inner = self.lock();
        if inner.ticker_started {
            return;
        }
        inner.ticker_started = true;
        drop(inner);

        let inner = self.inner.clone();
        let interval = self.tick_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                tick(&inner);
            }
        });
    }
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_inner(inner: &Arc<Mutex<BrokerInner>>) -> std::sync::MutexGuard<'_, BrokerInner> {
    match inner.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// One redelivery/pruning sweep.
fn tick(inner: &Arc<Mutex<BrokerInner>>) {
    let now = Instant::now();
    let mut advisories: Vec<(String, AgentMessage)> = Vec::new();
    {
        let mut guard = lock_inner(inner);
        let mut exhausted: Vec<(String, u64)> = Vec::new();

        for (stream_name, stream) in guard.streams.iter_mut() {
            match stream.config.retention {
                RetentionPolicy::WorkQueue => {
                    for msg in stream.messages.iter_mut() {
                        if let Some((consumer, deadline)) = msg.assigned {
                            if deadline <= now {
                                if msg.deliveries >= stream.config.max_deliver {
                                    log::warn!(
                                        "broker: message seq {} on '{}' exhausted {} deliveries (last consumer {})",
                                        msg.seq, stream_name, msg.deliveries, consumer
                                    );
                                    let mut advisory = msg.message.clone();
                                    advisory.metadata.insert(
                                        "x-advisory-stream".into(),
                                        serde_json::json!(stream_name),
                                    );
                                    advisory.metadata.insert(
                                        "x-advisory-consumer".into(),
                                        serde_json::json!(consumer.to_string()),
                                    );
                                    advisory.metadata.insert(
                                        "x-advisory-sequence".into(),
                                        serde_json::json!(msg.seq),
                                    );
                                    advisories.push((
                                        format!("{ADVISORY_PREFIX}.{stream_name}"),
                                        advisory,
                                    ));
                                    exhausted.push((stream_name.clone(), msg.seq));
                                } else {
                                    msg.assigned = None;
                                }
                            }
                        }
                    }
                }
                RetentionPolicy::Limits => {
                    if let Some(max_age) = stream.config.max_age {
                        stream
                            .messages
                            .retain(|m| now.duration_since(m.stored_at) < max_age);
                    }
                }
                RetentionPolicy::Interest => {}
            }
        }

        for (stream_name, seq) in exhausted {
            if let Some(stream) = guard.streams.get_mut(&stream_name) {
                stream.messages.retain(|m| m.seq != seq);
            }
        }

        let names: Vec<String> = guard.streams.keys().cloned().collect();
        for name in names {
            try_deliver(&mut guard, inner, &name);
        }
    }

    let guard = lock_inner(inner);
    for (subject, message) in advisories {
        deliver_ephemeral(&guard, &subject, &message);
    }
}

/// Hand unassigned workqueue messages to matching consumers.
fn try_deliver(guard: &mut BrokerInner, inner: &Arc<Mutex<BrokerInner>>, stream_name: &str) {
    let Some(stream) = guard.streams.get_mut(stream_name) else {
        return;
    };
    if stream.config.retention != RetentionPolicy::WorkQueue {
        return;
    }
    let ack_wait = stream.config.ack_wait;
    let mut dead_consumers: Vec<u64> = Vec::new();

    for msg in stream.messages.iter_mut() {
        if msg.assigned.is_some() {
            continue;
        }
        let candidate = stream.consumers.iter().find(|c| {
            !c.paused && !dead_consumers.contains(&c.id) && subject_matches(&c.filter, &msg.subject)
        });
        let Some(consumer) = candidate else { continue };

        let delivery = Delivery {
            subject: msg.subject.clone(),
            message: msg.message.clone(),
            deliveries: msg.deliveries + 1,
            ack: Some(make_ack(inner.clone(), stream_name.to_string(), msg.seq)),
        };
        if consumer.tx.send(delivery).is_ok() {
            msg.deliveries += 1;
            msg.assigned = Some((consumer.id, Instant::now() + ack_wait));
        } else {
            dead_consumers.push(consumer.id);
        }
    }

    stream
        .consumers
        .retain(|c| !dead_consumers.contains(&c.id));
}

fn make_ack(inner: Arc<Mutex<BrokerInner>>, stream: String, seq: u64) -> Box<dyn FnOnce() + Send> {
    Box::new(move || {
        let mut guard = lock_inner(&inner);
        if let Some(state) = guard.streams.get_mut(&stream) {
            state.messages.retain(|m| m.seq != seq);
        }
    })
}

fn deliver_ephemeral(guard: &BrokerInner, subject: &str, message: &AgentMessage) {
    for sub in &guard.ephemeral {
        if subject_matches(&sub.pattern, subject) {
            let _ = sub.tx.send(Delivery {
                subject: subject.to_string(),
                message: message.clone(),
                deliveries: 1,
                ack: None,
            });
        }
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn ensure_stream(&self, config: StreamConfig) -> Result<()> {
        self.ensure_ticker();
        let mut inner = self.lock();
        inner
            .streams
            .entry(config.name.clone())
            .or_insert_with(|| StreamState {
                config,
                messages: Vec::new(),
                next_seq: 1,
                consumers: Vec::new(),
            });
        Ok(())
    }

    async fn publish(&self, subject: &str, message: &AgentMessage) -> Result<()> {
        self.ensure_ticker();
        let mut inner = self.lock();

        deliver_ephemeral(&inner, subject, message);

        let stream_name = inner
            .streams
            .iter()
            .find(|(_, s)| s.config.subjects.iter().any(|p| subject_matches(p, subject)))
            .map(|(name, _)| name.clone());

        if let Some(name) = stream_name {
            let stream = inner
                .streams
                .get_mut(&name)
                .ok_or_else(|| RuntimeError::Broker(format!("stream '{name}' vanished")))?;
            match stream.config.retention {
                RetentionPolicy::WorkQueue => {
                    let seq = stream.next_seq;
                    stream.next_seq += 1;
                    stream.messages.push(StoredMessage {
                        seq,
                        subject: subject.to_string(),
                        message: message.clone(),
                        deliveries: 0,
                        assigned: None,
                        stored_at: Instant::now(),
                    });
                    try_deliver(&mut inner, &self.inner, &name);
                }
                RetentionPolicy::Interest | RetentionPolicy::Limits => {
                    if stream.config.retention == RetentionPolicy::Limits {
                        let seq = stream.next_seq;
                        stream.next_seq += 1;
                        stream.messages.push(StoredMessage {
                            seq,
                            subject: subject.to_string(),
                            message: message.clone(),
                            deliveries: 0,
                            assigned: None,
                            stored_at: Instant::now(),
                        });
                    }
                    for consumer in &stream.consumers {
                        if !consumer.paused && subject_matches(&consumer.filter, subject) {
                            let _ = consumer.tx.send(Delivery {
                                subject: subject.to_string(),
                                message: message.clone(),
                                deliveries: 1,
                                ack: None,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        self.ensure_ticker();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.ephemeral.push(EphemeralSub {
            id,
            pattern: subject.to_string(),
            tx,
        });

        let inner_ref = self.inner.clone();
        Ok(Subscription {
            id,
            subject: subject.to_string(),
            rx,
            cleanup: Some(Box::new(move || {
                let mut guard = lock_inner(&inner_ref);
                guard.ephemeral.retain(|s| s.id != id);
            })),
        })
    }

    async fn consume(&self, stream: &str, subject: &str) -> Result<Subscription> {
        self.ensure_ticker();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| RuntimeError::Broker(format!("unknown stream '{stream}'")))?;
        state.consumers.push(ConsumerState {
            id,
            filter: subject.to_string(),
            tx,
            paused: false,
        });

        let name = stream.to_string();
        try_deliver(&mut inner, &self.inner, &name);

        let inner_ref = self.inner.clone();
        let stream_name = stream.to_string();
        Ok(Subscription {
            id,
            subject: subject.to_string(),
            rx,
            cleanup: Some(Box::new(move || {
                let mut guard = lock_inner(&inner_ref);
                if let Some(state) = guard.streams.get_mut(&stream_name) {
                    state.consumers.retain(|c| c.id != id);
                    // Free this consumer's outstanding assignments.
                    for msg in state.messages.iter_mut() {
                        if matches!(msg.assigned, Some((cid, _)) if cid == id) {
                            msg.assigned = None;
                        }
                    }
                }
            })),
        })
    }

    async fn pause_consumer(&self, stream: &str, consumer_id: u64) -> Result<()> {
        let mut inner = self.lock();
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| RuntimeError::Broker(format!("unknown stream '{stream}'")))?;
        if let Some(consumer) = state.consumers.iter_mut().find(|c| c.id == consumer_id) {
            consumer.paused = true;
        }
        Ok(())
    }

    async fn resume_consumer(&self, stream: &str, consumer_id: u64) -> Result<()> {
        let mut inner = self.lock();
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| RuntimeError::Broker(format!("unknown stream '{stream}'")))?;
        if let Some(consumer) = state.consumers.iter_mut().find(|c| c.id == consumer_id) {
            consumer.paused = false;
        }
        let name = stream.to_string();
        try_deliver(&mut inner, &self.inner, &name);
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::envelope::EnvelopeType;
    use tokio::time::timeout;

    fn msg(target: &str) -> AgentMessage {
        AgentMessage::task_request("orchestrator://local", target, "hello", None)
    }

    fn fast_broker(ack_wait_ms: u64) -> (InProcessBroker, StreamConfig) {
        let broker = InProcessBroker::with_tick_interval(Duration::from_millis(20));
        let config = StreamConfig {
            ack_wait: Duration::from_millis(ack_wait_ms),
            ..StreamConfig::agent_tasks()
        };
        (broker, config)
    }

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("agent.*.inbox", "agent.a1.inbox"));
        assert!(!subject_matches("agent.*.inbox", "agent.a1.outbox"));
        assert!(!subject_matches("agent.*.inbox", "agent.a1.b2.inbox"));
        assert!(subject_matches("agent.events.>", "agent.events.a1.turn"));
        assert!(subject_matches("system.>", "system.dlq.agent_tasks"));
        assert!(!subject_matches("system.>", "agent.a1.inbox"));
        assert!(subject_matches("_INBOX.abc", "_INBOX.abc"));
    }

    #[tokio::test]
    async fn workqueue_delivers_once_and_ack_removes() {
        let (broker, config) = fast_broker(5_000);
        broker.ensure_stream(config).await.unwrap();
        let mut sub = broker.consume("AGENT_TASKS", "agent.a1.inbox").await.unwrap();

        broker.publish("agent.a1.inbox", &msg("a1")).await.unwrap();

        let delivery = timeout(Duration::from_millis(500), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.deliveries, 1);
        assert_eq!(delivery.message.message_type, EnvelopeType::TaskRequest);
        delivery.ack();

        // No redelivery after ack.
        let redelivery = timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(redelivery.is_err(), "acked message must not redeliver");
    }

    #[tokio::test]
    async fn unacked_message_redelivers_after_ack_wait() {
        let (broker, config) = fast_broker(30);
        broker.ensure_stream(config).await.unwrap();
        let mut sub = broker.consume("AGENT_TASKS", "agent.a1.inbox").await.unwrap();

        broker.publish("agent.a1.inbox", &msg("a1")).await.unwrap();

        let first = timeout(Duration::from_millis(500), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.deliveries, 1);
        drop(first); // never acked

        let second = timeout(Duration::from_millis(500), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.deliveries, 2);
        second.ack();
    }

    #[tokio::test]
    async fn max_deliveries_publishes_advisory() {
        let (broker, config) = fast_broker(20);
        broker.ensure_stream(config).await.unwrap();
        let mut advisory_sub = broker
            .subscribe(&format!("{ADVISORY_PREFIX}.>"))
            .await
            .unwrap();
        let mut sub = broker.consume("AGENT_TASKS", "agent.a1.inbox").await.unwrap();

        broker.publish("agent.a1.inbox", &msg("a1")).await.unwrap();

        // Let all 3 attempts expire unacked.
        for _ in 0..3 {
            let d = timeout(Duration::from_millis(800), sub.recv())
                .await
                .expect("delivery within deadline")
                .unwrap();
            drop(d);
        }

        let advisory = timeout(Duration::from_millis(800), advisory_sub.recv())
            .await
            .expect("advisory within deadline")
            .unwrap();
        assert!(advisory.subject.starts_with(ADVISORY_PREFIX));
        assert_eq!(
            advisory.message.metadata.get("x-advisory-stream"),
            Some(&serde_json::json!("AGENT_TASKS"))
        );
    }

    #[tokio::test]
    async fn message_queued_until_consumer_arrives() {
        let (broker, config) = fast_broker(5_000);
        broker.ensure_stream(config).await.unwrap();

        broker.publish("agent.a1.inbox", &msg("a1")).await.unwrap();
        let mut sub = broker.consume("AGENT_TASKS", "agent.a1.inbox").await.unwrap();

        let delivery = timeout(Duration::from_millis(500), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.target, "agent://a1");
        delivery.ack();
    }

    #[tokio::test]
    async fn paused_consumer_receives_nothing_until_resumed() {
        let (broker, config) = fast_broker(5_000);
        broker.ensure_stream(config).await.unwrap();
        let mut sub = broker.consume("AGENT_TASKS", "agent.a1.inbox").await.unwrap();
        let consumer_id = sub.id;

        broker.pause_consumer("AGENT_TASKS", consumer_id).await.unwrap();
        broker.publish("agent.a1.inbox", &msg("a1")).await.unwrap();
        assert!(
            timeout(Duration::from_millis(100), sub.recv()).await.is_err(),
            "paused consumer must not receive"
        );

        broker.resume_consumer("AGENT_TASKS", consumer_id).await.unwrap();
        let delivery = timeout(Duration::from_millis(500), sub.recv())
            .await
            .unwrap()
            .unwrap();
        delivery.ack();
    }

    #[tokio::test]
    async fn ephemeral_inbox_round_trip() {
        let broker = InProcessBroker::new();
        let inbox = broker.new_inbox();
        assert!(inbox.starts_with("_INBOX."));

        let mut sub = broker.subscribe(&inbox).await.unwrap();
        broker.publish(&inbox, &msg("whoever")).await.unwrap();

        let delivery = timeout(Duration::from_millis(200), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.subject, inbox);
    }

    #[tokio::test]
    async fn dropped_subscription_unsubscribes() {
        let broker = InProcessBroker::new();
        let sub = broker.subscribe("_INBOX.x").await.unwrap();
        drop(sub);
        broker.publish("_INBOX.x", &msg("nobody")).await.unwrap();
        // Nothing to assert beyond not panicking: the subscriber list is empty.
        assert!(broker.lock().ephemeral.is_empty());
    }

    #[tokio::test]
    async fn interest_stream_fans_out_to_all_consumers() {
        let broker = InProcessBroker::new();
        broker.ensure_stream(StreamConfig::agent_events()).await.unwrap();
        let mut sub1 = broker.consume("AGENT_EVENTS", "agent.events.>").await.unwrap();
        let mut sub2 = broker.consume("AGENT_EVENTS", "agent.events.>").await.unwrap();

        broker
            .publish("agent.events.a1.turn", &msg("a1"))
            .await
            .unwrap();

        for sub in [&mut sub1, &mut sub2] {
            let delivery = timeout(Duration::from_millis(200), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.subject, "agent.events.a1.turn");
        }
    }
}
