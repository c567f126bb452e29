//! Gateway ingress: WebSocket + health endpoints, lane dispatch,
//! idempotency, and breaker gating.
//!
//! Every message — whether it arrived on a socket or was injected by a
//! channel adaptor — goes through the same pipeline: lane enqueue →
//! idempotency check-and-set → per-target circuit breaker → publish onto
//! the target's inbox. Responses come back over an internal reply subject
//! and are routed to the originating socket or a registered listener by
//! correlation id.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

use super::{
    breaker::{BreakerState, CircuitBreaker},
    broker::{ADVISORY_PREFIX, Broker, StreamConfig},
    envelope::{AgentMessage, EnvelopeType},
    idempotency::IdempotencyStore,
    lane::LaneQueue,
};

/// Internal subject agents reply on when the ingress set no `replyTo`.
pub const GATEWAY_REPLY_SUBJECT: &str = "_GATEWAY.responses";

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub idempotency_ttl: Duration,
    /// Static token; `None` accepts every socket. Replaceable wholesale via
    /// [`GatewayServer::with_auth`].
    pub auth_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8710".to_string(),
            idempotency_ttl: Duration::from_secs(600),
            auth_token: None,
        }
    }
}

type AuthFn = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

// ─── GatewayServer ───────────────────────────────────────────────────────────

pub struct GatewayServer {
    broker: Arc<dyn Broker>,
    idempotency: Arc<dyn IdempotencyStore>,
    lanes: LaneQueue,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    /// correlationId → websocket session.
    correlation_ws: Mutex<HashMap<String, String>>,
    /// source URI → websocket session, for source-based lookup.
    source_sessions: Mutex<HashMap<String, String>>,
    /// websocket session → outbound frame sender.
    ws_senders: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    /// correlationId → programmatic response listener.
    response_listeners: Mutex<HashMap<String, mpsc::UnboundedSender<AgentMessage>>>,
    /// target agent → (stream, consumer id) to pause when its breaker opens.
    agent_consumers: Arc<Mutex<HashMap<String, (String, u64)>>>,
    auth: AuthFn,
    config: GatewayConfig,
    started_at: Mutex<Option<Instant>>,
}

impl GatewayServer {
    pub fn new(
        broker: Arc<dyn Broker>,
        idempotency: Arc<dyn IdempotencyStore>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        let token = config.auth_token.clone();
        let auth: AuthFn = Arc::new(move |presented: Option<&str>| match &token {
            Some(expected) => presented == Some(expected.as_str()),
            None => true,
        });
        Arc::new(Self {
            broker,
            idempotency,
            lanes: LaneQueue::new(),
            breakers: Mutex::new(HashMap::new()),
            correlation_ws: Mutex::new(HashMap::new()),
            source_sessions: Mutex::new(HashMap::new()),
            ws_senders: Mutex::new(HashMap::new()),
            response_listeners: Mutex::new(HashMap::new()),
            agent_consumers: Arc::new(Mutex::new(HashMap::new())),
            auth,
            config,
            started_at: Mutex::new(None),
        })
    }

    /// Swap the socket authenticator.
    pub fn with_auth<F>(self: Arc<Self>, auth: F) -> Arc<Self>
    where
        F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
    {
        // Arc::try_unwrap would race with clones; rebuild instead.
        let mut inner = match Arc::try_unwrap(self) {
            Ok(inner) => inner,
            Err(shared) => {
                log::warn!("gateway: with_auth after sharing; authenticator unchanged");
                return shared;
            }
        };
        inner.auth = Arc::new(auth);
        Arc::new(inner)
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    // ── start ────────────────────────────────────────────────────────────────

    /// Connect the streams, start the DLQ and reply routers, and serve HTTP.
    ///
    /// Returns the bound address (useful with a `:0` port in tests).
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        for config in [
            StreamConfig::agent_tasks(),
            StreamConfig::agent_events(),
            StreamConfig::system(),
        ] {
            self.broker.ensure_stream(config).await?;
        }

        self.spawn_dlq_republisher().await?;
        self.spawn_reply_router().await?;

        *lock(&self.started_at) = Some(Instant::now());

        let app = Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/ws", get(ws_upgrade))
            .layer(tower_http::cors::CorsLayer::permissive())
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self.clone());

        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("gateway listening on {addr}");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("gateway server exited: {e}");
            }
        });
        Ok(addr)
    }

    /// Subscribe once to the max-deliveries advisory and republish dead
    /// messages onto `system.dlq.<stream_lowercase>`.
    async fn spawn_dlq_republisher(self: &Arc<Self>) -> Result<()> {
        let mut sub = self
            .broker
            .subscribe(&format!("{ADVISORY_PREFIX}.>"))
            .await?;
        let broker = self.broker.clone();
        tokio::spawn(async move {
            while let Some(delivery) = sub.recv().await {
                let mut dead = delivery.message.clone();
                let stream = dead
                    .metadata
                    .remove("x-advisory-stream")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string());
                let consumer = dead.metadata.remove("x-advisory-consumer");
                let sequence = dead.metadata.remove("x-advisory-sequence");
                dead.metadata
                    .insert("originalStream".into(), json!(stream));
                if let Some(consumer) = consumer {
                    dead.metadata.insert("consumer".into(), consumer);
                }
                if let Some(sequence) = sequence {
                    dead.metadata.insert("sequence".into(), sequence);
                }
                dead.message_type = EnvelopeType::SystemDlq;

                let subject = format!("system.dlq.{}", stream.to_lowercase());
                if let Err(e) = broker.publish(&subject, &dead).await {
                    log::error!("gateway: DLQ republish failed: {e}");
                }
            }
        });
        Ok(())
    }

    /// Route agent replies back to sockets and listeners.
    async fn spawn_reply_router(self: &Arc<Self>) -> Result<()> {
        let mut sub = self.broker.subscribe(GATEWAY_REPLY_SUBJECT).await?;
        let gateway = self.clone();
        tokio::spawn(async move {
            while let Some(delivery) = sub.recv().await {
                gateway.send_response(delivery.message);
            }
        });
        Ok(())
    }

    // ── Ingress pipeline ─────────────────────────────────────────────────────

    /// The single ingress path for sockets and injectors alike.
    pub fn handle_incoming(self: &Arc<Self>, mut message: AgentMessage, ws_session: Option<String>) {
        if let Some(ws) = &ws_session {
            if let Some(correlation) = &message.correlation_id {
                lock(&self.correlation_ws).insert(correlation.clone(), ws.clone());
            }
            lock(&self.source_sessions).insert(message.source.clone(), ws.clone());
        }
        if message.reply_to.is_none() {
            message.reply_to = Some(GATEWAY_REPLY_SUBJECT.to_string());
        }

        let lane_key = message.lane_key();
        let gateway = self.clone();
        self.lanes.enqueue(
            &lane_key,
            Box::pin(async move { gateway.route_message(message).await }),
        );
    }

    /// Channel adaptors inject through the same lane/idempotency/breaker
    /// pipeline.
    pub fn inject_message(self: &Arc<Self>, message: AgentMessage) {
        self.handle_incoming(message, None);
    }

    async fn route_message(self: Arc<Self>, message: AgentMessage) -> Result<()> {
        let fresh = self
            .idempotency
            .check_and_set(message.dedup_key(), self.config.idempotency_ttl)
            .await?;
        if !fresh {
            log::debug!("gateway: duplicate message '{}' dropped", message.dedup_key());
            return Ok(());
        }

        let Some(target) = message.target_agent().map(str::to_string) else {
            log::debug!("gateway: non-agent target '{}' dropped", message.target);
            return Ok(());
        };
        let breaker = self.breaker_for(&target);
        if !breaker.is_allowed() {
            log::debug!("gateway: breaker open for '{target}', message dropped");
            return Ok(());
        }

        let subject = format!("agent.{target}.inbox");
        match self.broker.publish(&subject, &message).await {
            Ok(()) => {
                breaker.record_success();
                Ok(())
            }
            Err(e) => {
                breaker.record_failure();
                Err(e)
            }
        }
    }

    /// Get or create the per-target breaker; state changes pause/resume the
    /// target's registered inbox consumer.
    fn breaker_for(&self, target: &str) -> CircuitBreaker {
        let mut breakers = lock(&self.breakers);
        breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                let broker = self.broker.clone();
                let consumers = self.agent_consumers.clone();
                let agent = target.to_string();
                CircuitBreaker::default().with_state_callback(move |state| {
                    let registered = lock(&consumers).get(&agent).cloned();
                    let Some((stream, consumer_id)) = registered else {
                        return;
                    };
                    let broker = broker.clone();
                    tokio::spawn(async move {
                        let result = match state {
                            BreakerState::Open => broker.pause_consumer(&stream, consumer_id).await,
                            BreakerState::Closed => {
                                broker.resume_consumer(&stream, consumer_id).await
                            }
                            BreakerState::HalfOpen => Ok(()),
                        };
                        if let Err(e) = result {
                            log::warn!("gateway: consumer pause/resume failed: {e}");
                        }
                    });
                })
            })
            .clone()
    }

    /// Register the inbox consumer to pause when `agent_id`'s breaker opens.
    pub fn register_agent_consumer(&self, agent_id: &str, stream: &str, consumer_id: u64) {
        lock(&self.agent_consumers)
            .insert(agent_id.to_string(), (stream.to_string(), consumer_id));
    }

    // ── Response routing ─────────────────────────────────────────────────────

    /// Programmatic response tap for channel adaptors.
    pub fn on_response_for_correlation(
        &self,
        correlation_id: &str,
    ) -> mpsc::UnboundedReceiver<AgentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.response_listeners).insert(correlation_id.to_string(), tx);
        rx
    }

    pub fn remove_response_listener(&self, correlation_id: &str) {
        lock(&self.response_listeners).remove(correlation_id);
    }

    /// Deliver by preference: known socket, else registered listener, else
    /// drop.
    pub fn send_response(&self, message: AgentMessage) {
        let Some(correlation) = message.correlation_id.clone() else {
            log::debug!("gateway: response without correlation dropped");
            return;
        };

        let ws_session = lock(&self.correlation_ws).get(&correlation).cloned();
        if let Some(session) = ws_session {
            let sender = lock(&self.ws_senders).get(&session).cloned();
            if let Some(sender) = sender {
                match serde_json::to_string(&message) {
                    Ok(frame) => {
                        if sender.send(frame).is_ok() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("gateway: response serialization failed: {e}"),
                }
            }
        }

        let listener = lock(&self.response_listeners).get(&correlation).cloned();
        if let Some(listener) = listener {
            if listener.send(message).is_ok() {
                return;
            }
            lock(&self.response_listeners).remove(&correlation);
            return;
        }

        log::debug!("gateway: no route for response correlation '{correlation}'");
    }

    fn uptime_secs(&self) -> u64 {
        lock(&self.started_at)
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

// ─── HTTP handlers ───────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

async fn ready(State(gateway): State<Arc<GatewayServer>>) -> impl IntoResponse {
    let broker_ok = gateway.broker.healthy().await;
    let idempotency_ok = gateway.idempotency.healthy().await;

    let status = if broker_ok && idempotency_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if status == StatusCode::OK { "ok" } else { "degraded" },
        "nats": broker_ok,
        "redis": idempotency_ok,
        "uptime": gateway.uptime_secs(),
    });
    (status, axum::Json(body))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(gateway): State<Arc<GatewayServer>>,
) -> impl IntoResponse {
    let token = params.get("token").cloned();
    if !(gateway.auth)(token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
        .into_response()
}

async fn handle_socket(mut socket: WebSocket, gateway: Arc<GatewayServer>) {
    let session_id = Uuid::new_v4().to_string();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    lock(&gateway.ws_senders).insert(session_id.clone(), tx);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if socket.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<AgentMessage>(&text) {
                            Ok(message) => {
                                gateway.handle_incoming(message, Some(session_id.clone()));
                            }
                            Err(e) => {
                                let err = json!({ "type": "error", "error": format!("invalid envelope: {e}") });
                                let _ = socket.send(WsMessage::Text(err.to_string())).await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    lock(&gateway.ws_senders).remove(&session_id);
}

// ─── Tests ───────────────────────────────────────────────────────────────────
