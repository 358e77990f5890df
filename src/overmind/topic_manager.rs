//! WebSocket topic manager.
//!
//! Transport-agnostic core of the real-time surface: connection lifecycle,
//! topic subscriptions, heartbeat bookkeeping, and broadcast. The axum
//! gateway ([`ws_gateway`](crate::overmind::ws_gateway)) adapts actual
//! sockets onto [`ClientSender`]; tests drive the manager with channel-backed
//! senders and never open a socket.
//!
//! # Wire format
//!
//! Every frame is a [`WsEnvelope`]:
//! `{v: 1, type, topic, req_id?, ts (ms epoch), data}`.
//!
//! # Topics
//!
//! - `agent:<id>` — agent lifecycle and runs.
//! - `user:<id>` — per-user streaming (thread tokens, messages, profile).
//! - `workflow_execution:<id>` — node state plus the finished event; when the
//!   execution is already FINISHED at subscribe time, the current
//!   `execution_finished` envelope is replayed to the new subscriber.
//! - `ops:events` — admin only; non-admin subscription attempts get
//!   `subscribe_error FORBIDDEN` and the connection closes with 1008.
//!
//! # Protocol errors
//!
//! Payloads are validated centrally before dispatch; malformed frames yield
//! an `error` envelope and close code 1002. Authorization failures close
//! with 1008.

use crate::overmind::agent_runner::TokenSink;
use crate::overmind::config::Config;
use crate::overmind::event_bus::{listener, EventBus, EventKind};
use crate::overmind::metrics;
use crate::overmind::models::*;
use crate::overmind::store::{NewThreadMessage, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Close code for protocol errors (malformed payloads, unknown types).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Close code for authorization failures.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// The WebSocket wire frame, version 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    pub v: u8,
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    pub data: Value,
}

impl WsEnvelope {
    pub fn new(v: u8, kind: impl Into<String>, topic: impl Into<String>, data: Value) -> Self {
        Self {
            v,
            kind: kind.into(),
            topic: topic.into(),
            req_id: None,
            ts: Utc::now().timestamp_millis(),
            data,
        }
    }

    pub fn with_req_id(mut self, req_id: Option<String>) -> Self {
        self.req_id = req_id;
        self
    }
}

/// Error codes carried by `subscribe_error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscribeErrorCode {
    NotFound,
    Unauthorized,
    Forbidden,
    InvalidFormat,
    Unknown,
    Deprecated,
}

/// Egress seam: how the manager pushes frames to one client.
///
/// Sends are non-blocking; a send failure means the client is gone and the
/// manager evicts it from every subscription set.
pub trait ClientSender: Send + Sync {
    fn send(&self, envelope: &WsEnvelope) -> Result<(), ()>;
}

/// [`ClientSender`] over an unbounded channel. The gateway's writer task (or
/// a test) drains the receiving end.
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<WsEnvelope>,
}

impl ChannelSender {
    pub fn new(tx: mpsc::UnboundedSender<WsEnvelope>) -> Self {
        Self { tx }
    }
}

impl ClientSender for ChannelSender {
    fn send(&self, envelope: &WsEnvelope) -> Result<(), ()> {
        self.tx.send(envelope.clone()).map_err(|_| ())
    }
}

/// What the transport should do after an ingress frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    Continue,
    /// Close the connection with the given code.
    Close(u16),
}

#[derive(Debug, Deserialize)]
struct SubscribePayload {
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    thread_id: Id,
    content: String,
}

struct Connection {
    sender: Arc<dyn ClientSender>,
    last_pong: DateTime<Utc>,
}

#[derive(Default)]
struct ManagerState {
    connections: HashMap<String, Connection>,
    subscriptions: HashMap<String, HashSet<String>>,
    client_topics: HashMap<String, HashSet<String>>,
    client_users: HashMap<String, Id>,
}

/// Connection/topic state machine. Shared as `Arc<TopicManager>`.
pub struct TopicManager {
    store: Arc<Store>,
    config: Arc<Config>,
    state: RwLock<ManagerState>,
}

impl TopicManager {
    pub fn new(store: Arc<Store>, config: Arc<Config>) -> Self {
        Self {
            store,
            config,
            state: RwLock::new(ManagerState::default()),
        }
    }

    fn envelope(&self, kind: &str, topic: &str, data: Value) -> WsEnvelope {
        WsEnvelope::new(self.config.ws_envelope_version, kind, topic, data)
    }

    /// Register a connection. `user_id` is the authenticated user, if any
    /// (authentication itself happens upstream of the core).
    pub async fn register_client(
        &self,
        client_id: &str,
        sender: Arc<dyn ClientSender>,
        user_id: Option<Id>,
    ) {
        let mut state = self.state.write().await;
        state.connections.insert(
            client_id.to_string(),
            Connection {
                sender,
                last_pong: Utc::now(),
            },
        );
        state
            .client_topics
            .insert(client_id.to_string(), HashSet::new());
        if let Some(uid) = user_id {
            state.client_users.insert(client_id.to_string(), uid);
        }
    }

    /// Drop a connection from every map.
    pub async fn disconnect(&self, client_id: &str) {
        let mut state = self.state.write().await;
        evict(&mut state, client_id);
    }

    /// Topics a client is currently subscribed to.
    pub async fn topics_of(&self, client_id: &str) -> HashSet<String> {
        self.state
            .read()
            .await
            .client_topics
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Handle one ingress frame. Payloads are validated before dispatch.
    pub async fn handle_ingress(&self, client_id: &str, raw: &str) -> IngressOutcome {
        let envelope: WsEnvelope = match serde_json::from_str(raw) {
            Ok(env) => env,
            Err(e) => {
                self.send_error(client_id, None, &format!("malformed envelope: {}", e))
                    .await;
                return IngressOutcome::Close(CLOSE_PROTOCOL_ERROR);
            }
        };
        let req_id = envelope.req_id.clone();

        match envelope.kind.as_str() {
            "ping" => {
                let reply = self
                    .envelope("pong", "system", json!({}))
                    .with_req_id(req_id);
                self.send_to_client(client_id, &reply).await;
                IngressOutcome::Continue
            }
            "pong" => {
                let mut state = self.state.write().await;
                if let Some(conn) = state.connections.get_mut(client_id) {
                    conn.last_pong = Utc::now();
                }
                IngressOutcome::Continue
            }
            "subscribe" => self.handle_subscribe(client_id, req_id, envelope.data).await,
            "unsubscribe" => {
                match serde_json::from_value::<SubscribePayload>(envelope.data) {
                    Ok(payload) => {
                        let mut state = self.state.write().await;
                        for topic in &payload.topics {
                            if let Some(subs) = state.subscriptions.get_mut(topic) {
                                subs.remove(client_id);
                            }
                            if let Some(topics) = state.client_topics.get_mut(client_id) {
                                topics.remove(topic);
                            }
                        }
                        IngressOutcome::Continue
                    }
                    Err(e) => {
                        self.send_error(client_id, req_id, &format!("invalid payload: {}", e))
                            .await;
                        IngressOutcome::Close(CLOSE_PROTOCOL_ERROR)
                    }
                }
            }
            "subscribe_thread" => {
                // Removed handler kept on the wire so old clients fail loudly.
                self.send_subscribe_error(
                    client_id,
                    req_id,
                    "",
                    SubscribeErrorCode::Deprecated,
                    "subscribe_thread is deprecated; use subscribe with a user topic",
                )
                .await;
                IngressOutcome::Continue
            }
            "send_message" => self.handle_send_message(client_id, req_id, envelope.data).await,
            other => {
                self.send_error(client_id, req_id, &format!("unknown message type {:?}", other))
                    .await;
                IngressOutcome::Close(CLOSE_PROTOCOL_ERROR)
            }
        }
    }

    async fn handle_subscribe(
        &self,
        client_id: &str,
        req_id: Option<String>,
        data: Value,
    ) -> IngressOutcome {
        let payload: SubscribePayload = match serde_json::from_value(data) {
            Ok(p) => p,
            Err(e) => {
                self.send_error(client_id, req_id, &format!("invalid payload: {}", e))
                    .await;
                return IngressOutcome::Close(CLOSE_PROTOCOL_ERROR);
            }
        };

        let mut accepted: Vec<String> = Vec::new();
        let mut initial_envelopes: Vec<WsEnvelope> = Vec::new();
        let mut close: Option<u16> = None;

        for topic in &payload.topics {
            match self.authorize_topic(client_id, topic).await {
                Ok(initial) => {
                    accepted.push(topic.clone());
                    initial_envelopes.extend(initial);
                }
                Err((code, detail, close_code)) => {
                    self.send_subscribe_error(client_id, req_id.clone(), topic, code, &detail)
                        .await;
                    if close.is_none() {
                        close = close_code;
                    }
                }
            }
        }

        if !accepted.is_empty() {
            {
                let mut state = self.state.write().await;
                for topic in &accepted {
                    state
                        .subscriptions
                        .entry(topic.clone())
                        .or_insert_with(HashSet::new)
                        .insert(client_id.to_string());
                    state
                        .client_topics
                        .entry(client_id.to_string())
                        .or_insert_with(HashSet::new)
                        .insert(topic.clone());
                }
            }
            let ack = self
                .envelope("subscribe_ack", "system", json!({ "topics": accepted }))
                .with_req_id(req_id);
            self.send_to_client(client_id, &ack).await;
            for envelope in initial_envelopes {
                self.send_to_client(client_id, &envelope).await;
            }
        }

        match close {
            Some(code) => IngressOutcome::Close(code),
            None => IngressOutcome::Continue,
        }
    }

    /// Check one topic against the client's identity. On success returns the
    /// initial-state envelopes to deliver after the ack.
    async fn authorize_topic(
        &self,
        client_id: &str,
        topic: &str,
    ) -> Result<Vec<WsEnvelope>, (SubscribeErrorCode, String, Option<u16>)> {
        if topic == "ops:events" {
            let user_id = self.client_user(client_id).await;
            let is_admin = match user_id {
                Some(uid) => self
                    .store
                    .get_user(uid)
                    .await
                    .map(|u| u.role == UserRole::Admin || self.config.is_admin_email(&u.email))
                    .unwrap_or(false),
                None => false,
            };
            if !is_admin {
                return Err((
                    SubscribeErrorCode::Forbidden,
                    "admin privileges required".to_string(),
                    Some(CLOSE_POLICY_VIOLATION),
                ));
            }
            return Ok(Vec::new());
        }

        let (prefix, id) = match topic.split_once(':') {
            Some((prefix, raw_id)) => match raw_id.parse::<Id>() {
                Ok(id) => (prefix, id),
                Err(_) => {
                    return Err((
                        SubscribeErrorCode::InvalidFormat,
                        format!("topic {:?} has a non-numeric id", topic),
                        None,
                    ))
                }
            },
            None => {
                return Err((
                    SubscribeErrorCode::InvalidFormat,
                    format!("topic {:?} is not <prefix>:<id>", topic),
                    None,
                ))
            }
        };

        match prefix {
            "agent" => match self.store.get_agent(id).await {
                Ok(agent) => Ok(vec![self.envelope(
                    "agent_state",
                    topic,
                    serde_json::to_value(&agent).unwrap_or(Value::Null),
                )]),
                Err(_) => Err((
                    SubscribeErrorCode::NotFound,
                    format!("agent {} not found", id),
                    None,
                )),
            },
            "user" => {
                let user_id = self.client_user(client_id).await;
                match user_id {
                    None => Err((
                        SubscribeErrorCode::Unauthorized,
                        "user topics require authentication".to_string(),
                        None,
                    )),
                    Some(uid) if uid != id => Err((
                        SubscribeErrorCode::Forbidden,
                        "cannot subscribe to another user's topic".to_string(),
                        None,
                    )),
                    Some(uid) => match self.store.get_user(uid).await {
                        Ok(user) => Ok(vec![self.envelope(
                            "user_update",
                            topic,
                            public_user_profile(&user),
                        )]),
                        Err(_) => Err((
                            SubscribeErrorCode::NotFound,
                            format!("user {} not found", uid),
                            None,
                        )),
                    },
                }
            }
            "workflow_execution" => match self.store.get_execution(id).await {
                Ok(execution) => {
                    let mut initial = Vec::new();
                    // Late subscribers to a finished execution still see the
                    // terminal event.
                    if execution.phase == ExecutionPhase::Finished {
                        initial.push(execution_finished_envelope(
                            self.config.ws_envelope_version,
                            &execution,
                        ));
                    }
                    Ok(initial)
                }
                Err(_) => Err((
                    SubscribeErrorCode::NotFound,
                    format!("execution {} not found", id),
                    None,
                )),
            },
            other => Err((
                SubscribeErrorCode::Unknown,
                format!("unknown topic prefix {:?}", other),
                None,
            )),
        }
    }

    async fn handle_send_message(
        &self,
        client_id: &str,
        req_id: Option<String>,
        data: Value,
    ) -> IngressOutcome {
        let payload: SendMessagePayload = match serde_json::from_value(data) {
            Ok(p) => p,
            Err(e) => {
                self.send_error(client_id, req_id, &format!("invalid payload: {}", e))
                    .await;
                return IngressOutcome::Close(CLOSE_PROTOCOL_ERROR);
            }
        };

        let user_id = match self.client_user(client_id).await {
            Some(uid) => uid,
            None => {
                self.send_subscribe_error(
                    client_id,
                    req_id,
                    "",
                    SubscribeErrorCode::Unauthorized,
                    "send_message requires authentication",
                )
                .await;
                return IngressOutcome::Continue;
            }
        };

        let thread = match self.store.get_thread(payload.thread_id).await {
            Ok(thread) => thread,
            Err(_) => {
                self.send_subscribe_error(
                    client_id,
                    req_id,
                    "",
                    SubscribeErrorCode::NotFound,
                    &format!("thread {} not found", payload.thread_id),
                )
                .await;
                return IngressOutcome::Continue;
            }
        };
        let owner_ok = self
            .store
            .get_agent(thread.agent_id)
            .await
            .map(|a| a.owner_id == user_id)
            .unwrap_or(false);
        if !owner_ok {
            self.send_subscribe_error(
                client_id,
                req_id,
                "",
                SubscribeErrorCode::Forbidden,
                "thread belongs to another user",
            )
            .await;
            return IngressOutcome::Close(CLOSE_POLICY_VIOLATION);
        }

        if let Err(e) = self
            .store
            .create_thread_message(NewThreadMessage::simple(
                payload.thread_id,
                MessageRole::User,
                payload.content,
            ))
            .await
        {
            self.send_error(client_id, req_id, &e.to_string()).await;
        }
        IngressOutcome::Continue
    }

    async fn client_user(&self, client_id: &str) -> Option<Id> {
        self.state.read().await.client_users.get(client_id).copied()
    }

    // -- Egress ------------------------------------------------------------

    /// Send to every client subscribed to `topic`. Clients whose sender
    /// fails are evicted from every subscription set.
    pub async fn broadcast_to_topic(&self, topic: &str, envelope: &WsEnvelope) {
        let targets: Vec<(String, Arc<dyn ClientSender>)> = {
            let state = self.state.read().await;
            match state.subscriptions.get(topic) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| {
                        state
                            .connections
                            .get(id)
                            .map(|c| (id.clone(), Arc::clone(&c.sender)))
                    })
                    .collect(),
                None => return,
            }
        };

        let mut dead: Vec<String> = Vec::new();
        for (client_id, sender) in targets {
            if sender.send(envelope).is_err() {
                dead.push(client_id);
            } else {
                metrics::incr(&metrics::WS_BROADCAST_TOTAL);
            }
        }
        if !dead.is_empty() {
            let mut state = self.state.write().await;
            for client_id in dead {
                log::warn!("evicting unreachable client {}", client_id);
                evict(&mut state, &client_id);
            }
        }
    }

    async fn send_to_client(&self, client_id: &str, envelope: &WsEnvelope) {
        let sender = {
            let state = self.state.read().await;
            state
                .connections
                .get(client_id)
                .map(|c| Arc::clone(&c.sender))
        };
        if let Some(sender) = sender {
            if sender.send(envelope).is_err() {
                let mut state = self.state.write().await;
                evict(&mut state, client_id);
            }
        }
    }

    async fn send_error(&self, client_id: &str, req_id: Option<String>, detail: &str) {
        let envelope = self
            .envelope("error", "system", json!({ "message": detail }))
            .with_req_id(req_id);
        self.send_to_client(client_id, &envelope).await;
    }

    async fn send_subscribe_error(
        &self,
        client_id: &str,
        req_id: Option<String>,
        topic: &str,
        code: SubscribeErrorCode,
        detail: &str,
    ) {
        let envelope = self
            .envelope(
                "subscribe_error",
                "system",
                json!({ "topic": topic, "code": code, "message": detail }),
            )
            .with_req_id(req_id);
        self.send_to_client(client_id, &envelope).await;
    }

    // -- Heartbeat ---------------------------------------------------------

    /// Envelope version stamped on frames (for transports building their
    /// own ping frames).
    pub fn envelope_version(&self) -> u8 {
        self.config.ws_envelope_version
    }

    /// Whether a client's last pong is older than `window`. Unknown clients
    /// count as stale.
    pub async fn client_stale(&self, client_id: &str, window: Duration) -> bool {
        let state = self.state.read().await;
        match state.connections.get(client_id) {
            Some(conn) => (Utc::now() - conn.last_pong)
                .to_std()
                .map(|age| age > window)
                .unwrap_or(false),
            None => true,
        }
    }

    /// Ping every client and evict those whose last pong is older than
    /// `window`. Returns the evicted client ids so the transport can close
    /// the underlying sockets.
    pub async fn sweep_heartbeats(&self, window: Duration) -> Vec<String> {
        let ping = self.envelope("ping", "system", json!({}));
        let now = Utc::now();
        let mut dead: Vec<String> = Vec::new();

        {
            let state = self.state.read().await;
            for (client_id, conn) in &state.connections {
                let stale = (now - conn.last_pong)
                    .to_std()
                    .map(|age| age > window)
                    .unwrap_or(false);
                if stale || conn.sender.send(&ping).is_err() {
                    dead.push(client_id.clone());
                }
            }
        }

        if !dead.is_empty() {
            let mut state = self.state.write().await;
            for client_id in &dead {
                log::info!("heartbeat watchdog dropping client {}", client_id);
                metrics::incr(&metrics::WS_WATCHDOG_DROPS_TOTAL);
                evict(&mut state, client_id);
            }
        }
        dead
    }
}

fn evict(state: &mut ManagerState, client_id: &str) {
    state.connections.remove(client_id);
    state.client_users.remove(client_id);
    if let Some(topics) = state.client_topics.remove(client_id) {
        for topic in topics {
            if let Some(subs) = state.subscriptions.get_mut(&topic) {
                subs.remove(client_id);
            }
        }
    }
}

/// The user profile as exposed over `user:` topics. Secrets never leave the
/// store.
fn public_user_profile(user: &User) -> Value {
    json!({
        "id": user.id,
        "email": user.email,
        "role": user.role,
        "display_name": user.display_name,
        "avatar_url": user.avatar_url,
        "prefs": user.prefs,
    })
}

/// Build the terminal envelope for an execution (also used for replay).
pub fn execution_finished_envelope(v: u8, execution: &WorkflowExecution) -> WsEnvelope {
    let duration_ms = match (execution.started_at, execution.finished_at) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
        _ => None,
    };
    WsEnvelope::new(
        v,
        "execution_finished",
        format!("workflow_execution:{}", execution.id),
        json!({
            "execution_id": execution.id,
            "workflow_id": execution.workflow_id,
            "phase": execution.phase,
            "result": execution.result,
            "duration_ms": duration_ms,
            "error_message": execution.error_message,
        }),
    )
}

/// Token relay: adapts the topic manager onto the runner's [`TokenSink`].
pub struct TokenRelay(pub Arc<TopicManager>);

impl TokenSink for TokenRelay {
    fn emit_token(&self, owner_id: Id, thread_id: Id, token: &str) {
        let manager = Arc::clone(&self.0);
        let envelope = WsEnvelope::new(
            manager.config.ws_envelope_version,
            "thread_token",
            format!("user:{}", owner_id),
            json!({ "thread_id": thread_id, "token": token }),
        );
        tokio::spawn(async move {
            manager
                .broadcast_to_topic(&envelope.topic.clone(), &envelope)
                .await;
        });
    }
}

/// Subscribe the manager to the event bus: every domain event becomes a
/// topic-scoped envelope. Per-topic delivery order matches publish order
/// because the bus dispatches listeners serially.
pub async fn wire_event_relay(bus: &EventBus, manager: Arc<TopicManager>) {
    let v = manager.config.ws_envelope_version;

    // Agent lifecycle (created/updated share the agent_state shape).
    for kind in [EventKind::AgentCreated, EventKind::AgentUpdated] {
        let manager = Arc::clone(&manager);
        bus.subscribe(
            kind,
            listener(move |payload| {
                let manager = Arc::clone(&manager);
                async move {
                    if let Some(id) = payload.get("id").and_then(|p| p.as_i64()) {
                        let topic = format!("agent:{}", id);
                        let envelope = WsEnvelope::new(v, "agent_state", topic.clone(), payload);
                        manager.broadcast_to_topic(&topic, &envelope).await;
                    }
                    Ok(())
                }
            }),
        )
        .await;
    }

    {
        let manager = Arc::clone(&manager);
        bus.subscribe(
            EventKind::AgentDeleted,
            listener(move |payload| {
                let manager = Arc::clone(&manager);
                async move {
                    if let Some(id) = payload.get("id").and_then(|p| p.as_i64()) {
                        let topic = format!("agent:{}", id);
                        let envelope = WsEnvelope::new(v, "agent_deleted", topic.clone(), payload);
                        manager.broadcast_to_topic(&topic, &envelope).await;
                    }
                    Ok(())
                }
            }),
        )
        .await;
    }

    // Runs surface on the owning agent's topic.
    for kind in [EventKind::RunCreated, EventKind::RunUpdated] {
        let manager = Arc::clone(&manager);
        bus.subscribe(
            kind,
            listener(move |payload| {
                let manager = Arc::clone(&manager);
                async move {
                    if let Some(agent_id) = payload.get("agent_id").and_then(|p| p.as_i64()) {
                        let topic = format!("agent:{}", agent_id);
                        let envelope = WsEnvelope::new(v, "run_update", topic.clone(), payload);
                        manager.broadcast_to_topic(&topic, &envelope).await;
                    }
                    Ok(())
                }
            }),
        )
        .await;
    }

    // Thread messages stream to the owner.
    {
        let manager = Arc::clone(&manager);
        bus.subscribe(
            EventKind::ThreadMessageCreated,
            listener(move |payload| {
                let manager = Arc::clone(&manager);
                async move {
                    if let Some(owner_id) = payload.get("owner_id").and_then(|p| p.as_i64()) {
                        let topic = format!("user:{}", owner_id);
                        let envelope = WsEnvelope::new(v, "thread_message", topic.clone(), payload);
                        manager.broadcast_to_topic(&topic, &envelope).await;
                    }
                    Ok(())
                }
            }),
        )
        .await;
    }

    // Workflow execution stream.
    for (kind, wire_type) in [
        (EventKind::NodeStateChanged, "node_state"),
        (EventKind::ExecutionFinished, "execution_finished"),
        (EventKind::WorkflowProgress, "workflow_progress"),
    ] {
        let manager = Arc::clone(&manager);
        bus.subscribe(
            kind,
            listener(move |payload| {
                let manager = Arc::clone(&manager);
                async move {
                    if let Some(execution_id) =
                        payload.get("execution_id").and_then(|p| p.as_i64())
                    {
                        let topic = format!("workflow_execution:{}", execution_id);
                        let envelope = WsEnvelope::new(v, wire_type, topic.clone(), payload);
                        manager.broadcast_to_topic(&topic, &envelope).await;
                    }
                    Ok(())
                }
            }),
        )
        .await;
    }

    // Worker tool activity: owner stream plus the admin firehose.
    for (kind, wire_type) in [
        (EventKind::WorkerToolStarted, "worker_tool_started"),
        (EventKind::WorkerToolCompleted, "worker_tool_completed"),
        (EventKind::WorkerToolFailed, "worker_tool_failed"),
    ] {
        let manager = Arc::clone(&manager);
        bus.subscribe(
            kind,
            listener(move |payload| {
                let manager = Arc::clone(&manager);
                async move {
                    if let Some(owner_id) = payload.get("owner_id").and_then(|p| p.as_i64()) {
                        let topic = format!("user:{}", owner_id);
                        let envelope =
                            WsEnvelope::new(v, wire_type, topic.clone(), payload.clone());
                        manager.broadcast_to_topic(&topic, &envelope).await;
                    }
                    let envelope = WsEnvelope::new(v, wire_type, "ops:events", payload);
                    manager.broadcast_to_topic("ops:events", &envelope).await;
                    Ok(())
                }
            }),
        )
        .await;
    }
}
