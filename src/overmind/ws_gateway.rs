//! axum gateway: WebSocket upgrade and webhook ingress.
//!
//! Thin transport shell around the [`TopicManager`] and the
//! [`WebhookIngestor`]. Everything protocol-shaped (payload validation,
//! authorization, close codes) lives in the manager; this module only moves
//! frames between the socket and the manager and enforces the heartbeat
//! watchdog per connection.
//!
//! Authentication is upstream of the core: the embedding application
//! terminates auth and passes the resolved user id in the `user_id` query
//! parameter when it proxies the upgrade.

use crate::overmind::topic_manager::{
    ClientSender, IngressOutcome, TopicManager, WsEnvelope,
};
use crate::overmind::triggers::{WebhookIngestor, WebhookOutcome};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often the per-connection heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long a client may go without a pong before the watchdog drops it.
const WATCHDOG_WINDOW: Duration = Duration::from_secs(90);

/// Header carrying the webhook shared secret.
const SECRET_HEADER: &str = "x-trigger-secret";

/// Shared state behind the gateway routes.
pub struct Gateway {
    pub manager: Arc<TopicManager>,
    pub webhooks: Arc<WebhookIngestor>,
}

/// Upper bound on in-flight gateway requests.
const MAX_IN_FLIGHT: usize = 1024;

/// Build the gateway router: `GET /ws` and
/// `POST /api/triggers/{trigger_id}/events`.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/triggers/{trigger_id}/events", post(webhook_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(MAX_IN_FLIGHT))
        .with_state(gateway)
}

enum Outbound {
    Frame(WsEnvelope),
    Close(u16),
}

struct OutboundSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ClientSender for OutboundSender {
    fn send(&self, envelope: &WsEnvelope) -> Result<(), ()> {
        self.tx
            .send(Outbound::Frame(envelope.clone()))
            .map_err(|_| ())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    let user_id = params.get("user_id").and_then(|v| v.parse::<i64>().ok());
    ws.on_upgrade(move |socket| handle_socket(socket, gateway, user_id))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, user_id: Option<i64>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let manager = Arc::clone(&gateway.manager);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    manager
        .register_client(
            &client_id,
            Arc::new(OutboundSender { tx: out_tx.clone() }),
            user_id,
        )
        .await;
    log::info!("ws client {} connected (user {:?})", client_id, user_id);

    let (mut sink, mut stream) = socket.split();

    // Writer: drains the outbound queue onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let result = match outbound {
                Outbound::Frame(envelope) => match serde_json::to_string(&envelope) {
                    Ok(text) => sink.send(Message::Text(text.into())).await,
                    Err(_) => continue,
                },
                Outbound::Close(code) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: axum::extract::ws::Utf8Bytes::from_static(""),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    // Heartbeat watchdog: ping on an interval, drop on a stale pong.
    let heartbeat = {
        let manager = Arc::clone(&manager);
        let client_id = client_id.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let ping = WsEnvelope::new(
                    manager.envelope_version(),
                    "ping",
                    "system",
                    serde_json::json!({}),
                );
                if out_tx.send(Outbound::Frame(ping)).is_err() {
                    break;
                }
                if manager.client_stale(&client_id, WATCHDOG_WINDOW).await {
                    let _ = out_tx.send(Outbound::Close(1001));
                    manager.disconnect(&client_id).await;
                    break;
                }
            }
        })
    };

    // Reader: every text frame goes through the manager.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                match manager.handle_ingress(&client_id, text.as_str()).await {
                    IngressOutcome::Continue => {}
                    IngressOutcome::Close(code) => {
                        let _ = out_tx.send(Outbound::Close(code));
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    manager.disconnect(&client_id).await;
    heartbeat.abort();
    drop(out_tx);
    let _ = writer.await;
    log::info!("ws client {} disconnected", client_id);
}

async fn webhook_handler(
    Path(trigger_id): Path<i64>,
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Option<axum::Json<Value>>,
) -> StatusCode {
    // Secret via header, falling back to the body for providers that cannot
    // set custom headers.
    let secret = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| {
            body.as_ref().and_then(|b| {
                b.0.get("secret")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
        })
        .unwrap_or_default();

    match gateway.webhooks.handle(trigger_id, &secret).await {
        WebhookOutcome::Accepted => StatusCode::ACCEPTED,
        WebhookOutcome::Unauthorized => StatusCode::UNAUTHORIZED,
        WebhookOutcome::NotFound => StatusCode::NOT_FOUND,
    }
}
