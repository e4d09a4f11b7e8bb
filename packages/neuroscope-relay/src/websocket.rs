use crate::broadcast::BroadcastManager;
use crate::client::ClientHandle;
use crate::proxy::UpstreamLink;
use crate::relay::RelayMetrics;
use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct RelayState {
    pub manager: BroadcastManager,
    pub metrics: Arc<RelayMetrics>,
    /// websocket topic -> upstream URL for paired topics
    pub upstreams: Arc<HashMap<String, String>>,
    pub heartbeat_interval: Duration,
    pub started_at: Instant,
}

impl RelayState {
    pub fn new(
        manager: BroadcastManager,
        metrics: Arc<RelayMetrics>,
        upstreams: HashMap<String, String>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            manager,
            metrics,
            upstreams: Arc::new(upstreams),
            heartbeat_interval,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Handle WebSocket upgrade on `/ws/{topic}`
pub async fn handle_websocket(
    Path(topic): Path<String>,
    State(state): State<RelayState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.manager.has_topic(&topic) {
        warn!("Rejecting connection to unknown topic {}", topic);
        return (StatusCode::NOT_FOUND, format!("Unknown topic: {}", topic)).into_response();
    }

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, topic, state)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Why a socket write did not complete
enum WriteFailure {
    Socket(axum::Error),
    Stalled,
    Terminated,
}

/// Write one message, giving up after `deadline` or when `closed` resolves
///
/// A client that stops reading blocks the write once the socket buffer is
/// full; the deadline turns that into a connection failure.
async fn write_message<F>(
    sender: &mut SplitSink<WebSocket, Message>,
    message: Message,
    deadline: Duration,
    closed: Pin<&mut F>,
) -> Result<(), WriteFailure>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        result = time::timeout(deadline, sender.send(message)) => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteFailure::Socket(e)),
            Err(_) => Err(WriteFailure::Stalled),
        },
        _ = closed => Err(WriteFailure::Terminated),
    }
}

fn log_write_failure(client_id: Uuid, failure: WriteFailure, deadline: Duration) {
    match failure {
        WriteFailure::Socket(e) => debug!("Send to client {} failed: {}", client_id, e),
        WriteFailure::Stalled => warn!(
            "Client {} stalled for {:?} on a write, terminating",
            client_id, deadline
        ),
        WriteFailure::Terminated => debug!("Client {} terminated by relay", client_id),
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, topic: String, state: RelayState) {
    let (client, mut outbound) = ClientHandle::new();
    let client_id = client.id();
    let (mut sender, mut receiver) = socket.split();

    client.mark_open();

    let upstream = match state.upstreams.get(&topic) {
        Some(url) => match UpstreamLink::connect(url, client.clone()).await {
            Ok(link) => Some(link),
            Err(e) => {
                warn!("Upstream {} unavailable for client {}: {}", url, client_id, e);
                None
            }
        },
        None => None,
    };

    if let Err(e) = state.manager.add_client(&topic, client.clone()) {
        warn!("Client {} not registered: {}", client_id, e);
        return;
    }
    info!("Client {} connected to {}", client_id, topic);

    let period = state.heartbeat_interval;
    let mut heartbeat = time::interval_at(time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong = false;
    let closed = client.closed();
    tokio::pin!(closed);

    loop {
        let (message, release) = tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let len = frame.len();
                (frame.into_message(), len)
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    warn!("Client {} missed heartbeat, terminating", client_id);
                    break;
                }
                awaiting_pong = true;
                (Message::Ping(Bytes::new()), 0)
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Pong(_))) => {
                    awaiting_pong = false;
                    continue;
                }
                Some(Ok(Message::Ping(data))) => (Message::Pong(data), 0),
                Some(Ok(Message::Text(text))) => {
                    match handle_client_text(text.as_str(), upstream.as_ref(), client_id) {
                        Some(reply) => (reply, 0),
                        None => continue,
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring binary message from client {}", client_id);
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection closed by client {}", client_id);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            },
            _ = &mut closed => {
                debug!("Client {} terminated by relay", client_id);
                break;
            }
        };

        let result = write_message(&mut sender, message, period, closed.as_mut()).await;
        client.release(release);
        if let Err(failure) = result {
            log_write_failure(client_id, failure, period);
            break;
        }
    }

    state.manager.remove_client(&topic, client_id);
    if let Some(link) = upstream {
        link.close();
    }
    drop(outbound);
    if time::timeout(period, sender.close()).await.is_err() {
        debug!("Close handshake with client {} timed out", client_id);
    }

    info!("Client {} disconnected from {}", client_id, topic);
}

/// Validate inbound client text and forward it upstream
///
/// Returns the reply to send back, if any.
fn handle_client_text(
    text: &str,
    upstream: Option<&UpstreamLink>,
    client_id: Uuid,
) -> Option<Message> {
    if serde_json::from_str::<Value>(text).is_err() {
        let reply = json!({ "error": "Invalid JSON payload" }).to_string();
        return Some(Message::Text(reply.into()));
    }

    match upstream {
        Some(link) => {
            if let Err(e) = link.forward(text.to_string()) {
                warn!("Dropping message from client {}: {}", client_id, e);
            }
        }
        None => debug!("Client {} sent {} bytes with no upstream", client_id, text.len()),
    }
    None
}
