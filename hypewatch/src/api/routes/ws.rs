//! WebSocket streams of live metrics and hype events.
//!
//! Every connection owns a [`ChannelSink`] registered with the matching broadcast
//! registries. A writer loop drains the sink's queue into the socket, answers text
//! `ping` with `pong` and sends heartbeat pings. The loop also ends as soon as any
//! registry drops the sink, and the sink is then unregistered from all of them.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use chat_source::normalize_channel;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::server::AppState;
use crate::pipeline::messages::PONG;
use crate::pipeline::{BroadcastRegistry, ChannelSink, Sink, SinkId};

/// Queued payloads per connection before deliveries start timing out.
const SINK_QUEUE_CAPACITY: usize = 256;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Create the WebSocket router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics_ws))
        .route("/hype", get(hype_ws))
        .route("/channel/{name}", get(channel_ws))
}

/// Registration of one sink with one or more registries, undone on drop.
pub struct Subscription {
    id: SinkId,
    registries: Vec<Arc<BroadcastRegistry>>,
}

impl Subscription {
    pub fn new(sink: Arc<dyn Sink>, registries: Vec<Arc<BroadcastRegistry>>) -> Self {
        let id = sink.id();
        for registry in &registries {
            registry.register(sink.clone());
        }
        Self { id, registries }
    }

    pub fn id(&self) -> SinkId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for registry in &self.registries {
            registry.unregister(self.id);
        }
    }
}

async fn metrics_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let (sink, rx) = ChannelSink::new(SINK_QUEUE_CAPACITY);
    let closed = sink.closed();
    let subscription = Subscription::new(Arc::new(sink), vec![state.metrics_registry.clone()]);
    ws.on_upgrade(move |socket| handle_socket(socket, rx, closed, subscription, "metrics"))
}

async fn hype_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let (sink, rx) = ChannelSink::new(SINK_QUEUE_CAPACITY);
    let closed = sink.closed();
    let subscription = Subscription::new(Arc::new(sink), vec![state.hype_registry.clone()]);
    ws.on_upgrade(move |socket| handle_socket(socket, rx, closed, subscription, "hype"))
}

/// Metrics and hype events of a single channel.
async fn channel_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let (sink, rx) = ChannelSink::scoped(normalize_channel(&name), SINK_QUEUE_CAPACITY);
    let closed = sink.closed();
    let subscription = Subscription::new(
        Arc::new(sink),
        vec![state.metrics_registry.clone(), state.hype_registry.clone()],
    );
    ws.on_upgrade(move |socket| handle_socket(socket, rx, closed, subscription, "channel"))
}

/// Handle an established WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    mut payloads: mpsc::Receiver<Arc<str>>,
    closed: CancellationToken,
    subscription: Subscription,
    stream: &'static str,
) {
    info!(stream, sink = %subscription.id(), "WebSocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = closed.cancelled() => break, // Dropped by a registry

            payload = payloads.recv() => {
                let Some(body) = payload else {
                    break; // Unregistered by the broadcaster
                };
                if sender.send(Message::Text(body.as_ref().into())).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text.as_str().trim() == "ping" => {
                        if sender.send(Message::Text(PONG.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(stream, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    info!(stream, sink = %subscription.id(), "WebSocket client disconnected");
}
