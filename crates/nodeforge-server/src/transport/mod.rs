//! Command transport (§6.1): a websocket endpoint carrying JSON command envelopes in
//! and JSON command responses plus broadcast events out.
//!
//! The teacher's own `ws_handler` never got past a placeholder (`axum::Json`, no real
//! upgrade) — this module is a from-scratch `WebSocketUpgrade` handler, in axum's
//! usual idiom, that reuses the teacher's tagged-event/broadcast-channel shape for
//! fanning events out to every connected client while still correlating each command
//! response to the connection that sent it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use nodeforge_core::{Event, EventSink};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::dispatcher::{CommandEnvelope, Dispatcher};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// [`EventSink`] that fans every event out to all currently-connected websocket
/// clients via a broadcast channel. A sender never blocks on a slow subscriber —
/// `broadcast::Sender::send` only fails when there are zero receivers, which just
/// means nobody's listening yet, not an error worth surfacing.
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub events: Arc<BroadcastSink>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let mut writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut events = state.events.subscribe();
    let event_tx = outbound_tx.clone();
    let mut forward_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if event_tx.send(Message::Text(text)).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client lagged behind the event stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let dispatcher = state.dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            let Message::Text(text) = message else { continue };
            let envelope: CommandEnvelope = match serde_json::from_str(&text) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(error = %e, "dropped malformed command envelope");
                    continue;
                }
            };
            let response = dispatcher.dispatch(envelope).await;
            let Ok(text) = serde_json::to_string(&response) else { continue };
            if outbound_tx.send(Message::Text(text)).is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut writer_task => { forward_task.abort(); recv_task.abort(); }
        _ = &mut forward_task => { writer_task.abort(); recv_task.abort(); }
        _ = &mut recv_task => { writer_task.abort(); forward_task.abort(); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeforge_core::EventType;

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new();
        let mut rx = sink.subscribe();
        sink.emit(Event::new(EventType::ServerStopped)).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::ServerStopped);
    }

    #[tokio::test]
    async fn sink_emit_with_no_subscribers_does_not_panic() {
        let sink = BroadcastSink::new();
        sink.emit(Event::new(EventType::ServerStopped)).await;
    }
}
