//! WebSocket listener endpoint.
//!
//! A connection is a hub listener. Outbound frames are notifications
//! (`{ "topic", "payload" }`). Inbound frames change the subscription set
//! or publish onto the hub:
//!
//! - `{"subscribe": "<topic>"}`
//! - `{"unsubscribe": "<topic>"}`
//! - `{"publish": {"topic": "<topic>", "payload": <json>}}`
//!
//! A rejected publish is answered with an error frame shaped like the HTTP
//! error body.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::AppState;
use crate::broadcast::{Listener, Notification};
use crate::mutation::MutationError;

#[derive(Debug, Default, Deserialize)]
pub(super) struct WsParams {
    /// Comma-separated topics to subscribe to on connect.
    topics: Option<String>,
}

/// Frames a client may send.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(super) enum ClientFrame {
    Subscribe(String),
    Unsubscribe(String),
    Publish(Notification),
}

/// Split `a,b, c` into trimmed, non-empty topic names.
pub(super) fn parse_topics(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Upgrade to a WebSocket and register the connection as a hub listener.
pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let topics = parse_topics(params.topics.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, topics))
}

/// Pump notifications out and client frames in until either side goes
/// away. The listener is deregistered before returning.
async fn handle_socket(socket: WebSocket, state: AppState, topics: Vec<String>) {
    let mut listener = state.hub.connect();
    for topic in &topics {
        listener.subscribe(topic);
    }
    let conn_id = listener.id();
    info!(conn_id = %conn_id, topics = ?topics, "Listener connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            notification = listener.recv() => {
                let Some(notification) = notification else {
                    // Hub shut down.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let frame = match serde_json::to_string(notification.as_ref()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "Failed to encode notification");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    debug!(conn_id = %conn_id, "WebSocket sink closed");
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = apply_frame(&state, &listener, text.as_str()) {
                        if sink.send(Message::Text(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    listener.close();
    info!(conn_id = %conn_id, "Listener disconnected");
}

/// Apply one inbound frame. Returns a frame to send back, if any.
fn apply_frame(state: &AppState, listener: &Listener, text: &str) -> Option<String> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Subscribe(topic)) => {
            listener.subscribe(&topic);
            None
        }
        Ok(ClientFrame::Unsubscribe(topic)) => {
            listener.unsubscribe(&topic);
            None
        }
        Ok(ClientFrame::Publish(notification)) => {
            match state.mutations.relay(&notification.topic, notification.payload) {
                Ok(report) => {
                    debug!(
                        listener = %listener.id(),
                        topic = %notification.topic,
                        delivered = report.delivered,
                        "Relayed client notification"
                    );
                    None
                }
                Err(e) => Some(error_frame(&e)),
            }
        }
        Err(e) => {
            debug!(listener = %listener.id(), error = %e, "Ignoring unknown frame");
            None
        }
    }
}

fn error_frame(error: &MutationError) -> String {
    json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    })
    .to_string()
}
