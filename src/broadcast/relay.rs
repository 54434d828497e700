//! Client side of a remote broadcast hub.
//!
//! A process without its own hub (the split publisher) forwards
//! notifications to a relay's `/ws` endpoint as publish frames. Delivery is
//! at-most-once like the hub itself: notifications produced while the relay
//! is unreachable are dropped, and the client keeps reconnecting.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::Notification;

/// Delay between connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum SessionEnd {
    /// Every client handle was dropped.
    Drained,
    /// The connection failed or the relay closed it.
    Lost,
}

/// Handle for publishing onto a remote hub. Cheap to clone.
///
/// The connection task runs until every handle is dropped.
#[derive(Clone)]
pub struct RelayClient {
    sender: mpsc::Sender<Notification>,
}

impl RelayClient {
    /// Start the connection task for `url` (e.g. `ws://relay:4002/ws`).
    /// `buffer` bounds notifications waiting to be written.
    pub fn spawn(url: impl Into<String>, buffer: usize) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        tokio::spawn(run(url.into(), receiver));
        Self { sender }
    }

    /// Queue a notification for the relay. Never blocks; returns false if
    /// the notification was dropped.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> bool {
        let notification = Notification {
            topic: topic.to_string(),
            payload,
        };
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(n)) => {
                warn!(topic = %n.topic, "Relay buffer full, dropping notification");
                false
            }
            Err(TrySendError::Closed(n)) => {
                warn!(topic = %n.topic, "Relay task stopped, dropping notification");
                false
            }
        }
    }
}

fn publish_frame(notification: Notification) -> String {
    json!({
        "publish": {
            "topic": notification.topic,
            "payload": notification.payload,
        }
    })
    .to_string()
}

async fn run(url: String, mut outbound: mpsc::Receiver<Notification>) {
    loop {
        info!(url = %url, "Connecting to broadcast relay");
        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                info!(url = %url, "Broadcast relay connected");
                if let SessionEnd::Drained = run_session(ws, &mut outbound).await {
                    debug!("Relay client dropped, closing connection");
                    return;
                }
                warn!(url = %url, "Broadcast relay session ended, reconnecting");
            }
            Err(e) => error!(url = %url, error = %e, "Broadcast relay connection failed"),
        }

        // Drop anything produced while disconnected; stop if the handles are gone.
        let pause = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => break,
                next = outbound.recv() => match next {
                    Some(n) => debug!(topic = %n.topic, "Relay unreachable, dropping notification"),
                    None => return,
                },
            }
        }
    }
}

async fn run_session(ws: RelayStream, outbound: &mut mpsc::Receiver<Notification>) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(notification) = next else {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Drained;
                };
                let topic = notification.topic.clone();
                if let Err(e) = sink.send(Message::Text(publish_frame(notification))).await {
                    error!(topic = %topic, error = %e, "Failed to forward notification");
                    return SessionEnd::Lost;
                }
                debug!(topic = %topic, "Forwarded notification to relay");
            }
            inbound = stream.next() => match inbound {
                // The relay only answers with error frames.
                Some(Ok(Message::Text(text))) => warn!(reply = %text, "Relay rejected notification"),
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Relay closed connection");
                    return SessionEnd::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "Relay receive error");
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Lost,
            },
        }
    }
}
