//! WebSocket control channel: session signaling out, input events in.
//!
//! Clients receive a session-status frame whenever the active stream
//! changes and may send input events back. Actual input injection is owned
//! by the platform input driver; the channel validates and forwards.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

/// Poll cadence for session-status changes.
const STATUS_POLL: Duration = Duration::from_millis(500);

/// Inbound control messages. Unknown types are rejected by the parser and
/// skipped so the protocol can grow without breaking older hosts.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ControlMessage {
    Input {
        #[serde(default)]
        kind: String,
    },
    Ping,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut shutdown = state.shutdown_signal();
    let mut ticker = tokio::time::interval(STATUS_POLL);
    let mut last_active: Option<bool> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let session = state.sessions.active().await;
                let active = session.is_some();
                if last_active == Some(active) {
                    continue;
                }
                last_active = Some(active);

                let status = json!({
                    "type": "sessionStatus",
                    "active": active,
                    "app_name": session.as_ref().map(|s| s.app_name.clone()),
                    "client_name": session.as_ref().map(|s| s.launch.device_name.clone()),
                });
                if sender.send(Message::Text(status.to_string())).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                let Some(Ok(message)) = message else { break };
                match message {
                    Message::Text(text) => handle_control(&text, &mut sender).await,
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn handle_control(text: &str, sender: &mut SplitSink<WebSocket, Message>) {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage::Input { kind }) => {
            // Hand-off point for the platform input driver
            tracing::debug!(kind = %kind, "Input event received over control channel");
        }
        Ok(ControlMessage::Ping) => {
            let _ = sender
                .send(Message::Text(json!({"type": "pong"}).to_string()))
                .await;
        }
        Err(_) => tracing::trace!("Ignoring unknown control message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_parse_and_tolerate_unknown() {
        assert!(matches!(
            serde_json::from_str::<ControlMessage>(r#"{"type":"ping"}"#),
            Ok(ControlMessage::Ping)
        ));
        assert!(matches!(
            serde_json::from_str::<ControlMessage>(r#"{"type":"input","kind":"mouse"}"#),
            Ok(ControlMessage::Input { .. })
        ));
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"future"}"#).is_err());
    }
}
