//! WebSocket handler pushing discovery snapshots

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use beamlink_core::DeviceDescriptor;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    #[serde(rename = "devices")]
    Devices(Vec<DeviceDescriptor>),
    #[serde(rename = "pong")]
    Pong,
}

impl WsMessage {
    fn to_text(&self) -> Option<Message> {
        serde_json::to_string(self).ok().map(|json| Message::Text(json.into()))
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut snapshots = state.subscribe();

    info!("WebSocket client connected");

    // Current devices first, then every delivery
    let initial = WsMessage::Devices(state.feed.snapshot().await);
    if let Some(msg) = initial.to_text() {
        if sender.send(msg).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => {
                match snapshot {
                    Ok(devices) => {
                        if let Some(msg) = WsMessage::Devices(devices).to_text() {
                            if sender.send(msg).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Snapshot channel lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) if text.as_str() == "ping" => {
                        if let Some(pong) = WsMessage::Pong.to_text() {
                            if sender.send(pong).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamlink_core::DeviceDescriptor;

    #[test]
    fn test_message_shape() {
        let msg = WsMessage::Devices(vec![DeviceDescriptor::new("abc", "10.0.0.2", "fbm1")]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "devices");
        assert_eq!(value["data"][0]["uuid"], "abc");

        let pong = serde_json::to_value(&WsMessage::Pong).unwrap();
        assert_eq!(pong, serde_json::json!({"type": "pong"}));
    }
}
