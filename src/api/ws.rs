use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::controller::AppState;
use crate::subscriptions::{ClientId, Frame, RoomKey, SubscriptionRegistry};

/// Frames a client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientCommand {
    Join { room: RoomKey },
    Leave { room: RoomKey },
}

/// GET /api/v1/ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(st): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, st))
}

async fn handle_socket(socket: WebSocket, st: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(st.cfg.gateway.client_buffer.max(1));
    let replies = tx.clone();
    let subscriptions = st.subscriptions.clone();
    let client = subscriptions.connect(tx);
    info!(client = %client, "websocket client connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    let commands = subscriptions.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    let reply = handle_command(&commands, client, &text);
                    if replies.try_send(reply).is_err() {
                        debug!(client = %client, "reply dropped, client is not reading");
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let released = subscriptions.disconnect(client);
    info!(client = %client, released, "websocket client disconnected");
}

/// Apply one client frame and build the acknowledgement
pub fn handle_command(registry: &SubscriptionRegistry, client: ClientId, text: &str) -> Frame {
    let reply = match serde_json::from_str::<ClientCommand>(text) {
        Ok(ClientCommand::Join { room }) => match registry.join(client, &room) {
            Some(refs) => json!({"event": "joined", "room": room, "data": {"subscribers": refs}}),
            None => json!({"event": "error", "data": {"message": "client not connected"}}),
        },
        Ok(ClientCommand::Leave { room }) => {
            let refs = registry.leave(client, &room);
            json!({"event": "left", "room": room, "data": {"subscribers": refs}})
        }
        Err(e) => {
            debug!(client = %client, error = %e, "invalid client frame");
            json!({"event": "error", "data": {"message": e.to_string()}})
        }
    };
    Arc::from(reply.to_string())
}
