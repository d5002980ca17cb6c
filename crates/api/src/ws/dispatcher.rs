use axum::extract::ws::Message;
use futures::SinkExt;
use serde::Serialize;
use tracing::{debug, warn};

use super::storage::WsStorage;
use crate::state::AppState;

/// Builds a `{type, data}` frame.
pub fn event(kind: &str, data: impl Serialize) -> serde_json::Value {
    serde_json::json!({
        "type": kind,
        "data": data,
    })
}

/// Sends a JSON message to one connection. Unknown ids are ignored.
pub async fn send_to_connection(
    ws_storage: &WsStorage,
    connection_id: &str,
    message: &serde_json::Value,
) {
    let Some(sender) = ws_storage.get_sender(connection_id) else {
        return;
    };
    let text = serde_json::to_string(message).unwrap_or_default();
    let mut guard = sender.lock().await;
    if let Err(e) = guard.send(Message::text(text)).await {
        warn!(%connection_id, %e, "Failed to send WS message");
    } else {
        debug!(%connection_id, "WS message sent");
    }
}

/// Sends a JSON message to each of the given connections.
pub async fn broadcast(ws_storage: &WsStorage, connection_ids: &[String], message: &serde_json::Value) {
    for connection_id in connection_ids {
        send_to_connection(ws_storage, connection_id, message).await;
    }
}

/// Sends to every push member of a meeting, optionally skipping one connection.
pub async fn broadcast_to_meeting(
    state: &AppState,
    meeting_id: &str,
    except: Option<&str>,
    message: &serde_json::Value,
) {
    let recipients: Vec<String> = state
        .rooms
        .members(meeting_id)
        .into_iter()
        .filter(|cid| Some(cid.as_str()) != except)
        .collect();
    if recipients.is_empty() {
        return;
    }
    broadcast(&state.ws_storage, &recipients, message).await;
}
