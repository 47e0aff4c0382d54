use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use duet_common::RoomNotice;

use crate::rooms::{JoinOutcome, RoomRegistry};

const WS_OUTBOX_CAPACITY: usize = 128;
/// SDP blobs are the largest frames; 64 KiB leaves plenty of room.
pub const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
const MAX_ROOM_ID_LEN: usize = 64;

pub fn valid_room_id(room_id: &str) -> bool {
    !room_id.is_empty()
        && room_id.len() <= MAX_ROOM_ID_LEN
        && room_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub async fn room_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    State(registry): State<RoomRegistry>,
) -> impl IntoResponse {
    if !valid_room_id(&room_id) {
        return StatusCode::BAD_REQUEST.into_response();
    }

    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, registry, room_id))
        .into_response()
}

async fn handle_socket(stream: WebSocket, registry: RoomRegistry, room_id: String) {
    let id = Uuid::new_v4();
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<String>(WS_OUTBOX_CAPACITY);

    if registry.join(&room_id, id, tx).await == JoinOutcome::Full {
        match RoomNotice::Full.encode() {
            Ok(notice) => {
                let _ = sender.send(Message::Text(notice)).await;
            }
            Err(e) => warn!("failed to encode room notice: {}", e),
        }
        let _ = sender.close().await;
        return;
    }

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        let _ = disconnect_tx.try_send(());
    });

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => break,
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        warn!(room = %room_id, "{} sent a binary frame, disconnecting", id);
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > WS_MAX_TEXT_BYTES {
                    warn!(room = %room_id, "{} sent an oversized frame, disconnecting", id);
                    break;
                }
                registry.relay(&room_id, id, text).await;
            }
        }
    }

    registry.leave(&room_id, id).await;
    info!(room = %room_id, "{} disconnected", id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_rules() {
        assert!(valid_room_id("lab-7_b"));
        assert!(!valid_room_id(""));
        assert!(!valid_room_id("../etc"));
        assert!(!valid_room_id(&"x".repeat(MAX_ROOM_ID_LEN + 1)));
    }
}
