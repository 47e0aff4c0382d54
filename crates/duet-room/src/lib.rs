//! Duet room server.
//!
//! Each room at `/rooms/<id>` holds two participants. The first is told
//! `{"room":"created"}` and becomes the initiator, the second is told
//! `{"room":"joined"}` while the first hears `{"room":"peer_joined"}`.
//! Text frames are relayed verbatim to the other participant; when one side
//! drops, the other receives a `{"type":"bye"}`.

#![forbid(unsafe_code)]

pub mod rooms;
pub mod socket;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use duet_common::Result;
use tokio::net::TcpListener;
use tracing::info;

pub use rooms::{JoinOutcome, RoomRegistry, RoomStats};

async fn health(State(registry): State<RoomRegistry>) -> impl IntoResponse {
    Json(registry.stats().await)
}

pub fn router(registry: RoomRegistry) -> Router {
    Router::new()
        .route("/", get(|| async { "Duet room server" }))
        .route("/health", get(health))
        .route("/rooms/:room_id", get(socket::room_handler))
        .with_state(registry)
}

/// Serve rooms on `listener` until the task is dropped or the socket fails.
pub async fn serve(listener: TcpListener, registry: RoomRegistry) -> Result<()> {
    info!("room server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(registry)).await?;
    Ok(())
}
