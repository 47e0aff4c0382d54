//! Room bookkeeping: who is in which room, and where their frames go.

use std::collections::HashMap;
use std::sync::Arc;

use duet_common::{RoomNotice, SignalingMessage};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A room holds the initiator and at most one joiner.
pub const ROOM_CAPACITY: usize = 2;

pub type Outbox = mpsc::Sender<String>;

struct Member {
    id: Uuid,
    outbox: Outbox,
    said_bye: bool,
}

#[derive(Default)]
struct Room {
    members: Vec<Member>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First in; this member will make the offer.
    Created,
    /// Second in; the first member has been told.
    Joined,
    Full,
}

impl JoinOutcome {
    pub fn notice(self) -> RoomNotice {
        match self {
            JoinOutcome::Created => RoomNotice::Created,
            JoinOutcome::Joined => RoomNotice::Joined,
            JoinOutcome::Full => RoomNotice::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub rooms: usize,
    pub participants: usize,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `id` to `room_id`. Admitted members find their own notice
    /// (`created` or `joined`) at the head of `outbox`; a full room leaves
    /// `outbox` untouched.
    pub async fn join(&self, room_id: &str, id: Uuid, outbox: Outbox) -> JoinOutcome {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_default();
        if room.members.len() >= ROOM_CAPACITY {
            info!(room = %room_id, "rejecting {}: room is full", id);
            return JoinOutcome::Full;
        }

        let outcome = if room.members.is_empty() {
            info!(room = %room_id, "{} created room", id);
            JoinOutcome::Created
        } else {
            info!(room = %room_id, "{} joined room", id);
            JoinOutcome::Joined
        };

        // The newcomer's own notice goes in before anyone can relay to it.
        send_notice(&outbox, outcome.notice());
        for other in &room.members {
            send_notice(&other.outbox, RoomNotice::PeerJoined);
        }
        room.members.push(Member {
            id,
            outbox,
            said_bye: false,
        });
        outcome
    }

    /// Forward `text` verbatim to everyone else in the room. Returns how many
    /// members it reached.
    pub async fn relay(&self, room_id: &str, from: Uuid, text: String) -> usize {
        let is_bye = is_bye(&text);
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        for member in room.members.iter_mut() {
            if member.id == from {
                member.said_bye |= is_bye;
                continue;
            }
            match member.outbox.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(room = %room_id, "dropping frame for {}: {}", member.id, e),
            }
        }
        if delivered == 0 {
            debug!(room = %room_id, "no peer to relay to yet");
        }
        delivered
    }

    /// Remove a member. The one left behind hears a bye unless the leaver
    /// already sent one; an empty room is dropped.
    pub async fn leave(&self, room_id: &str, id: Uuid) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        let Some(pos) = room.members.iter().position(|m| m.id == id) else {
            return;
        };
        let leaver = room.members.remove(pos);

        if !leaver.said_bye {
            match SignalingMessage::Bye.encode() {
                Ok(bye) => {
                    for member in &room.members {
                        let _ = member.outbox.try_send(bye.clone());
                    }
                }
                Err(e) => warn!("failed to encode bye: {}", e),
            }
        }

        if room.members.is_empty() {
            rooms.remove(room_id);
            debug!(room = %room_id, "room closed");
        }
        info!(room = %room_id, "{} left room", id);
    }

    pub async fn stats(&self) -> RoomStats {
        let rooms = self.rooms.read().await;
        RoomStats {
            rooms: rooms.len(),
            participants: rooms.values().map(|r| r.members.len()).sum(),
        }
    }
}

fn send_notice(outbox: &Outbox, notice: RoomNotice) {
    match notice.encode() {
        Ok(text) => {
            if let Err(e) = outbox.try_send(text) {
                warn!("failed to deliver room notice: {}", e);
            }
        }
        Err(e) => warn!("failed to encode room notice: {}", e),
    }
}

fn is_bye(text: &str) -> bool {
    text.contains("bye") && matches!(SignalingMessage::decode(text), Ok(SignalingMessage::Bye))
}
