//! Contract with the physical signaling transport.
//!
//! A transport delivers opaque text frames to and from the room. It reports
//! how this participant entered the room (which fixes the [`Role`](duet_common::Role)),
//! when the other participant arrives, every inbound frame, and its own demise.

use std::sync::Arc;

use duet_common::Result;
use tokio::sync::mpsc;

/// Everything a transport channel can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// We opened an empty room.
    BecameInitiator,
    /// The second participant arrived in our room (initiator only, at most once).
    PeerJoined,
    /// We entered a room created by the other participant.
    JoinedExistingRoom,
    /// One inbound text frame.
    Message(String),
    /// The channel closed.
    Closed,
    /// The channel failed.
    Error { code: i32, description: String },
}

pub type TransportEventSink = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// An open (or opening) channel.
pub trait TransportChannel: Send + Sync {
    /// Hand one frame to the channel. Fire-and-forget: `Ok` means accepted
    /// for sending, not delivered.
    fn send(&self, text: &str) -> Result<()>;

    /// Close the channel. Safe to call more than once.
    fn close(&self);
}

/// Opens channels. `open` must not wait for the network; readiness is
/// reported later through `events`.
pub trait TransportConnector: Send + Sync {
    fn open(&self, events: TransportEventSink) -> Result<Arc<dyn TransportChannel>>;
}
