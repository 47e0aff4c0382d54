//! Two-party session negotiation over a signaling room.
//!
//! [`SignalingClient`] owns the transport and an [`OutboundQueue`] that holds
//! frames until the room tells us our role. [`Negotiator`] is the offer/answer
//! state machine. [`Session`] wires both to a [`SessionEngine`] on a single
//! actor task.

#![forbid(unsafe_code)]

pub mod client;
pub mod engine;
pub mod negotiation;
pub mod queue;
pub mod session;
pub mod transport;
pub mod ws;

pub use client::SignalingClient;
pub use engine::{Completion, EngineCall, EngineEvent, EngineEventSink, EngineOp, SessionEngine};
pub use negotiation::{Action, CloseReason, Input, NegotiationState, Negotiator};
pub use queue::OutboundQueue;
pub use session::{
    Session, SessionController, SessionEvent, SessionEvents, SessionHandle, SessionOptions,
    DEFAULT_DATA_CHANNEL,
};
pub use transport::{
    TransportChannel, TransportConnector, TransportEvent, TransportEventSink, TransportEvents,
};
pub use ws::WebSocketConnector;
