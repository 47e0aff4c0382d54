//! Session engine for Duet built on webrtc-rs.
//!
//! [`RtcEngine`] owns one `RTCPeerConnection`, turns its callbacks into
//! [`EngineEvent`](duet_signaling::EngineEvent)s and keeps the data channels
//! opened by either side.

#![forbid(unsafe_code)]

pub mod convert;
mod engine;

pub use engine::RtcEngine;
