//! Scripted transport and engine used by the session tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use duet_common::{
    Error, IceCandidate, MediaConstraints, Result, SessionDescription, SessionParameters,
    SignalingMessage,
};
use duet_signaling::{
    EngineEvent, EngineEventSink, EngineOp, SessionEngine, SessionEvent, SessionEvents,
    TransportChannel, TransportConnector, TransportEvent, TransportEventSink,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub const OFFER_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n";
pub const ANSWER_SDP: &str = "v=0\r\no=- 8226440370914522812 2 IN IP4 127.0.0.1\r\n";

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockChannel {
    sent: Mutex<Vec<String>>,
    closes: AtomicUsize,
    fail_sends: std::sync::atomic::AtomicBool,
}

impl TransportChannel for MockChannel {
    fn send(&self, text: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::transport("mock socket write failed"));
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockTransport {
    channel: Arc<MockChannel>,
    sink: Mutex<Option<TransportEventSink>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver a transport event to the session.
    pub fn emit(&self, event: TransportEvent) {
        self.sink
            .lock()
            .unwrap()
            .as_ref()
            .expect("transport not opened")
            .send(event)
            .expect("session stopped listening");
    }

    pub fn deliver(&self, message: &SignalingMessage) {
        self.emit(TransportEvent::Message(message.encode().unwrap()));
    }

    pub fn deliver_raw(&self, text: &str) {
        self.emit(TransportEvent::Message(text.to_string()));
    }

    /// Frames the session handed to the channel, decoded.
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent_raw()
            .iter()
            .map(|text| SignalingMessage::decode(text).expect("session sent a malformed frame"))
            .collect()
    }

    pub fn sent_raw(&self) -> Vec<String> {
        self.channel.sent.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.channel.closes.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self) {
        self.channel.fail_sends.store(true, Ordering::SeqCst);
    }
}

impl TransportConnector for MockTransport {
    fn open(&self, events: TransportEventSink) -> Result<Arc<dyn TransportChannel>> {
        *self.sink.lock().unwrap() = Some(events);
        Ok(self.channel.clone())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine that succeeds instantly (unless told to fail) and logs every call.
#[derive(Default)]
pub struct MockEngine {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<EngineOp>>,
    events: Mutex<Option<EngineEventSink>>,
    data: Mutex<Vec<(String, Bytes)>>,
    closes: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(op: EngineOp) -> Arc<Self> {
        let engine = Self::default();
        *engine.fail_on.lock().unwrap() = Some(op);
        Arc::new(engine)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn data(&self) -> Vec<(String, Bytes)> {
        self.data.lock().unwrap().clone()
    }

    /// Report something on the engine's own initiative.
    pub async fn emit(&self, event: EngineEvent) {
        wait_until(|| self.events.lock().unwrap().is_some()).await;
        if let Some(sink) = self.events.lock().unwrap().as_ref() {
            let _ = sink.send(event);
        }
    }

    fn record(&self, op: EngineOp, detail: impl Into<String>) -> Result<()> {
        let detail = detail.into();
        let entry = if detail.is_empty() {
            op.to_string()
        } else {
            format!("{op}:{detail}")
        };
        self.calls.lock().unwrap().push(entry);
        if *self.fail_on.lock().unwrap() == Some(op) {
            return Err(Error::engine(format!("scripted {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionEngine for MockEngine {
    async fn start(&self, _params: Arc<SessionParameters>, events: EngineEventSink) -> Result<()> {
        *self.events.lock().unwrap() = Some(events);
        self.record(EngineOp::Start, "")
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.record(EngineOp::CreateDataChannel, label)
    }

    async fn create_offer(&self, _constraints: &MediaConstraints) -> Result<SessionDescription> {
        self.record(EngineOp::CreateOffer, "")?;
        Ok(SessionDescription::offer(OFFER_SDP))
    }

    async fn create_answer(&self, _constraints: &MediaConstraints) -> Result<SessionDescription> {
        self.record(EngineOp::CreateAnswer, "")?;
        Ok(SessionDescription::answer(ANSWER_SDP))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(EngineOp::SetLocalDescription, description.kind.as_str())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(EngineOp::SetRemoteDescription, description.kind.as_str())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(EngineOp::AddIceCandidate, candidate.candidate)
    }

    async fn send_data(&self, label: &str, payload: Bytes) -> Result<()> {
        self.data.lock().unwrap().push((label.to_string(), payload));
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push("close".to_string());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate::new(
        0,
        "data",
        format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5140{n} typ host"),
    )
}

pub fn offer() -> SignalingMessage {
    SignalingMessage::SessionDescription(SessionDescription::offer(OFFER_SDP))
}

pub fn answer() -> SignalingMessage {
    SignalingMessage::SessionDescription(SessionDescription::answer(ANSWER_SDP))
}

/// Poll `condition` until it holds, failing the test after [`WAIT`].
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn next_event(events: &mut SessionEvents) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no session event in time")
        .expect("session event stream ended")
}

/// Skip events until one matches.
pub async fn expect_event(
    events: &mut SessionEvents,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}
