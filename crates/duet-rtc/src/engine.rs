use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use duet_common::{
    Error, IceCandidate, MediaConstraints, Result, SessionDescription, SessionParameters,
};
use duet_signaling::{EngineEvent, EngineEventSink, SessionEngine};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::convert;

type Channels = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

fn engine_error(context: &'static str) -> impl FnOnce(webrtc::Error) -> Error {
    move |e| Error::engine(format!("{}: {}", context, e))
}

/// [`SessionEngine`] backed by a webrtc-rs peer connection.
#[derive(Default)]
pub struct RtcEngine {
    peer: Mutex<Option<Arc<RTCPeerConnection>>>,
    channels: Channels,
    events: Mutex<Option<EngineEventSink>>,
}

impl RtcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    async fn peer(&self) -> Result<Arc<RTCPeerConnection>> {
        self.peer
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::precondition("peer connection not started"))
    }

    async fn sink(&self) -> Result<EngineEventSink> {
        self.events
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::precondition("peer connection not started"))
    }
}

#[async_trait]
impl SessionEngine for RtcEngine {
    async fn start(&self, params: Arc<SessionParameters>, events: EngineEventSink) -> Result<()> {
        let mut peer = self.peer.lock().await;
        if peer.is_some() {
            return Err(Error::precondition("peer connection already started"));
        }

        let mut m = MediaEngine::default();
        m.register_default_codecs()
            .map_err(engine_error("failed to register codecs"))?;
        let api = APIBuilder::new().with_media_engine(m).build();

        let config = RTCConfiguration {
            ice_servers: params.ice_servers.iter().map(convert::ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(engine_error("failed to create peer connection"))?,
        );

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |c| {
            let candidates = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = c else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidates.send(EngineEvent::LocalCandidate(
                            convert::from_candidate_init(init),
                        ));
                    }
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        let remote_events = events.clone();
        let channels = self.channels.clone();
        pc.on_data_channel(Box::new(move |dc| {
            let events = remote_events.clone();
            let channels = channels.clone();
            Box::pin(async move {
                info!("peer opened data channel `{}`", dc.label());
                wire_channel(dc, events, channels).await;
            })
        }));

        let failures = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let failures = failures.clone();
            Box::pin(async move {
                info!(state = ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    let _ = failures.send(EngineEvent::Failed("peer connection failed".into()));
                }
            })
        }));

        *self.events.lock().await = Some(events);
        *peer = Some(pc);
        info!(
            ice_servers = params.ice_servers.len(),
            "peer connection created"
        );
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<()> {
        let pc = self.peer().await?;
        let dc = pc
            .create_data_channel(label, None)
            .await
            .map_err(engine_error("failed to create data channel"))?;
        wire_channel(dc, self.sink().await?, self.channels.clone()).await;
        Ok(())
    }

    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<SessionDescription> {
        log_constraints(constraints);
        let pc = self.peer().await?;
        let offer = pc
            .create_offer(None)
            .await
            .map_err(engine_error("failed to create offer"))?;
        convert::from_rtc_description(&offer)
    }

    async fn create_answer(&self, constraints: &MediaConstraints) -> Result<SessionDescription> {
        log_constraints(constraints);
        let pc = self.peer().await?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(engine_error("failed to create answer"))?;
        convert::from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let pc = self.peer().await?;
        pc.set_local_description(convert::to_rtc_description(&description)?)
            .await
            .map_err(engine_error("failed to set local description"))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let pc = self.peer().await?;
        pc.set_remote_description(convert::to_rtc_description(&description)?)
            .await
            .map_err(engine_error("failed to set remote description"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let pc = self.peer().await?;
        pc.add_ice_candidate(convert::to_candidate_init(&candidate))
            .await
            .map_err(engine_error("failed to add ICE candidate"))
    }

    async fn send_data(&self, label: &str, payload: Bytes) -> Result<()> {
        let dc = self
            .channels
            .lock()
            .await
            .get(label)
            .cloned()
            .ok_or_else(|| Error::precondition(format!("no data channel `{}`", label)))?;

        let sent = match std::str::from_utf8(&payload) {
            Ok(text) => dc.send_text(text.to_owned()).await,
            Err(_) => dc.send(&payload).await,
        };
        sent.map(|_| ())
            .map_err(engine_error("failed to send on data channel"))
    }

    async fn close(&self) {
        self.channels.lock().await.clear();
        self.events.lock().await.take();
        if let Some(pc) = self.peer.lock().await.take() {
            if let Err(e) = pc.close().await {
                warn!("error closing peer connection: {}", e);
            }
            info!("peer connection closed");
        }
    }
}

async fn wire_channel(dc: Arc<RTCDataChannel>, events: EngineEventSink, channels: Channels) {
    let label = dc.label().to_string();
    channels.lock().await.insert(label.clone(), dc.clone());

    let open_label = label.clone();
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let label = open_label.clone();
        let events = open_events.clone();
        Box::pin(async move {
            info!(channel = %label, "data channel open");
            let _ = events.send(EngineEvent::ChannelOpen(label));
        })
    }));

    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let label = close_label.clone();
        Box::pin(async move {
            debug!(channel = %label, "data channel closed");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let label = label.clone();
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(EngineEvent::Data {
                label,
                payload: msg.data,
            });
        })
    }));
}

fn log_constraints(constraints: &MediaConstraints) {
    // webrtc-rs has no constraint API; data-only sessions need none.
    debug!(
        audio = ?constraints.flag("OfferToReceiveAudio"),
        video = ?constraints.flag("OfferToReceiveVideo"),
        "applying media constraints"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_common::SdpKind;
    use tokio::sync::mpsc;

    fn offline() -> Arc<SessionParameters> {
        Arc::new(SessionParameters {
            ice_servers: Vec::new(),
            constraints: MediaConstraints::data_only(),
        })
    }

    #[tokio::test]
    async fn test_operations_before_start_are_rejected() {
        let engine = RtcEngine::new();
        let err = engine
            .create_offer(&MediaConstraints::data_only())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        // Closing an engine that never started is harmless.
        engine.close().await;
    }

    #[tokio::test]
    async fn test_offer_with_data_channel() {
        let engine = RtcEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(offline(), tx).await.unwrap();
        engine.create_data_channel("commands").await.unwrap();

        let offer = engine
            .create_offer(&MediaConstraints::data_only())
            .await
            .unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        assert!(offer.sdp.contains("application"));

        engine.set_local_description(offer).await.unwrap();
        engine.close().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let engine = RtcEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(offline(), tx.clone()).await.unwrap();
        assert!(matches!(
            engine.start(offline(), tx).await,
            Err(Error::Precondition(_))
        ));
        engine.close().await;
    }

    #[tokio::test]
    async fn test_send_on_unknown_channel_fails() {
        let engine = RtcEngine::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.start(offline(), tx).await.unwrap();
        let err = engine
            .send_data("missing", Bytes::from_static(b"hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        engine.close().await;
    }
}
