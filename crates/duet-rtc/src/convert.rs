//! Mapping between Duet's wire types and webrtc-rs types.

use duet_common::{Error, IceCandidate, IceServer, Result, SdpKind, SessionDescription};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub fn ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

pub fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let sdp = description.sdp.clone();
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp),
    };
    converted.map_err(|e| Error::engine(format!("invalid {} SDP: {}", description.kind, e)))
}

pub fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp.clone())),
        other => Err(Error::engine(format!("unsupported SDP type {}", other))),
    }
}

pub fn to_candidate_init(candidate: &IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate.clone(),
        sdp_mid: Some(candidate.sdp_mid.clone()),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        ..Default::default()
    }
}

/// Gathered candidates without a media line are reported against the first one.
pub fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
        sdp_mid: init.sdp_mid.unwrap_or_default(),
        candidate: init.candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_server_keeps_credentials() {
        let server = IceServer::turn("turn:turn.example.org:3478", "alice", "s3cret");
        let rtc = ice_server(&server);
        assert_eq!(rtc.urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(rtc.username, "alice");
        assert_eq!(rtc.credential, "s3cret");
    }

    #[test]
    fn test_stun_server_has_empty_credentials() {
        let rtc = ice_server(&IceServer::stun("stun:stun.l.google.com:19302"));
        assert!(rtc.username.is_empty());
        assert!(rtc.credential.is_empty());
    }

    #[test]
    fn test_description_kinds_survive_conversion() {
        let offer = SessionDescription::offer("v=0\r\n");
        let rtc = to_rtc_description(&offer).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Offer);
        assert_eq!(from_rtc_description(&rtc).unwrap(), offer);

        let answer = SessionDescription::answer("v=0\r\n");
        let rtc = to_rtc_description(&answer).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        assert_eq!(from_rtc_description(&rtc).unwrap(), answer);
    }

    #[test]
    fn test_candidate_fields_map_to_init() {
        let candidate =
            IceCandidate::new(1, "data", "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        let init = to_candidate_init(&candidate);
        assert_eq!(init.sdp_mid.as_deref(), Some("data"));
        assert_eq!(init.sdp_mline_index, Some(1));
        assert_eq!(from_candidate_init(init), candidate);
    }

    #[test]
    fn test_candidate_without_media_line_defaults_to_first() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:2 1 udp 1 10.0.0.3 1 typ host".into(),
            ..Default::default()
        };
        let candidate = from_candidate_init(init);
        assert_eq!(candidate.sdp_mline_index, 0);
        assert_eq!(candidate.sdp_mid, "");
    }
}
