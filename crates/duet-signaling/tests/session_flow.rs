//! End-to-end negotiation through the session actor with a scripted
//! transport and engine.
//!
//! Covers:
//! - initiator and joiner happy paths
//! - early remote candidates held until the remote description lands
//! - frames produced before the role is known
//! - bye, disconnect, protocol, transport and engine failures

mod common;

use std::sync::Arc;

use common::*;
use duet_common::{Error, Role, SessionParameters, SignalingMessage};
use duet_signaling::{
    CloseReason, EngineEvent, EngineOp, NegotiationState, Session, SessionEvent, SessionEvents,
    SessionHandle, SessionOptions, SignalingClient, TransportEvent,
};

fn start(
    transport: &Arc<MockTransport>,
    engine: &Arc<MockEngine>,
) -> (SessionHandle, SessionEvents) {
    let client = SignalingClient::new(transport.clone());
    Session::spawn(
        client,
        engine.clone(),
        SessionParameters::well_known(),
        SessionOptions::default(),
    )
    .expect("Failed to start session")
}

async fn negotiated_initiator() -> (
    Arc<MockTransport>,
    Arc<MockEngine>,
    SessionHandle,
    SessionEvents,
) {
    let transport = MockTransport::new();
    let engine = MockEngine::new();
    let (session, mut events) = start(&transport, &engine);

    transport.emit(TransportEvent::BecameInitiator);
    transport.emit(TransportEvent::PeerJoined);
    wait_until(|| transport.sent().contains(&offer())).await;
    transport.deliver(&answer());
    expect_event(&mut events, |e| *e == SessionEvent::Negotiated).await;
    (transport, engine, session, events)
}

#[tokio::test]
async fn test_initiator_negotiates() {
    let transport = MockTransport::new();
    let engine = MockEngine::new();
    let (session, mut events) = start(&transport, &engine);

    transport.emit(TransportEvent::BecameInitiator);
    assert_eq!(next_event(&mut events).await, SessionEvent::Role(Role::Initiator));
    transport.emit(TransportEvent::PeerJoined);

    wait_until(|| transport.sent().contains(&offer())).await;
    assert_eq!(session.state(), NegotiationState::AwaitingAnswer);
    assert!(session.controller().is_initiator().unwrap());

    // Arrives before the answer, so it must wait for it.
    transport.deliver(&SignalingMessage::Candidate(candidate(1)));
    transport.deliver(&answer());

    expect_event(&mut events, |e| *e == SessionEvent::Negotiated).await;
    wait_until(|| engine.calls().len() >= 6).await;
    assert_eq!(
        engine.calls()[..6],
        [
            "start".to_string(),
            "create-data-channel:commands".to_string(),
            "create-offer".to_string(),
            "set-local-description:offer".to_string(),
            "set-remote-description:answer".to_string(),
            format!("add-ice-candidate:{}", candidate(1).candidate),
        ]
    );

    // Once negotiated, candidates go straight to the engine.
    transport.deliver(&SignalingMessage::Candidate(candidate(2)));
    wait_until(|| engine.calls().len() == 7).await;

    session.disconnect();
    session.join().await.expect("Failed to close session");
    assert_eq!(transport.sent().last(), Some(&SignalingMessage::Bye));
    assert_eq!(engine.closes(), 1);
    assert_eq!(transport.closes(), 1);
}

#[tokio::test]
async fn test_joiner_negotiates() {
    let transport = MockTransport::new();
    let engine = MockEngine::new();
    let (session, mut events) = start(&transport, &engine);

    transport.emit(TransportEvent::JoinedExistingRoom);
    assert_eq!(next_event(&mut events).await, SessionEvent::Role(Role::Joiner));
    transport.deliver(&offer());

    expect_event(&mut events, |e| *e == SessionEvent::Negotiated).await;
    assert_eq!(transport.sent(), vec![answer()]);
    assert_eq!(
        engine.calls(),
        vec![
            "start",
            "set-remote-description:offer",
            "create-answer",
            "set-local-description:answer",
        ]
    );
    assert!(!session.controller().is_initiator().unwrap());
    assert_eq!(session.state(), NegotiationState::Negotiated);

    session.disconnect();
    session.join().await.expect("Failed to close session");
}

#[tokio::test]
async fn test_joiner_applies_early_candidates_after_offer_in_order() {
    let transport = MockTransport::new();
    let engine = MockEngine::new();
    let (session, mut events) = start(&transport, &engine);

    transport.emit(TransportEvent::JoinedExistingRoom);
    for n in 1..=3 {
        transport.deliver(&SignalingMessage::Candidate(candidate(n)));
    }
    transport.deliver(&offer());
    expect_event(&mut events, |e| *e == SessionEvent::Negotiated).await;

    let calls = engine.calls();
    let remote_at = calls
        .iter()
        .position(|c| c == "set-remote-description:offer")
        .expect("offer never applied");
    let added: Vec<(usize, &String)> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.starts_with("add-ice-candidate:"))
        .collect();
    assert_eq!(added.len(), 3);
    for (i, (at, call)) in added.iter().enumerate() {
        assert!(*at > remote_at, "candidate applied before the offer: {calls:?}");
        assert!(call.ends_with(&candidate(i as u16 + 1).candidate));
    }

    session.disconnect();
    session.join().await.expect("Failed to close session");
}

#[tokio::test]
async fn test_local_candidates_wait_for_role() {
    let transport = MockTransport::new();
    let engine = MockEngine::new();
    let (session, _events) = start(&transport, &engine);

    engine.emit(EngineEvent::LocalCandidate(candidate(1))).await;
    engine.emit(EngineEvent::LocalCandidate(candidate(2))).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(transport.sent_raw().is_empty());

    transport.emit(TransportEvent::JoinedExistingRoom);
    wait_until(|| transport.sent().len() == 2).await;
    assert_eq!(
        transport.sent(),
        vec![
            SignalingMessage::Candidate(candidate(1)),
            SignalingMessage::Candidate(candidate(2)),
        ]
    );

    session.disconnect();
    session.join().await.expect("Failed to close session");
}

#[tokio::test]
async fn test_candidate_before_role_is_fatal() {
    let transport = MockTransport::new();
    let engine = MockEngine::new();
    let (session, mut events) = start(&transport, &engine);

    transport.deliver(&SignalingMessage::Candidate(candidate(1)));

    let closed = expect_event(&mut events, |e| matches!(e, SessionEvent::Closed(_))).await;
    assert!(matches!(closed, SessionEvent::Closed(CloseReason::Failed(_))));
    let err = session.join().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(engine.closes(), 1);
    assert!(!engine.calls().iter().any(|c| c.starts_with("add-ice-candidate")));
}

#[tokio::test]
async fn test_remote_bye_closes_without_reply() {
    let (transport, engine, session, mut events) = negotiated_initiator().await;
    let before = transport.sent_raw().len();

    transport.deliver(&SignalingMessage::Bye);

    assert_eq!(
        expect_event(&mut events, |e| matches!(e, SessionEvent::Closed(_))).await,
        SessionEvent::Closed(CloseReason::RemoteBye)
    );
    session.join().await.expect("bye is a clean close");
    assert_eq!(transport.sent_raw().len(), before);
    assert_eq!(engine.closes(), 1);
    assert_eq!(transport.closes(), 1);
}

#[tokio::test]
async fn test_unknown_message_type_is_fatal() {
    let (transport, engine, session, mut events) = negotiated_initiator().await;

    transport.deliver_raw(r#"{"type":"ping"}"#);

    expect_event(&mut events, |e| matches!(e, SessionEvent::Closed(CloseReason::Failed(_)))).await;
    let err = session.join().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(ref msg) if msg.contains("ping")));
    assert_eq!(engine.closes(), 1);
}

#[tokio::test]
async fn test_renegotiation_is_rejected() {
    let (transport, _engine, session, _events) = negotiated_initiator().await;

    transport.deliver(&answer());

    let err = session.join().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn test_engine_failure_is_fatal() {
    let transport = MockTransport::new();
    let engine = MockEngine::failing_on(EngineOp::CreateOffer);
    let (session, mut events) = start(&transport, &engine);

    transport.emit(TransportEvent::BecameInitiator);
    transport.emit(TransportEvent::PeerJoined);

    expect_event(&mut events, |e| matches!(e, SessionEvent::Closed(CloseReason::Failed(_)))).await;
    let err = session.join().await.unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
    assert!(!engine.calls().iter().any(|c| c.starts_with("set-local")));
    assert_eq!(engine.closes(), 1);
    // The room is still reachable, so the peer hears about it.
    assert_eq!(transport.sent().last(), Some(&SignalingMessage::Bye));
}

#[tokio::test]
async fn test_transport_error_closes_without_bye() {
    let (transport, engine, session, _events) = negotiated_initiator().await;
    let before = transport.sent_raw().len();

    transport.emit(TransportEvent::Error {
        code: 1011,
        description: "relay restarted".into(),
    });

    let err = session.join().await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(transport.sent_raw().len(), before);
    assert_eq!(engine.closes(), 1);
}

#[tokio::test]
async fn test_send_failure_is_transport_error() {
    let transport = MockTransport::new();
    let engine = MockEngine::new();
    let (session, _events) = start(&transport, &engine);

    transport.fail_sends();
    transport.emit(TransportEvent::JoinedExistingRoom);
    transport.deliver(&offer());

    let err = session.join().await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(engine.closes(), 1);
}

#[tokio::test]
async fn test_disconnect_twice_tears_down_once() {
    let (transport, engine, session, mut events) = negotiated_initiator().await;
    let controller = session.controller();

    controller.disconnect();
    controller.disconnect();
    session.disconnect();

    assert_eq!(
        expect_event(&mut events, |e| matches!(e, SessionEvent::Closed(_))).await,
        SessionEvent::Closed(CloseReason::LocalDisconnect)
    );
    session.join().await.expect("Failed to close session");

    let byes = transport
        .sent()
        .into_iter()
        .filter(|m| *m == SignalingMessage::Bye)
        .count();
    assert_eq!(byes, 1);
    assert_eq!(engine.closes(), 1);
    assert_eq!(transport.closes(), 1);
    assert_eq!(controller.state(), NegotiationState::Closed);
    assert!(matches!(
        controller.send_text("late").await,
        Err(Error::Precondition(_))
    ));
}

#[tokio::test]
async fn test_data_channel_round_trip() {
    let (_transport, engine, session, mut events) = negotiated_initiator().await;

    let err = session.send_text("too early").await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));

    engine.emit(EngineEvent::ChannelOpen("commands".into())).await;
    expect_event(&mut events, |e| *e == SessionEvent::ChannelOpen("commands".into())).await;

    session.send_text("hello").await.expect("Failed to send text");
    assert_eq!(engine.data(), vec![("commands".to_string(), "hello".into())]);

    engine
        .emit(EngineEvent::Data {
            label: "commands".into(),
            payload: "pong".into(),
        })
        .await;
    assert_eq!(
        expect_event(&mut events, |e| matches!(e, SessionEvent::Data { .. })).await,
        SessionEvent::Data {
            label: "commands".into(),
            payload: "pong".into(),
        }
    );

    session.disconnect();
    session.join().await.expect("Failed to close session");
}

#[tokio::test]
async fn test_wait_for_reports_closed_when_session_ends_first() {
    let transport = MockTransport::new();
    let engine = MockEngine::new();
    let (session, _events) = start(&transport, &engine);
    let controller = session.controller();

    transport.emit(TransportEvent::JoinedExistingRoom);
    transport.deliver(&SignalingMessage::Bye);

    assert_eq!(
        controller.wait_for(NegotiationState::Negotiated).await,
        NegotiationState::Closed
    );
    session.join().await.expect("bye is a clean close");
}
