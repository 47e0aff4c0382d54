//! Offer/answer state machine.
//!
//! [`Negotiator`] is plain synchronous state: it consumes one [`Input`] at a
//! time and answers with the [`Action`]s to perform. It never talks to the
//! engine or the network itself, so the session actor decides how to execute
//! actions and the transitions can be tested without a runtime.

use std::fmt;

use duet_common::{
    Error, IceCandidate, Result, Role, SdpKind, SessionDescription, SignalingMessage,
};
use tracing::{debug, info, trace};

use crate::engine::{Completion, EngineCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    AwaitingRole,
    AwaitingPeer,
    CreatingOffer,
    OfferSent,
    AwaitingAnswer,
    CreatingAnswer,
    AnswerSent,
    Negotiated,
    Closed,
}

impl NegotiationState {
    pub fn is_closed(self) -> bool {
        self == NegotiationState::Closed
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::AwaitingRole => "awaiting-role",
            NegotiationState::AwaitingPeer => "awaiting-peer",
            NegotiationState::CreatingOffer => "creating-offer",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::CreatingAnswer => "creating-answer",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::Negotiated => "negotiated",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// We called disconnect.
    LocalDisconnect,
    /// The peer said bye.
    RemoteBye,
    /// A fatal protocol, transport or engine error.
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocalDisconnect => write!(f, "local disconnect"),
            CloseReason::RemoteBye => write!(f, "peer said bye"),
            CloseReason::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// The transport fixed our role.
    Role(Role),
    /// The second participant arrived (initiator only).
    PeerJoined,
    /// A decoded message from the peer.
    Remote(SignalingMessage),
    /// An engine operation finished.
    Completed(Completion),
    /// The engine gathered a candidate of ours.
    LocalCandidate(IceCandidate),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Engine(EngineCall),
    Send(SignalingMessage),
    /// Release everything. The peer is told bye only on a local disconnect.
    Teardown(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteStatus {
    Absent,
    Pending,
    Applied,
}

#[derive(Debug)]
enum CandidateGate {
    Buffering(Vec<IceCandidate>),
    Released,
}

/// Negotiation state for one session.
///
/// A returned `Err` is fatal: the negotiator is already `Closed` when
/// [`handle`](Self::handle) returns it, and every later input is ignored.
#[derive(Debug)]
pub struct Negotiator {
    state: NegotiationState,
    role: Option<Role>,
    remote: RemoteStatus,
    gate: CandidateGate,
    local: Option<SessionDescription>,
    data_channel: String,
}

impl Negotiator {
    /// `data_channel` is the label the initiator opens before its offer.
    pub fn new(data_channel: impl Into<String>) -> Self {
        Self {
            state: NegotiationState::AwaitingRole,
            role: None,
            remote: RemoteStatus::Absent,
            gate: CandidateGate::Buffering(Vec::new()),
            local: None,
            data_channel: data_channel.into(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Remote candidates held back until a remote description lands.
    pub fn buffered_candidates(&self) -> usize {
        match &self.gate {
            CandidateGate::Buffering(pending) => pending.len(),
            CandidateGate::Released => 0,
        }
    }

    pub fn candidates_released(&self) -> bool {
        matches!(self.gate, CandidateGate::Released)
    }

    /// Apply one input.
    pub fn handle(&mut self, input: Input) -> Result<Vec<Action>> {
        if self.state.is_closed() {
            trace!("negotiation closed, ignoring {:?}", input);
            return Ok(Vec::new());
        }

        let before = self.state;
        let result = self.transition(input);
        if result.is_err() {
            self.state = NegotiationState::Closed;
        }
        if self.state != before {
            debug!("negotiation {} -> {}", before, self.state);
        }
        result
    }

    /// Force `Closed` after a failure detected outside the negotiator.
    /// Returns false if it was already closed.
    pub fn abort(&mut self) -> bool {
        let was_open = !self.state.is_closed();
        self.state = NegotiationState::Closed;
        was_open
    }

    fn transition(&mut self, input: Input) -> Result<Vec<Action>> {
        match input {
            Input::Role(role) => self.on_role(role),
            Input::PeerJoined => self.on_peer_joined(),
            Input::Remote(SignalingMessage::Candidate(candidate)) => {
                self.on_remote_candidate(candidate)
            }
            Input::Remote(SignalingMessage::SessionDescription(description)) => {
                self.on_remote_description(description)
            }
            Input::Remote(SignalingMessage::Bye) => {
                info!("peer said bye");
                self.state = NegotiationState::Closed;
                Ok(vec![Action::Teardown(CloseReason::RemoteBye)])
            }
            Input::Completed(completion) => self.on_completion(completion),
            Input::LocalCandidate(candidate) => {
                Ok(vec![Action::Send(SignalingMessage::Candidate(candidate))])
            }
            Input::Disconnect => {
                self.state = NegotiationState::Closed;
                Ok(vec![Action::Teardown(CloseReason::LocalDisconnect)])
            }
        }
    }

    fn on_role(&mut self, role: Role) -> Result<Vec<Action>> {
        if let Some(current) = self.role {
            return Err(Error::protocol(format!(
                "role {} reported but role is already {}",
                role, current
            )));
        }
        self.role = Some(role);
        self.state = NegotiationState::AwaitingPeer;
        Ok(Vec::new())
    }

    fn on_peer_joined(&mut self) -> Result<Vec<Action>> {
        match (self.role, self.state) {
            (None, _) => Err(Error::protocol("peer joined before our role was known")),
            (Some(Role::Joiner), _) => Err(Error::protocol("peer-joined reported to a joiner")),
            (Some(Role::Initiator), NegotiationState::AwaitingPeer) => {
                self.state = NegotiationState::CreatingOffer;
                Ok(vec![
                    Action::Engine(EngineCall::CreateDataChannel(self.data_channel.clone())),
                    Action::Engine(EngineCall::CreateOffer),
                ])
            }
            (Some(Role::Initiator), state) => Err(Error::protocol(format!(
                "peer joined again while {}",
                state
            ))),
        }
    }

    fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<Vec<Action>> {
        if self.role.is_none() {
            return Err(Error::protocol("candidate received before our role was known"));
        }
        match &mut self.gate {
            CandidateGate::Released => {
                Ok(vec![Action::Engine(EngineCall::AddIceCandidate(candidate))])
            }
            CandidateGate::Buffering(pending) => {
                pending.push(candidate);
                debug!(buffered = pending.len(), "remote candidate held until remote description");
                Ok(Vec::new())
            }
        }
    }

    fn on_remote_description(&mut self, description: SessionDescription) -> Result<Vec<Action>> {
        let Some(role) = self.role else {
            return Err(Error::protocol(format!(
                "{} received before our role was known",
                description.kind
            )));
        };
        if self.remote != RemoteStatus::Absent {
            return Err(Error::protocol(format!(
                "renegotiation is not supported: second remote {}",
                description.kind
            )));
        }

        match (description.kind, role, self.state) {
            (SdpKind::Offer, Role::Joiner, NegotiationState::AwaitingPeer) => {
                self.state = NegotiationState::CreatingAnswer;
            }
            (SdpKind::Answer, Role::Initiator, NegotiationState::AwaitingAnswer) => {}
            (SdpKind::Offer, Role::Initiator, _) => {
                return Err(Error::protocol("initiator received an offer"));
            }
            (SdpKind::Answer, Role::Joiner, _) => {
                return Err(Error::protocol("joiner received an answer"));
            }
            (kind, _, state) => {
                return Err(Error::protocol(format!("unexpected {} while {}", kind, state)));
            }
        }

        self.remote = RemoteStatus::Pending;
        Ok(vec![Action::Engine(EngineCall::SetRemoteDescription(
            description,
        ))])
    }

    fn on_completion(&mut self, completion: Completion) -> Result<Vec<Action>> {
        match completion {
            Completion::Failed { op, reason } => {
                Err(Error::engine(format!("{} failed: {}", op, reason)))
            }
            Completion::Started | Completion::DataChannelCreated | Completion::CandidateAdded => {
                Ok(Vec::new())
            }
            Completion::OfferCreated(offer) => {
                self.expect_state(NegotiationState::CreatingOffer, "offer created")?;
                if offer.kind != SdpKind::Offer {
                    return Err(Error::internal("engine produced an answer for create-offer"));
                }
                self.state = NegotiationState::OfferSent;
                self.local = Some(offer.clone());
                Ok(vec![Action::Engine(EngineCall::SetLocalDescription(offer))])
            }
            Completion::AnswerCreated(answer) => {
                self.expect_state(NegotiationState::CreatingAnswer, "answer created")?;
                if self.remote != RemoteStatus::Applied {
                    return Err(Error::internal("answer created before the offer was applied"));
                }
                if answer.kind != SdpKind::Answer {
                    return Err(Error::internal("engine produced an offer for create-answer"));
                }
                self.state = NegotiationState::AnswerSent;
                self.local = Some(answer.clone());
                Ok(vec![Action::Engine(EngineCall::SetLocalDescription(answer))])
            }
            Completion::LocalDescriptionSet => {
                let description = self
                    .local
                    .take()
                    .ok_or_else(|| Error::internal("local description set but none was created"))?;
                match self.state {
                    NegotiationState::OfferSent => {
                        self.state = NegotiationState::AwaitingAnswer;
                        Ok(vec![Action::Send(SignalingMessage::SessionDescription(
                            description,
                        ))])
                    }
                    NegotiationState::AnswerSent => {
                        self.state = NegotiationState::Negotiated;
                        let mut actions = vec![Action::Send(SignalingMessage::SessionDescription(
                            description,
                        ))];
                        actions.extend(self.release_candidates());
                        Ok(actions)
                    }
                    state => Err(Error::internal(format!(
                        "local description set while {}",
                        state
                    ))),
                }
            }
            Completion::RemoteDescriptionSet => {
                if self.remote != RemoteStatus::Pending {
                    return Err(Error::internal("remote description set twice"));
                }
                self.remote = RemoteStatus::Applied;
                match self.state {
                    NegotiationState::CreatingAnswer => {
                        let mut actions = self.release_candidates();
                        actions.push(Action::Engine(EngineCall::CreateAnswer));
                        Ok(actions)
                    }
                    NegotiationState::AwaitingAnswer => {
                        self.state = NegotiationState::Negotiated;
                        Ok(self.release_candidates())
                    }
                    state => Err(Error::internal(format!(
                        "remote description set while {}",
                        state
                    ))),
                }
            }
        }
    }

    fn expect_state(&self, expected: NegotiationState, what: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::internal(format!("{} while {}", what, self.state)))
        }
    }

    /// Open the gate once; later calls are no-ops.
    fn release_candidates(&mut self) -> Vec<Action> {
        match std::mem::replace(&mut self.gate, CandidateGate::Released) {
            CandidateGate::Buffering(pending) => {
                if !pending.is_empty() {
                    info!("applying {} buffered remote candidate(s)", pending.len());
                }
                pending
                    .into_iter()
                    .map(|candidate| Action::Engine(EngineCall::AddIceCandidate(candidate)))
                    .collect()
            }
            CandidateGate::Released => Vec::new(),
        }
    }
}
