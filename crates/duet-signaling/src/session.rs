//! Session actor.
//!
//! One task owns the [`Negotiator`] and applies every input to it in turn:
//! transport events, engine completions, engine events and local commands
//! all meet in a single `select!` loop, so transitions never overlap.

use std::sync::Arc;

use bytes::Bytes;
use duet_common::{Error, Result, Role, SessionParameters, SignalingMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::client::SignalingClient;
use crate::engine::{Completion, EngineEvent, EngineWorker, SessionEngine};
use crate::negotiation::{Action, CloseReason, Input, NegotiationState, Negotiator};
use crate::transport::{TransportEvent, TransportEvents};

/// Label of the data channel the initiator opens.
pub const DEFAULT_DATA_CHANNEL: &str = "commands";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub data_channel_label: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            data_channel_label: DEFAULT_DATA_CHANNEL.to_string(),
        }
    }
}

/// What the session reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Role(Role),
    Negotiated,
    ChannelOpen(String),
    Data { label: String, payload: Bytes },
    Closed(CloseReason),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

enum Control {
    Disconnect,
    SendText {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable remote control for a running session.
#[derive(Clone)]
pub struct SessionController {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<NegotiationState>,
    client: Arc<SignalingClient>,
}

impl SessionController {
    /// Ask the session to close. Repeated calls are no-ops.
    pub fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    /// Send `text` over the session's data channel.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::SendText {
                text: text.into(),
                reply,
            })
            .map_err(|_| Error::precondition("session is closed"))?;
        rx.await
            .map_err(|_| Error::precondition("session is closed"))?
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`. Returns the state actually
    /// reached, which is `Closed` if the session ended first.
    pub async fn wait_for(&self, target: NegotiationState) -> NegotiationState {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target || s.is_closed())
            .await
            .map(|s| *s)
            .unwrap_or(NegotiationState::Closed)
    }

    pub fn is_initiator(&self) -> Result<bool> {
        self.client.is_initiator()
    }

    pub fn session_parameters(&self) -> Result<Arc<SessionParameters>> {
        self.client.session_parameters()
    }
}

/// Owner's handle: a controller plus the actor task.
pub struct SessionHandle {
    controller: SessionController,
    task: JoinHandle<Result<()>>,
}

impl SessionHandle {
    pub fn controller(&self) -> SessionController {
        self.controller.clone()
    }

    pub fn disconnect(&self) {
        self.controller.disconnect();
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.controller.send_text(text).await
    }

    pub fn state(&self) -> NegotiationState {
        self.controller.state()
    }

    /// Wait for the session to end. `Err` carries the fatal error, if any.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::internal(format!("session task failed: {}", e)))?
    }
}

/// Entry point for running a negotiated session.
pub struct Session;

impl Session {
    /// Connect `client` and run negotiation against `engine` on a new task.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(
        client: SignalingClient,
        engine: Arc<dyn SessionEngine>,
        params: SessionParameters,
        options: SessionOptions,
    ) -> Result<(SessionHandle, SessionEvents)> {
        let client = Arc::new(client);
        let transport = client.connect(params)?;
        let params = client.session_parameters()?;

        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (engine_events_tx, engine_events) = mpsc::unbounded_channel();
        let worker = EngineWorker::spawn(engine, completions_tx);
        worker.start(params, engine_events_tx)?;

        let (control_tx, control) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::AwaitingRole);

        let actor = SessionActor {
            client: client.clone(),
            negotiator: Negotiator::new(options.data_channel_label.clone()),
            worker,
            events: events_tx,
            state: state_tx,
            label: options.data_channel_label,
            channel_open: false,
            torn_down: false,
        };
        let task = tokio::spawn(actor.run(transport, control, completions, engine_events));

        let controller = SessionController {
            control: control_tx,
            state: state_rx,
            client,
        };
        Ok((SessionHandle { controller, task }, events))
    }
}

struct SessionActor {
    client: Arc<SignalingClient>,
    negotiator: Negotiator,
    worker: EngineWorker,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<NegotiationState>,
    label: String,
    channel_open: bool,
    torn_down: bool,
}

impl SessionActor {
    async fn run(
        mut self,
        mut transport: TransportEvents,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Result<()> {
        let mut outcome = Ok(());

        while !self.torn_down {
            let step = tokio::select! {
                Some(command) = control.recv() => self.on_control(command),
                Some(event) = transport.recv() => self.on_transport(event),
                Some(completion) = completions.recv() => self.apply(Input::Completed(completion)),
                Some(event) = engine_events.recv() => self.on_engine_event(event),
                else => Err(Error::internal("every session input closed")),
            };
            if let Err(err) = step {
                self.fail(&err);
                outcome = Err(err);
            }
        }

        // Anyone still waiting on a send gets a definite answer.
        control.close();
        while let Ok(command) = control.try_recv() {
            if let Control::SendText { reply, .. } = command {
                let _ = reply.send(Err(Error::precondition("session is closed")));
            }
        }

        self.worker.finish().await;
        debug!("session actor finished");
        outcome
    }

    fn apply(&mut self, input: Input) -> Result<()> {
        let before = self.negotiator.state();
        let result = match self.negotiator.handle(input) {
            Ok(actions) => actions
                .into_iter()
                .try_for_each(|action| self.execute(action)),
            Err(err) => Err(err),
        };
        self.publish(before);
        result
    }

    fn execute(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Engine(call) => self.worker.call(call),
            Action::Send(message) => self.client.send(&message),
            Action::Teardown(reason) => {
                let notify_peer = reason == CloseReason::LocalDisconnect;
                self.teardown(reason, notify_peer);
                Ok(())
            }
        }
    }

    fn on_control(&mut self, command: Control) -> Result<()> {
        match command {
            Control::Disconnect => {
                info!("local disconnect requested");
                self.apply(Input::Disconnect)
            }
            Control::SendText { text, reply } => {
                if self.torn_down || self.negotiator.state().is_closed() {
                    let _ = reply.send(Err(Error::precondition("session is closed")));
                } else if !self.channel_open {
                    let _ = reply.send(Err(Error::precondition(format!(
                        "data channel `{}` is not open",
                        self.label
                    ))));
                } else {
                    self.worker
                        .send_data(self.label.clone(), Bytes::from(text), reply);
                }
                Ok(())
            }
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::BecameInitiator => self.establish(Role::Initiator),
            TransportEvent::JoinedExistingRoom => self.establish(Role::Joiner),
            TransportEvent::PeerJoined => {
                info!("peer joined the room");
                self.apply(Input::PeerJoined)
            }
            TransportEvent::Message(text) => {
                let message = SignalingMessage::decode(&text)?;
                debug!("received {} message", message.type_name());
                self.apply(Input::Remote(message))
            }
            TransportEvent::Closed => {
                Err(Error::transport("signaling channel closed unexpectedly"))
            }
            TransportEvent::Error { code, description } => Err(Error::transport(format!(
                "signaling channel error {}: {}",
                code, description
            ))),
        }
    }

    fn establish(&mut self, role: Role) -> Result<()> {
        self.client.establish_role(role)?;
        let _ = self.events.send(SessionEvent::Role(role));
        self.apply(Input::Role(role))
    }

    fn on_engine_event(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::LocalCandidate(candidate) => self.apply(Input::LocalCandidate(candidate)),
            EngineEvent::ChannelOpen(label) => {
                if label == self.label {
                    self.channel_open = true;
                    info!("data channel `{}` open", label);
                } else {
                    debug!("unrelated data channel `{}` open", label);
                }
                let _ = self.events.send(SessionEvent::ChannelOpen(label));
                Ok(())
            }
            EngineEvent::Data { label, payload } => {
                let _ = self.events.send(SessionEvent::Data { label, payload });
                Ok(())
            }
            EngineEvent::Failed(reason) => Err(Error::engine(reason)),
        }
    }

    fn publish(&mut self, before: NegotiationState) {
        let now = self.negotiator.state();
        if now == before {
            return;
        }
        self.state.send_replace(now);
        if now == NegotiationState::Negotiated {
            info!("session negotiated");
            let _ = self.events.send(SessionEvent::Negotiated);
        }
    }

    fn fail(&mut self, err: &Error) {
        error!("session failed: {}", err);
        let before = self.negotiator.state();
        self.negotiator.abort();
        // A broken channel cannot carry a bye.
        let notify_peer = !err.is_transport();
        self.teardown(CloseReason::Failed(err.to_string()), notify_peer);
        self.publish(before);
    }

    /// Release the engine and the signaling channel. Runs once per session.
    fn teardown(&mut self, reason: CloseReason, notify_peer: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.channel_open = false;
        self.worker.close();

        if notify_peer {
            self.client.disconnect();
        } else {
            self.client.close();
        }
        info!("session closed: {}", reason);
        let _ = self.events.send(SessionEvent::Closed(reason));
    }
}
