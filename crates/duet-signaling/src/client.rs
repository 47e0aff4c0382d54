//! Signaling client: owns the transport channel and the outbound queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use duet_common::{Error, Result, Role, SessionParameters, SignalingMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::queue::OutboundQueue;
use crate::transport::{TransportChannel, TransportConnector, TransportEvents};

/// Sends signaling messages to the other participant and keeps track of how
/// this participant entered the room.
///
/// All operations take `&self`; the client can be shared between producers.
pub struct SignalingClient {
    connector: Arc<dyn TransportConnector>,
    queue: OutboundQueue,
    channel: Mutex<Option<Arc<dyn TransportChannel>>>,
    params: OnceLock<Arc<SessionParameters>>,
    role: OnceLock<Role>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl SignalingClient {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            connector,
            queue: OutboundQueue::new(),
            channel: Mutex::new(None),
            params: OnceLock::new(),
            role: OnceLock::new(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Record the session parameters and open the transport channel.
    ///
    /// Returns the channel's event stream. The channel is not usable yet:
    /// queued frames go out once a role event arrives and
    /// [`establish_role`](Self::establish_role) is called.
    pub fn connect(&self, params: SessionParameters) -> Result<TransportEvents> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::precondition("connect after disconnect"));
        }
        params.validate()?;
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::precondition("connect called twice"));
        }

        if self.params.set(Arc::new(params)).is_err() {
            return Err(Error::internal("session parameters already resolved"));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = match self.connector.open(events_tx) {
            Ok(channel) => channel,
            Err(err) => {
                warn!("failed to open signaling channel: {}", err);
                return Err(err);
            }
        };

        self.queue.attach(channel.clone());
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel);
        info!("signaling channel opening");
        Ok(events_rx)
    }

    /// Fix the role reported by the transport and start draining the queue.
    ///
    /// The role can be established only once; a second role event is a
    /// protocol error.
    pub fn establish_role(&self, role: Role) -> Result<()> {
        if let Err(rejected) = self.role.set(role) {
            return Err(Error::protocol(format!(
                "room reported role {} but role is already {}",
                rejected,
                self.role.get().copied().unwrap_or(rejected)
            )));
        }
        info!("joined room as {}", role);

        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.queue.mark_ready();
        self.queue.drain_if_ready().map(|_| ())
    }

    /// Queue `message` and try to send everything queued so far.
    ///
    /// Safe before the channel is ready: the message is kept until it is.
    pub fn send(&self, message: &SignalingMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::precondition(format!(
                "cannot send `{}` after the signaling client closed",
                message.type_name()
            )));
        }
        let text = message.encode()?;
        debug!("queueing {} message", message.type_name());
        self.queue.enqueue(text);
        self.queue.drain_if_ready().map(|_| ())
    }

    /// Tell the peer we are leaving (best effort) and close the channel.
    ///
    /// Only the first call does anything.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match SignalingMessage::Bye.encode() {
            Ok(bye) => {
                self.queue.enqueue(bye);
                if let Err(err) = self.queue.drain_if_ready() {
                    warn!("could not deliver bye: {}", err);
                }
            }
            Err(err) => warn!("could not encode bye: {}", err),
        }
        self.shutdown_channel();
        info!("signaling client disconnected");
    }

    /// Close the channel without notifying the peer. Used once the peer has
    /// already said bye or the channel is broken. Only the first call (of this
    /// or [`disconnect`](Self::disconnect)) does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_channel();
        info!("signaling client closed");
    }

    fn shutdown_channel(&self) {
        self.queue.detach();
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = channel {
            channel.close();
        }
    }

    /// Whether we created the room. Only valid once the role is known.
    pub fn is_initiator(&self) -> Result<bool> {
        self.role
            .get()
            .map(|role| role.is_initiator())
            .ok_or_else(|| Error::precondition("role is not known yet"))
    }

    pub fn role(&self) -> Option<Role> {
        self.role.get().copied()
    }

    /// Parameters recorded by [`connect`](Self::connect).
    pub fn session_parameters(&self) -> Result<Arc<SessionParameters>> {
        self.params
            .get()
            .cloned()
            .ok_or_else(|| Error::precondition("session parameters are resolved by connect"))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Frames still waiting for the channel.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
