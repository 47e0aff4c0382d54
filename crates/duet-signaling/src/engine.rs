//! Contract with the session engine (SDP generation, ICE, data channels) and
//! the worker that drives it.
//!
//! The worker runs engine operations strictly one after another, in the order
//! the negotiator asked for them, and reports each outcome as a [`Completion`].
//! The negotiator never waits on the engine directly.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use duet_common::{
    Error, IceCandidate, MediaConstraints, Result, SessionDescription, SessionParameters,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Things the engine reports on its own initiative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// ICE gathering produced a local candidate for the peer.
    LocalCandidate(IceCandidate),
    /// A data channel finished opening.
    ChannelOpen(String),
    /// A message arrived on a data channel.
    Data { label: String, payload: Bytes },
    /// The engine failed outside of any particular operation.
    Failed(String),
}

pub type EngineEventSink = mpsc::UnboundedSender<EngineEvent>;

/// The media/transport engine the negotiation drives.
///
/// Every operation completes exactly once with success or failure.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    /// Prepare the peer connection for `params`. Spontaneous events go to `events`.
    async fn start(&self, params: Arc<SessionParameters>, events: EngineEventSink) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<()>;

    async fn create_offer(&self, constraints: &MediaConstraints) -> Result<SessionDescription>;

    async fn create_answer(&self, constraints: &MediaConstraints) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn send_data(&self, label: &str, payload: Bytes) -> Result<()>;

    /// Release every engine resource.
    async fn close(&self);
}

/// Negotiation steps the state machine can ask of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateDataChannel(String),
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
}

impl EngineCall {
    pub fn op(&self) -> EngineOp {
        match self {
            EngineCall::CreateDataChannel(_) => EngineOp::CreateDataChannel,
            EngineCall::CreateOffer => EngineOp::CreateOffer,
            EngineCall::CreateAnswer => EngineOp::CreateAnswer,
            EngineCall::SetLocalDescription(_) => EngineOp::SetLocalDescription,
            EngineCall::SetRemoteDescription(_) => EngineOp::SetRemoteDescription,
            EngineCall::AddIceCandidate(_) => EngineOp::AddIceCandidate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Start,
    CreateDataChannel,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineOp::Start => "start",
            EngineOp::CreateDataChannel => "create-data-channel",
            EngineOp::CreateOffer => "create-offer",
            EngineOp::CreateAnswer => "create-answer",
            EngineOp::SetLocalDescription => "set-local-description",
            EngineOp::SetRemoteDescription => "set-remote-description",
            EngineOp::AddIceCandidate => "add-ice-candidate",
        };
        f.write_str(name)
    }
}

/// Outcome of one engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Started,
    DataChannelCreated,
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    LocalDescriptionSet,
    RemoteDescriptionSet,
    CandidateAdded,
    Failed { op: EngineOp, reason: String },
}

enum Job {
    Start(Arc<SessionParameters>, EngineEventSink),
    Call(EngineCall),
    SendData {
        label: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Runs engine operations in order on a dedicated task.
pub(crate) struct EngineWorker {
    jobs: mpsc::UnboundedSender<Job>,
    closing: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl EngineWorker {
    pub(crate) fn spawn(
        engine: Arc<dyn SessionEngine>,
        completions: mpsc::UnboundedSender<Completion>,
    ) -> Self {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_worker(engine, jobs_rx, completions, closing.clone()));
        Self {
            jobs,
            closing,
            task,
        }
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| Error::internal("session engine worker stopped"))
    }

    pub(crate) fn start(
        &self,
        params: Arc<SessionParameters>,
        events: EngineEventSink,
    ) -> Result<()> {
        self.submit(Job::Start(params, events))
    }

    pub(crate) fn call(&self, call: EngineCall) -> Result<()> {
        debug!("engine call queued: {}", call.op());
        self.submit(Job::Call(call))
    }

    pub(crate) fn send_data(
        &self,
        label: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(Job::SendData {
            label,
            payload,
            reply,
        }) {
            if let Job::SendData { reply, .. } = job {
                let _ = reply.send(Err(Error::precondition("session is closed")));
            }
        }
    }

    /// Skip whatever is still queued and release the engine.
    pub(crate) fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.jobs.send(Job::Close).is_err() {
            warn!("session engine worker already gone at close");
        }
    }

    /// Wait until the worker has released the engine.
    pub(crate) async fn finish(self) {
        let EngineWorker { jobs, task, .. } = self;
        drop(jobs);
        if let Err(err) = task.await {
            warn!("session engine worker panicked: {}", err);
        }
    }
}

async fn run_worker(
    engine: Arc<dyn SessionEngine>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    completions: mpsc::UnboundedSender<Completion>,
    closing: Arc<AtomicBool>,
) {
    let mut constraints = MediaConstraints::default();

    while let Some(job) = jobs.recv().await {
        match job {
            Job::Close => {
                debug!("releasing session engine");
                engine.close().await;
                return;
            }
            Job::SendData { reply, .. } if closing.load(Ordering::SeqCst) => {
                let _ = reply.send(Err(Error::precondition("session is closed")));
            }
            _ if closing.load(Ordering::SeqCst) => {}
            Job::Start(params, events) => {
                constraints = params.constraints.clone();
                let completion = match engine.start(params, events).await {
                    Ok(()) => Completion::Started,
                    Err(err) => Completion::Failed {
                        op: EngineOp::Start,
                        reason: err.to_string(),
                    },
                };
                let _ = completions.send(completion);
            }
            Job::Call(call) => {
                let completion = execute(engine.as_ref(), call, &constraints).await;
                let _ = completions.send(completion);
            }
            Job::SendData {
                label,
                payload,
                reply,
            } => {
                let _ = reply.send(engine.send_data(&label, payload).await);
            }
        }
    }
}

async fn execute(
    engine: &dyn SessionEngine,
    call: EngineCall,
    constraints: &MediaConstraints,
) -> Completion {
    let op = call.op();
    let result = match call {
        EngineCall::CreateDataChannel(label) => engine
            .create_data_channel(&label)
            .await
            .map(|()| Completion::DataChannelCreated),
        EngineCall::CreateOffer => engine
            .create_offer(constraints)
            .await
            .map(Completion::OfferCreated),
        EngineCall::CreateAnswer => engine
            .create_answer(constraints)
            .await
            .map(Completion::AnswerCreated),
        EngineCall::SetLocalDescription(description) => engine
            .set_local_description(description)
            .await
            .map(|()| Completion::LocalDescriptionSet),
        EngineCall::SetRemoteDescription(description) => engine
            .set_remote_description(description)
            .await
            .map(|()| Completion::RemoteDescriptionSet),
        EngineCall::AddIceCandidate(candidate) => engine
            .add_ice_candidate(candidate)
            .await
            .map(|()| Completion::CandidateAdded),
    };

    result.unwrap_or_else(|err| {
        warn!("{} failed: {}", op, err);
        Completion::Failed {
            op,
            reason: err.to_string(),
        }
    })
}
