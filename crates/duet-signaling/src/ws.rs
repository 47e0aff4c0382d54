//! WebSocket transport for the `duet-room` relay.
//!
//! The socket lives on its own task. The channel handle only pushes frames
//! into an mpsc queue, so `send` never waits for the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use duet_common::{Error, Result, RoomNotice};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::transport::{TransportChannel, TransportConnector, TransportEvent, TransportEventSink};

/// Error code reported when the room already holds two participants.
pub const ROOM_FULL_CODE: i32 = 4409;
/// Error code for socket-level failures (connect, read, write).
pub const SOCKET_ERROR_CODE: i32 = -1;

/// Opens WebSocket channels to one room URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Result<Self> {
        let url =
            Url::parse(url).map_err(|e| Error::config(format!("invalid room URL {url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(Error::config(format!(
                "room URL must use ws:// or wss://, got {other}://"
            ))),
        }
    }

    /// `base` joined with `/rooms/<room>`.
    pub fn for_room(base: &str, room: &str) -> Result<Self> {
        if room.is_empty()
            || !room
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::config(format!("invalid room name {room:?}")));
        }
        let base = base.trim_end_matches('/');
        Self::new(&format!("{base}/rooms/{room}"))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl TransportConnector for WebSocketConnector {
    fn open(&self, events: TransportEventSink) -> Result<Arc<dyn TransportChannel>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::precondition("WebSocket transport needs a tokio runtime"))?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        runtime.spawn(run_socket(self.url.clone(), outbound_rx, events));
        Ok(Arc::new(WebSocketChannel {
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
        }))
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct WebSocketChannel {
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl TransportChannel for WebSocketChannel {
    fn send(&self, text: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport("signaling socket closed"));
        }
        self.outbound
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| Error::transport("signaling socket is gone"))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

async fn run_socket(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEventSink,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("failed to reach signaling room {}: {}", url, e);
            let _ = events.send(TransportEvent::Error {
                code: SOCKET_ERROR_CODE,
                description: e.to_string(),
            });
            return;
        }
    };
    info!("connected to signaling room {}", url);
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        let _ = events.send(TransportEvent::Error {
                            code: SOCKET_ERROR_CODE,
                            description: e.to_string(),
                        });
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("closing signaling socket");
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    break;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(classify(text.as_str()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let event = match frame {
                        Some(frame) if !is_clean_close(frame.code) => {
                            TransportEvent::Error {
                                code: i32::from(u16::from(frame.code)),
                                description: frame.reason.as_str().to_string(),
                            }
                        }
                        _ => TransportEvent::Closed,
                    };
                    let _ = events.send(event);
                    break;
                }
                Some(Ok(Message::Binary(_))) => warn!("ignoring binary signaling frame"),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error {
                        code: SOCKET_ERROR_CODE,
                        description: e.to_string(),
                    });
                    break;
                }
                None => {
                    let _ = events.send(TransportEvent::Closed);
                    break;
                }
            }
        }
    }
}

fn is_clean_close(code: CloseCode) -> bool {
    matches!(code, CloseCode::Normal | CloseCode::Away)
}

/// Room notices become lifecycle events; everything else is a peer frame.
fn classify(text: &str) -> TransportEvent {
    match RoomNotice::parse(text) {
        Some(RoomNotice::Created) => TransportEvent::BecameInitiator,
        Some(RoomNotice::Joined) => TransportEvent::JoinedExistingRoom,
        Some(RoomNotice::PeerJoined) => TransportEvent::PeerJoined,
        Some(RoomNotice::Full) => TransportEvent::Error {
            code: ROOM_FULL_CODE,
            description: "room is full".to_string(),
        },
        None => TransportEvent::Message(text.to_string()),
    }
}
