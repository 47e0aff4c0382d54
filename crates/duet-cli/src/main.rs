//! Duet CLI: run a room server, or join a room and chat over a data channel.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duet_common::SessionParameters;
use duet_room::RoomRegistry;
use duet_rtc::RtcEngine;
use duet_signaling::{
    Session, SessionEvent, SessionOptions, SignalingClient, WebSocketConnector,
    DEFAULT_DATA_CHANNEL,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "duet")]
#[command(about = "Two-party WebRTC sessions over a signaling room")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a room server
    Serve {
        /// Address to listen on
        #[arg(short, long, env = "DUET_ROOM_LISTEN", default_value = "127.0.0.1:8787")]
        listen: SocketAddr,
    },

    /// Join a room and exchange text with the other participant
    Join {
        /// Room server base URL (ws:// or wss://)
        #[arg(short, long, env = "DUET_ROOM_URL", default_value = "ws://127.0.0.1:8787")]
        server: String,

        /// Room name
        room: String,

        /// JSON file with ICE servers (defaults to $DUET_ICE_SERVERS, then built-ins)
        #[arg(long)]
        ice_config: Option<PathBuf>,

        /// Data channel label
        #[arg(long, default_value = DEFAULT_DATA_CHANNEL)]
        channel: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    duet_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Serve { listen } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(listen))?;
        }
        Command::Join {
            server,
            room,
            ice_config,
            channel,
        } => {
            let params = match ice_config {
                Some(path) => SessionParameters::load(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => SessionParameters::from_env()?,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(join(server, room, params, channel))?;
        }
        Command::Version => {
            println!("duet {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

async fn serve(listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    tokio::select! {
        result = duet_room::serve(listener, RoomRegistry::new()) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down room server"),
    }
    Ok(())
}

async fn join(
    server: String,
    room: String,
    params: SessionParameters,
    channel: String,
) -> Result<()> {
    let connector = WebSocketConnector::for_room(&server, &room)?;
    println!("Joining {}...", connector.url());
    let client = SignalingClient::new(Arc::new(connector));
    let (session, mut events) = Session::spawn(
        client,
        Arc::new(RtcEngine::new()),
        params,
        SessionOptions {
            data_channel_label: channel,
        },
    )?;
    let controller = session.controller();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::Role(role)) => println!("In the room as {}", role),
                Some(SessionEvent::Negotiated) => {
                    println!("Session negotiated, waiting for the channel...");
                }
                Some(SessionEvent::ChannelOpen(label)) => {
                    println!("Channel `{}` open, type to send", label);
                }
                Some(SessionEvent::Data { label, payload }) => {
                    println!("[{}] {}", label, String::from_utf8_lossy(&payload));
                }
                Some(SessionEvent::Closed(reason)) => {
                    println!("Session closed: {}", reason);
                    break;
                }
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = controller.send_text(line).await {
                        warn!("message not sent: {}", e);
                    }
                }
                Ok(None) => {
                    stdin_open = false;
                    controller.disconnect();
                }
                Err(e) => {
                    warn!("stdin failed: {}", e);
                    stdin_open = false;
                    controller.disconnect();
                }
            },
            _ = tokio::signal::ctrl_c() => controller.disconnect(),
        }
    }

    session.join().await?;
    Ok(())
}
