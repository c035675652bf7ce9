//! Client side of the rendezvous service: hosts announce a room, guests look
//! one up.

use futures_util::{SinkExt, StreamExt};
use roundtable::signal::{
    CODE_PEER_UNAVAILABLE, CODE_UNAVAILABLE_ID, SignalRequest, SignalResponse,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

const MAX_SIGNAL_LINE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("rendezvous service unreachable at {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Room ID not found: {0} (the host may have disconnected)")]
    RoomNotFound(String),
    #[error("room id already in use: {0}")]
    RoomTaken(String),
    #[error("rendezvous protocol error: {0}")]
    Protocol(String),
}

impl SignalError {
    /// Diagnostic category shown alongside the message.
    pub fn category(&self) -> &'static str {
        match self {
            SignalError::Unreachable { .. } => "network",
            SignalError::RoomNotFound(_) => CODE_PEER_UNAVAILABLE,
            SignalError::RoomTaken(_) => CODE_UNAVAILABLE_ID,
            SignalError::Protocol(_) => "server-error",
        }
    }
}

struct SignalConn {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl SignalConn {
    async fn connect(addr: &str) -> Result<Self, SignalError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SignalError::Unreachable {
                addr: addr.to_string(),
                source,
            })?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(r, LinesCodec::new_with_max_length(MAX_SIGNAL_LINE)),
            writer: FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_SIGNAL_LINE)),
        })
    }

    async fn send(&mut self, req: &SignalRequest) -> Result<(), SignalError> {
        send_request(&mut self.writer, req).await
    }

    async fn recv(&mut self) -> Result<SignalResponse, SignalError> {
        parse_reply(self.reader.next().await)
    }
}

async fn send_request(
    writer: &mut FramedWrite<OwnedWriteHalf, LinesCodec>,
    req: &SignalRequest,
) -> Result<(), SignalError> {
    let line = serde_json::to_string(req).map_err(|e| SignalError::Protocol(e.to_string()))?;
    writer
        .send(line)
        .await
        .map_err(|e| SignalError::Protocol(e.to_string()))
}

fn parse_reply(
    line: Option<Result<String, LinesCodecError>>,
) -> Result<SignalResponse, SignalError> {
    match line {
        Some(Ok(line)) => {
            serde_json::from_str(&line).map_err(|e| SignalError::Protocol(e.to_string()))
        }
        Some(Err(e)) => Err(SignalError::Protocol(e.to_string())),
        None => Err(SignalError::Protocol("connection closed".to_string())),
    }
}

fn error_from_code(code: &str, message: String) -> SignalError {
    match code {
        CODE_PEER_UNAVAILABLE => SignalError::RoomNotFound(message),
        CODE_UNAVAILABLE_ID => SignalError::RoomTaken(message),
        _ => SignalError::Protocol(format!("{code}: {message}")),
    }
}

/// Resolve `room_id` to the host's listen address.
pub async fn lookup(rendezvous: &str, room_id: &str) -> Result<String, SignalError> {
    let mut conn = SignalConn::connect(rendezvous).await?;
    conn.send(&SignalRequest::Lookup {
        room_id: room_id.to_string(),
    })
    .await?;
    match conn.recv().await? {
        SignalResponse::Found { addr, .. } => Ok(addr),
        SignalResponse::Error { code, .. } if code == CODE_PEER_UNAVAILABLE => {
            Err(SignalError::RoomNotFound(room_id.to_string()))
        }
        SignalResponse::Error { code, message } => Err(error_from_code(&code, message)),
        other => Err(SignalError::Protocol(format!("unexpected reply {other:?}"))),
    }
}

/// Configuration for a host's room registration.
#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    pub rendezvous: String,
    /// Requested room id. Filled in with the assigned id after the first
    /// successful registration so reconnects keep the same room.
    pub room_id: Option<String>,
    /// Address guests should dial.
    pub addr: String,
    pub reconnect_interval: Duration,
    pub ping_interval: Duration,
}

/// Registration health reported by [`announce`].
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// Registered (or re-registered) under `room_id`.
    Ready { room_id: String },
    /// An established registration dropped; a reconnect is scheduled.
    Disconnected { reason: String },
    /// The first registration failed. The task has stopped.
    Failed { category: String, message: String },
}

/// Keep a room registered until `events` is dropped or the handle aborted.
pub fn announce(config: AnnounceConfig, events: mpsc::Sender<SignalEvent>) -> JoinHandle<()> {
    tokio::spawn(announce_loop(config, events))
}

async fn announce_loop(mut config: AnnounceConfig, events: mpsc::Sender<SignalEvent>) {
    let mut registered_once = false;
    loop {
        match run_registration(&mut config, &events, &mut registered_once).await {
            Ok(()) => break,
            Err(e) if !registered_once => {
                tracing::warn!(rendezvous = %config.rendezvous, err = %e, "room registration failed");
                let _ = events
                    .send(SignalEvent::Failed {
                        category: e.category().to_string(),
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
            Err(e) => {
                tracing::warn!(rendezvous = %config.rendezvous, err = %e, "registration lost, reconnecting");
                if events
                    .send(SignalEvent::Disconnected {
                        reason: e.to_string(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::time::sleep(config.reconnect_interval).await;
            }
        }
    }
}

/// One registration session. `Ok` means the owner went away.
async fn run_registration(
    config: &mut AnnounceConfig,
    events: &mpsc::Sender<SignalEvent>,
    registered_once: &mut bool,
) -> Result<(), SignalError> {
    let mut conn = SignalConn::connect(&config.rendezvous).await?;
    conn.send(&SignalRequest::Register {
        room_id: config.room_id.clone(),
        addr: config.addr.clone(),
    })
    .await?;
    let room_id = match conn.recv().await? {
        SignalResponse::Registered { room_id } => room_id,
        SignalResponse::Error { code, message } => return Err(error_from_code(&code, message)),
        other => return Err(SignalError::Protocol(format!("unexpected reply {other:?}"))),
    };
    tracing::info!(rendezvous = %config.rendezvous, room = %room_id, "room registered");
    config.room_id = Some(room_id.clone());
    *registered_once = true;
    if events.send(SignalEvent::Ready { room_id }).await.is_err() {
        return Ok(());
    }

    let SignalConn {
        mut reader,
        mut writer,
    } = conn;
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.tick().await;
    loop {
        tokio::select! {
            _ = ping.tick() => send_request(&mut writer, &SignalRequest::Ping).await?,
            line = reader.next() => match parse_reply(line)? {
                SignalResponse::Pong => {}
                SignalResponse::Error { code, message } => {
                    tracing::warn!(code = %code, msg = %message, "rendezvous error");
                }
                other => tracing::debug!(reply = ?other, "unexpected rendezvous reply"),
            },
            _ = events.closed() => return Ok(()),
        }
    }
}
