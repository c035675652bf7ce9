//! Reliable ordered point-to-point links between peers: TCP carrying JSON
//! lines.
//!
//! Each side first sends a [`Handshake`] line. A link is open once the remote
//! handshake arrives; every later line is a [`WireMessage`]. One task per link
//! owns the socket and reports everything it sees as [`LinkEvent`]s.

use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use roundtable::wire::{self, Inbound, MAX_FRAME_BYTES, WireMessage};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Version announced in the link handshake.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Handshake {
    peer_id: String,
    version: String,
}

/// Something that happened on a link.
#[derive(Debug)]
pub enum LinkEvent {
    /// The listener accepted a connection. Not yet open.
    Accepted(PeerLink),
    /// The remote handshake arrived.
    Open { link: LinkId, remote_peer: String },
    /// A decoded message from an open link.
    Data { link: LinkId, message: WireMessage },
    /// The link is gone. Always the last event for a link.
    Closed { link: LinkId },
    Error { link: LinkId, message: String },
}

/// Handle for sending on a link. Dropping every clone closes the link.
#[derive(Debug, Clone)]
pub struct PeerLink {
    id: LinkId,
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
}

impl PeerLink {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Queue `message` for sending. Never blocks. Fails for frames over
    /// [`MAX_FRAME_BYTES`].
    pub fn send(&self, message: &WireMessage) -> Result<()> {
        self.send_line(message.encode()?)
    }

    /// Queue a line produced by [`WireMessage::encode`].
    pub fn send_line(&self, line: String) -> Result<()> {
        self.outbound
            .send(line)
            .map_err(|_| anyhow!("link {} is closed", self.id))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// Bind a listener on `addr` and report each accepted connection as
/// [`LinkEvent::Accepted`]. The accept loop ends when `events` is dropped or
/// the returned handle is aborted.
pub async fn listen(
    addr: &str,
    local_peer: String,
    events: mpsc::Sender<LinkEvent>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind peer listener on {addr}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "peer listener bound");

    let handle = tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(err = %e, "peer accept failed");
                    continue;
                }
            };
            let (link, outbound_rx) = new_link(remote_addr);
            tracing::debug!(link = link.id, remote = %remote_addr, "accepted peer connection");
            // Accepted must reach the owner before the link can report Open.
            if events.send(LinkEvent::Accepted(link.clone())).await.is_err() {
                break;
            }
            start_link(link.id, stream, local_peer.clone(), outbound_rx, events.clone());
        }
    });
    Ok((local_addr, handle))
}

/// Connect to a host's listener.
pub async fn dial(
    addr: &str,
    local_peer: String,
    events: mpsc::Sender<LinkEvent>,
) -> Result<PeerLink> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to host at {addr}"))?;
    let (link, outbound_rx) = new_link(stream.peer_addr()?);
    start_link(link.id, stream, local_peer, outbound_rx, events);
    Ok(link)
}

fn new_link(remote_addr: SocketAddr) -> (PeerLink, mpsc::UnboundedReceiver<String>) {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let link = PeerLink {
        id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
        remote_addr,
        outbound,
    };
    (link, outbound_rx)
}

fn start_link(
    id: LinkId,
    stream: TcpStream,
    local_peer: String,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<LinkEvent>,
) {
    tokio::spawn(async move {
        if let Err(e) = run_link(id, stream, local_peer, outbound_rx, &events).await {
            tracing::warn!(link = id, err = %e, "link failed");
            let _ = events
                .send(LinkEvent::Error {
                    link: id,
                    message: e.to_string(),
                })
                .await;
        }
        let _ = events.send(LinkEvent::Closed { link: id }).await;
    });
}

async fn run_link(
    id: LinkId,
    stream: TcpStream,
    local_peer: String,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events: &mpsc::Sender<LinkEvent>,
) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

    let hello = serde_json::to_string(&Handshake {
        peer_id: local_peer,
        version: PROTOCOL_VERSION.to_string(),
    })?;
    writer.send(hello).await.context("send handshake")?;

    let mut open = false;
    loop {
        tokio::select! {
            line = reader.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    // The framed reader ends after any decode error.
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        return Err(anyhow!("peer sent a frame over {MAX_FRAME_BYTES} bytes"));
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
                    None => return Ok(()),
                };
                if !open {
                    let remote: Handshake =
                        serde_json::from_str(&line).context("invalid link handshake")?;
                    if remote.version != PROTOCOL_VERSION {
                        tracing::warn!(link = id, remote_version = %remote.version, "peer runs a different version");
                    }
                    open = true;
                    if events
                        .send(LinkEvent::Open { link: id, remote_peer: remote.peer_id })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                    continue;
                }
                match wire::decode(&line) {
                    Ok(Inbound::Message(message)) => {
                        if events.send(LinkEvent::Data { link: id, message }).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(Inbound::Unknown(tag)) => {
                        tracing::info!(link = id, tag = %tag, "ignoring unknown message type");
                    }
                    Err(e) => {
                        tracing::debug!(link = id, err = %e, "ignoring malformed frame");
                    }
                }
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(line) => writer.send(line).await.context("send frame")?,
                    // Every handle dropped: close the link.
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roundtable::model::{ChatEntry, EntryKind};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn next_event(rx: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn handshake_opens_both_sides_and_carries_data() {
        let (host_tx, mut host_rx) = mpsc::channel(16);
        let (addr, accept) = listen("127.0.0.1:0", "host".to_string(), host_tx).await.unwrap();

        let (guest_tx, mut guest_rx) = mpsc::channel(16);
        let guest_link = dial(&addr.to_string(), "guest".to_string(), guest_tx).await.unwrap();

        let host_link = match next_event(&mut host_rx).await {
            LinkEvent::Accepted(link) => link,
            other => panic!("expected Accepted, got {other:?}"),
        };
        match next_event(&mut host_rx).await {
            LinkEvent::Open { link, remote_peer } => {
                assert_eq!(link, host_link.id());
                assert_eq!(remote_peer, "guest");
            }
            other => panic!("expected Open, got {other:?}"),
        }
        match next_event(&mut guest_rx).await {
            LinkEvent::Open { remote_peer, .. } => assert_eq!(remote_peer, "host"),
            other => panic!("expected Open, got {other:?}"),
        }

        let msg = WireMessage::NewMessage {
            payload: ChatEntry::new("Guest1", "hello", EntryKind::User),
        };
        guest_link.send(&msg).unwrap();
        match next_event(&mut host_rx).await {
            LinkEvent::Data { message, .. } => assert_eq!(message, msg),
            other => panic!("expected Data, got {other:?}"),
        }

        // Dropping the guest's handle closes both ends.
        drop(guest_link);
        assert!(matches!(next_event(&mut guest_rx).await, LinkEvent::Closed { .. }));
        assert!(matches!(next_event(&mut host_rx).await, LinkEvent::Closed { .. }));
        accept.abort();
    }

    #[tokio::test]
    async fn unknown_and_malformed_frames_are_skipped() {
        let (host_tx, mut host_rx) = mpsc::channel(16);
        let (addr, accept) = listen("127.0.0.1:0", "host".to_string(), host_tx).await.unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"{\"peer_id\":\"raw\",\"version\":\"0\"}\n")
            .await
            .unwrap();
        raw.write_all(b"{\"type\":\"TYPING\"}\nnot json\n{\"type\":\"CLEAR_SESSION\"}\n")
            .await
            .unwrap();

        assert!(matches!(next_event(&mut host_rx).await, LinkEvent::Accepted(_)));
        assert!(matches!(next_event(&mut host_rx).await, LinkEvent::Open { .. }));
        match next_event(&mut host_rx).await {
            LinkEvent::Data { message, .. } => assert_eq!(message, WireMessage::ClearSession),
            other => panic!("expected Data, got {other:?}"),
        }
        accept.abort();
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_on_both_ends() {
        let (host_tx, mut host_rx) = mpsc::channel(16);
        let (addr, accept) = listen("127.0.0.1:0", "host".to_string(), host_tx).await.unwrap();

        let (guest_tx, mut guest_rx) = mpsc::channel(16);
        let guest_link = dial(&addr.to_string(), "guest".to_string(), guest_tx).await.unwrap();
        assert!(matches!(next_event(&mut host_rx).await, LinkEvent::Accepted(_)));
        assert!(matches!(next_event(&mut host_rx).await, LinkEvent::Open { .. }));
        assert!(matches!(next_event(&mut guest_rx).await, LinkEvent::Open { .. }));

        let huge = WireMessage::NewMessage {
            payload: ChatEntry::new("Guest1", "z".repeat(MAX_FRAME_BYTES), EntryKind::User),
        };
        assert!(guest_link.send(&huge).is_err());

        // The link is still usable after the refused send.
        guest_link.send(&WireMessage::ClearSession).unwrap();
        match next_event(&mut host_rx).await {
            LinkEvent::Data { message, .. } => assert_eq!(message, WireMessage::ClearSession),
            other => panic!("expected Data, got {other:?}"),
        }
        accept.abort();
    }

    #[tokio::test]
    async fn incoming_oversized_frame_fails_the_link() {
        let (host_tx, mut host_rx) = mpsc::channel(16);
        let (addr, accept) = listen("127.0.0.1:0", "host".to_string(), host_tx).await.unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"{\"peer_id\":\"raw\",\"version\":\"0\"}\n")
            .await
            .unwrap();
        let mut line = vec![b'a'; MAX_FRAME_BYTES + 1];
        line.push(b'\n');
        raw.write_all(&line).await.unwrap();

        assert!(matches!(next_event(&mut host_rx).await, LinkEvent::Accepted(_)));
        assert!(matches!(next_event(&mut host_rx).await, LinkEvent::Open { .. }));
        match next_event(&mut host_rx).await {
            LinkEvent::Error { message, .. } => assert!(message.contains("over")),
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(matches!(next_event(&mut host_rx).await, LinkEvent::Closed { .. }));
        accept.abort();
    }

    #[tokio::test]
    async fn dial_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (tx, _rx) = mpsc::channel(1);
        assert!(dial(&addr.to_string(), "guest".to_string(), tx).await.is_err());
    }
}
