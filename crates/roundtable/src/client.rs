use crate::protocol::{MAX_LINE_BYTES, Request, Response};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Client for the roundtable node daemon's control socket.
pub struct NodeClient {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    peer_id: String,
}

impl NodeClient {
    /// Connect to the node daemon at the given socket path.
    /// Waits for the Hello response before returning.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        let (r, w) = stream.into_split();
        let mut client = Self {
            reader: FramedRead::new(r, LinesCodec::new()),
            writer: FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            peer_id: String::new(),
        };

        match client.next_response().await? {
            Response::Hello { peer_id, .. } => {
                client.peer_id = peer_id;
                Ok(client)
            }
            other => Err(anyhow!("expected Hello, got {other:?}")),
        }
    }

    /// This node's peer id, from the Hello handshake.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub async fn send(&mut self, req: Request) -> Result<()> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        Ok(())
    }

    /// Read the next response or event from the daemon.
    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = self.reader.next().await else {
            bail!("daemon disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    /// Send a request and wait for the Ok/Error response, skipping events.
    pub async fn request(&mut self, req: Request) -> Result<Option<serde_json::Value>> {
        self.send(req).await?;
        loop {
            match self.next_response().await? {
                Response::Hello { .. } | Response::Event { .. } => continue,
                Response::Ok { data } => return Ok(data),
                Response::Error { code, message } => {
                    return Err(RequestError { code, message }.into());
                }
            }
        }
    }

    /// Split into independent reader and writer halves, for following events
    /// in a `select!` loop while still sending requests.
    pub fn into_split(self) -> (NodeWriter, NodeReader) {
        (
            NodeWriter {
                writer: self.writer,
            },
            NodeReader {
                reader: self.reader,
            },
        )
    }
}

/// An `Error` response from the daemon, kept as a typed error so callers can
/// branch on the code (e.g. `confirmation_required`).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub code: String,
    pub message: String,
}

/// Write half of a split [`NodeClient`].
pub struct NodeWriter {
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl NodeWriter {
    pub async fn send(&mut self, req: Request) -> Result<()> {
        let line = serde_json::to_string(&req)?;
        self.writer.send(line).await?;
        Ok(())
    }
}

/// Read half of a split [`NodeClient`]. Yields all responses including events.
pub struct NodeReader {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
}

impl NodeReader {
    /// Returns `None` if the daemon disconnected.
    pub async fn next(&mut self) -> Option<Result<Response>> {
        let line = self.reader.next().await?;
        Some(
            line.map_err(Into::into)
                .and_then(|l| serde_json::from_str(&l).map_err(Into::into)),
        )
    }
}

/// Discover the default control socket path.
///
/// Checks `$ROUNDTABLE_SOCKET`, then falls back to
/// `$XDG_RUNTIME_DIR/roundtable/roundtable.sock` or
/// `/tmp/roundtable-$UID/roundtable.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("ROUNDTABLE_SOCKET") {
        return PathBuf::from(p);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir)
            .join("roundtable")
            .join("roundtable.sock");
    }
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/roundtable-{uid}/roundtable.sock"))
}
