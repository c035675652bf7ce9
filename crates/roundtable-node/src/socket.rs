use crate::handler::{CODE_INVALID_REQUEST, NodeHandle, error_response};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use roundtable::protocol::{MAX_LINE_BYTES, Request, Response};
use std::path::Path;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Start the control socket server. Accepts client connections and forwards
/// their requests to the node.
pub async fn serve(handle: NodeHandle, socket_path: &Path) -> Result<()> {
    // Ensure parent directory exists
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }

    // Remove stale socket
    if socket_path.exists() {
        std::fs::remove_file(socket_path).ok();
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).ok();
    }

    tracing::info!(path = %socket_path.display(), "control socket listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(handle, stream).await {
                tracing::debug!(err = %e, "client disconnected");
            }
        });
    }
}

async fn handle_client(handle: NodeHandle, stream: tokio::net::UnixStream) -> Result<()> {
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new());

    // Subscribe before greeting so no event after the hello is missed.
    let mut event_rx = handle.subscribe();

    let hello = Response::Hello {
        peer_id: handle.peer_id().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    writer.send(serde_json::to_string(&hello)?).await?;

    loop {
        tokio::select! {
            line = reader.next() => {
                let Some(line) = line else { break };
                let line = line?;
                let req: Request = match serde_json::from_str(&line) {
                    Ok(req) => req,
                    Err(e) => {
                        let resp = error_response(CODE_INVALID_REQUEST, &format!("invalid request: {e}"));
                        writer.send(serde_json::to_string(&resp)?).await?;
                        continue;
                    }
                };

                let is_shutdown = matches!(req, Request::Shutdown);
                let resp = handle.request(req).await;
                writer.send(serde_json::to_string(&resp)?).await?;

                if is_shutdown {
                    break;
                }
            }
            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        let resp = Response::Event { event };
                        writer.send(serde_json::to_string(&resp)?).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "client fell behind on events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{NodeConfig, NodeState};
    use roundtable::client::{NodeClient, RequestError};
    use roundtable::protocol::{Event, SessionInfo, SessionStatus};
    use roundtable_mesh::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn start() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("run").join("node.sock");
        let config = NodeConfig::new("peer-1".to_string(), "127.0.0.1:1".to_string());
        let state = NodeState::new(config, Arc::new(MemoryStore::new()), None);
        let (handle, _join) = state.spawn();
        let path = socket_path.clone();
        tokio::spawn(async move { serve(handle, &path).await });
        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (dir, socket_path)
    }

    #[tokio::test]
    async fn hello_then_requests_and_events() {
        let (_dir, path) = start().await;
        let mut client = NodeClient::connect(&path).await.unwrap();
        assert_eq!(client.peer_id(), "peer-1");

        let data = client.request(Request::Status).await.unwrap();
        let info: SessionInfo = serde_json::from_value(data.unwrap()).unwrap();
        assert_eq!(info.status, SessionStatus::Idle);

        client
            .send(Request::SendPrompt {
                text: "hello".to_string(),
            })
            .await
            .unwrap();
        let mut saw_append = false;
        let mut saw_ok = false;
        while !(saw_append && saw_ok) {
            match client.next_response().await.unwrap() {
                Response::Event {
                    event: Event::Log { .. },
                } => saw_append = true,
                Response::Ok { .. } => saw_ok = true,
                Response::Event { .. } => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn invalid_json_gets_an_error_and_keeps_the_connection() {
        let (_dir, path) = start().await;
        let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (r, w) = stream.into_split();
        let mut reader = FramedRead::new(r, LinesCodec::new());
        let mut writer = FramedWrite::new(w, LinesCodec::new());

        let hello: Response = serde_json::from_str(&reader.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(hello, Response::Hello { .. }));

        writer.send("{not json".to_string()).await.unwrap();
        let resp: Response = serde_json::from_str(&reader.next().await.unwrap().unwrap()).unwrap();
        match resp {
            Response::Error { code, .. } => assert_eq!(code, CODE_INVALID_REQUEST),
            other => panic!("expected error, got {other:?}"),
        }

        writer.send(r#"{"type":"status"}"#.to_string()).await.unwrap();
        let resp: Response = serde_json::from_str(&reader.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(resp, Response::Ok { .. }));
    }

    #[tokio::test]
    async fn request_errors_carry_their_code() {
        let (_dir, path) = start().await;
        let mut client = NodeClient::connect(&path).await.unwrap();
        let err = client.request(Request::Harvest).await.unwrap_err();
        let err = err.downcast::<RequestError>().unwrap();
        assert_eq!(err.code, "no_agents");
    }
}
