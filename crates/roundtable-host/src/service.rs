use crate::router::{RegisterError, Router};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use roundtable::signal::{
    CODE_CAPACITY, CODE_INVALID_REQUEST, CODE_PEER_UNAVAILABLE, CODE_UNAVAILABLE_ID,
    SignalRequest, SignalResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

const MAX_LINE_BYTES: usize = 16 * 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Accept rendezvous connections until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Arc<Router>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let router = router.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_conn(stream, remote, router).await {
                                tracing::debug!(remote = %remote, err = %e, "rendezvous connection ended");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(err = %e, "rendezvous accept failed"),
                }
            }
            _ = &mut shutdown => break,
        }
    }
}

async fn handle_conn(stream: TcpStream, remote: SocketAddr, router: Arc<Router>) -> Result<()> {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (r, w) = stream.into_split();
    let mut reader = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut writer = FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    // Room held by this connection, released on disconnect.
    let mut owned_room: Option<String> = None;

    let result = async {
        while let Some(line) = reader.next().await {
            let line = line?;
            let response = match serde_json::from_str::<SignalRequest>(&line) {
                Ok(req) => handle_request(req, &router, conn_id, &mut owned_room),
                Err(e) => error(CODE_INVALID_REQUEST, format!("invalid request: {e}")),
            };
            writer.send(serde_json::to_string(&response)?).await?;
        }
        anyhow::Ok(())
    }
    .await;

    if let Some(room) = owned_room
        && router.unregister(&room, conn_id)
    {
        tracing::info!(room = %room, remote = %remote, "room released");
    }
    result
}

fn handle_request(
    req: SignalRequest,
    router: &Router,
    conn_id: u64,
    owned_room: &mut Option<String>,
) -> SignalResponse {
    match req {
        SignalRequest::Register { room_id, addr } => {
            if owned_room.is_some() {
                return error(CODE_INVALID_REQUEST, "connection already holds a room");
            }
            match router.register(room_id, addr.clone(), conn_id) {
                Ok(room_id) => {
                    tracing::info!(room = %room_id, addr = %addr, "room registered");
                    *owned_room = Some(room_id.clone());
                    SignalResponse::Registered { room_id }
                }
                Err(e @ RegisterError::Taken(_)) => error(CODE_UNAVAILABLE_ID, e.to_string()),
                Err(e @ RegisterError::Capacity) => error(CODE_CAPACITY, e.to_string()),
                Err(e @ RegisterError::InvalidId(_)) => error(CODE_INVALID_REQUEST, e.to_string()),
            }
        }
        SignalRequest::Lookup { room_id } => match router.lookup(&room_id) {
            Some(addr) => SignalResponse::Found { room_id, addr },
            None => error(CODE_PEER_UNAVAILABLE, format!("room {room_id} not found")),
        },
        SignalRequest::Ping => SignalResponse::Pong,
    }
}

fn error(code: &str, message: impl Into<String>) -> SignalResponse {
    SignalResponse::Error {
        code: code.to_string(),
        message: message.into(),
    }
}

/// Spawn a rendezvous service on a random local port.
/// Returns the bound address and a shutdown handle.
pub async fn spawn_rendezvous(max_rooms: usize) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind rendezvous")?;
    let local_addr = listener.local_addr()?;
    let router = Arc::new(Router::new(max_rooms));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(serve(listener, router, async {
        let _ = shutdown_rx.await;
    }));

    Ok((local_addr, shutdown_tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf;

    struct RawConn {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: tokio::net::tcp::OwnedWriteHalf,
    }

    impl RawConn {
        async fn open(addr: SocketAddr) -> Self {
            let (r, w) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(r).lines(),
                writer: w,
            }
        }

        async fn call(&mut self, req: &str) -> SignalResponse {
            self.writer.write_all(req.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn register_lookup_and_release_on_disconnect() {
        let (addr, _shutdown) = spawn_rendezvous(10).await.unwrap();

        let mut host = RawConn::open(addr).await;
        let resp = host
            .call(r#"{"type":"register","room_id":"r1","addr":"10.0.0.1:4000"}"#)
            .await;
        assert_eq!(
            resp,
            SignalResponse::Registered {
                room_id: "r1".to_string()
            }
        );

        let mut guest = RawConn::open(addr).await;
        let resp = guest.call(r#"{"type":"lookup","room_id":"r1"}"#).await;
        assert_eq!(
            resp,
            SignalResponse::Found {
                room_id: "r1".to_string(),
                addr: "10.0.0.1:4000".to_string()
            }
        );
        assert_eq!(guest.call(r#"{"type":"ping"}"#).await, SignalResponse::Pong);

        drop(host);
        let mut released = false;
        for _ in 0..50 {
            match guest.call(r#"{"type":"lookup","room_id":"r1"}"#).await {
                SignalResponse::Error { code, .. } => {
                    assert_eq!(code, CODE_PEER_UNAVAILABLE);
                    released = true;
                    break;
                }
                _ => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        assert!(released, "room should be released when its host disconnects");
    }

    #[tokio::test]
    async fn second_register_on_same_connection_is_rejected() {
        let (addr, _shutdown) = spawn_rendezvous(10).await.unwrap();
        let mut host = RawConn::open(addr).await;
        assert!(matches!(
            host.call(r#"{"type":"register","addr":"a"}"#).await,
            SignalResponse::Registered { .. }
        ));
        match host.call(r#"{"type":"register","addr":"a"}"#).await {
            SignalResponse::Error { code, .. } => assert_eq!(code, CODE_INVALID_REQUEST),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn taken_room_and_garbage_input() {
        let (addr, _shutdown) = spawn_rendezvous(10).await.unwrap();
        let mut a = RawConn::open(addr).await;
        let mut b = RawConn::open(addr).await;
        a.call(r#"{"type":"register","room_id":"r","addr":"a"}"#).await;
        match b.call(r#"{"type":"register","room_id":"r","addr":"b"}"#).await {
            SignalResponse::Error { code, .. } => assert_eq!(code, CODE_UNAVAILABLE_ID),
            other => panic!("expected error, got {other:?}"),
        }
        match b.call("garbage").await {
            SignalResponse::Error { code, .. } => assert_eq!(code, CODE_INVALID_REQUEST),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
