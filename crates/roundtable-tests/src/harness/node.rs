use anyhow::{Context, Result};
use roundtable_mesh::store::{FileStore, KeyValueStore};
use roundtable_node::adapters::{EndpointHost, SocketEndpointHost};
use roundtable_node::handler::{NodeConfig, NodeHandle, NodeState};
use roundtable_node::socket;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// An in-process node daemon with a file store and control socket in temp
/// directories.
pub struct TestNode {
    pub handle: NodeHandle,
    pub socket_path: PathBuf,
    pub peer_id: String,
    state_dir: Option<TempDir>,
    control: JoinHandle<()>,
    server: JoinHandle<()>,
    _socket_dir: TempDir,
}

impl TestNode {
    /// Spawn a node that uses the given rendezvous service and has no agents.
    pub async fn spawn(rendezvous: &str) -> Result<Self> {
        Self::spawn_inner(rendezvous, TempDir::new()?, None).await
    }

    /// Spawn a node whose agents are the endpoint sockets in `endpoints_dir`.
    pub async fn spawn_with_endpoints(rendezvous: &str, endpoints_dir: &Path) -> Result<Self> {
        Self::spawn_inner(rendezvous, TempDir::new()?, Some(endpoints_dir.to_path_buf())).await
    }

    /// Stop this node and start a fresh one over the same state directory.
    pub async fn restart(mut self, rendezvous: &str) -> Result<Self> {
        self.handle
            .request(roundtable::protocol::Request::Shutdown)
            .await;
        self.server.abort();
        let _ = (&mut self.control).await;
        let state_dir = self.state_dir.take().context("state dir already moved")?;
        drop(self);
        Self::spawn_inner(rendezvous, state_dir, None).await
    }

    async fn spawn_inner(
        rendezvous: &str,
        state_dir: TempDir,
        endpoints_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let socket_dir = TempDir::new()?;
        let socket_path = socket_dir.path().join("roundtable.sock");

        let store: Arc<dyn KeyValueStore> =
            Arc::new(FileStore::open(state_dir.path()).context("failed to open store")?);
        let endpoints = endpoints_dir
            .map(|dir| Arc::new(SocketEndpointHost::new(dir)) as Arc<dyn EndpointHost>);

        let peer_id = uuid::Uuid::new_v4().to_string();
        let mut config = NodeConfig::new(peer_id.clone(), rendezvous.to_string());
        config.listen = "127.0.0.1:0".to_string();
        config.settle = Duration::from_millis(50);
        config.reconnect_interval = Duration::from_millis(100);

        let state = NodeState::new(config, store, endpoints);
        let (handle, control) = state.spawn();

        let server_handle = handle.clone();
        let path = socket_path.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = socket::serve(server_handle, &path).await {
                tracing::debug!(err = %e, "socket server stopped");
            }
        });

        // Wait for socket to be ready
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Ok(Self {
            handle,
            socket_path,
            peer_id,
            state_dir: Some(state_dir),
            control,
            server,
            _socket_dir: socket_dir,
        })
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.server.abort();
        self.control.abort();
        std::fs::remove_file(&self.socket_path).ok();
    }
}
