use anyhow::{Context, Result};
use clap::Parser;
use roundtable::DEFAULT_RENDEZVOUS_HOST;
use roundtable::adapter_protocol::default_endpoints_dir;
use roundtable::client::default_socket_path;
use roundtable::protocol::{Request, Response};
use roundtable_mesh::state_dir::{default_state_dir, ensure_state_dir};
use roundtable_mesh::store::{FileStore, KeyValueStore, MemoryStore};
use roundtable_node::adapters::{EndpointHost, SocketEndpointHost};
use roundtable_node::handler::{NodeConfig, NodeState};
use roundtable_node::socket;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "roundtable node daemon")]
struct Args {
    /// Path to the control socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// State directory for chat history and settings.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Rendezvous service address.
    #[arg(long, default_value = DEFAULT_RENDEZVOUS_HOST)]
    rendezvous: String,

    /// Address the host listener binds to when hosting a room.
    #[arg(long, default_value = "0.0.0.0:0")]
    listen: String,

    /// Host name or IP guests should dial, when it differs from the bind
    /// address.
    #[arg(long)]
    advertise_host: Option<String>,

    /// Delay in milliseconds before a guest announces itself after joining.
    #[arg(long, default_value = "1000")]
    settle_ms: u64,

    /// Directory of agent endpoint sockets.
    #[arg(long)]
    endpoints_dir: Option<PathBuf>,

    /// Keep chat history and settings in memory only.
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roundtable_node=info".into()),
        )
        .init();

    let args = Args::parse();
    let socket_path = args.socket.unwrap_or_else(default_socket_path);

    let store: Arc<dyn KeyValueStore> = if args.ephemeral {
        tracing::info!("ephemeral node, nothing is persisted");
        Arc::new(MemoryStore::new())
    } else {
        let state_dir = match args.state_dir {
            Some(dir) => dir,
            None => default_state_dir().context("failed to determine state directory")?,
        };
        ensure_state_dir(&state_dir)?;
        Arc::new(FileStore::open(&state_dir).context("failed to open store")?)
    };

    let endpoints_dir = args.endpoints_dir.unwrap_or_else(default_endpoints_dir);
    tracing::info!(dir = %endpoints_dir.display(), "agent endpoints directory");
    let endpoints: Arc<dyn EndpointHost> = Arc::new(SocketEndpointHost::new(endpoints_dir));

    let peer_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(peer_id = %peer_id, rendezvous = %args.rendezvous, "starting node");

    let mut config = NodeConfig::new(peer_id, args.rendezvous);
    config.listen = args.listen;
    config.advertise_host = args.advertise_host;
    config.settle = Duration::from_millis(args.settle_ms);

    let state = NodeState::new(config, store, Some(endpoints));
    let (handle, mut control) = state.spawn();

    // Initial agent discovery. An empty directory is not an error.
    let scanner = handle.clone();
    tokio::spawn(async move {
        if let Response::Error { message, .. } = scanner.request(Request::ScanAgents).await {
            tracing::warn!(err = %message, "initial agent scan failed");
        }
    });

    // Run the control socket until shutdown
    tokio::select! {
        result = socket::serve(handle.clone(), &socket_path) => {
            result.context("socket server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            handle.request(Request::Shutdown).await;
        }
        _ = &mut control => {
            tracing::info!("control task stopped");
        }
    }

    // Cleanup socket file
    std::fs::remove_file(&socket_path).ok();
    tracing::info!("roundtable-node shut down");
    Ok(())
}
