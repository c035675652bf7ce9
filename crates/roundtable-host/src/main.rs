use anyhow::{Context, Result};
use clap::Parser;
use roundtable_host::router::Router;
use roundtable_host::service;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about = "roundtable rendezvous service")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:50200")]
    listen: String,
    /// Maximum number of concurrently registered rooms.
    #[arg(long, default_value = "1000")]
    max_rooms: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roundtable_host=info".into()),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("invalid --listen {}", args.listen))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, max_rooms = args.max_rooms, "roundtable-host listening");

    let router = Arc::new(Router::new(args.max_rooms));
    service::serve(listener, router, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    tracing::info!("roundtable-host stopped");
    Ok(())
}
