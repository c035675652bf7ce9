use anyhow::Result;
use roundtable_host::service::spawn_rendezvous;
use std::net::SocketAddr;
use tokio::sync::oneshot;

/// A test rendezvous service running on a random loopback port.
pub struct TestRendezvous {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestRendezvous {
    pub async fn spawn() -> Result<Self> {
        let (addr, shutdown_tx) = spawn_rendezvous(64).await?;
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Address string suitable for node configuration.
    pub fn rendezvous_addr(&self) -> String {
        self.addr.to_string()
    }
}

impl Drop for TestRendezvous {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
