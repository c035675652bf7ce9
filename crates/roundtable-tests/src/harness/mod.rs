pub mod client;
pub mod endpoint;
pub mod node;
pub mod rendezvous;

use roundtable::model::{ChatEntry, RosterEntry};
use roundtable::protocol::{Response, SessionInfo};
use std::time::Duration;

/// Poll history until it holds exactly `count` entries, or timeout.
pub async fn poll_history_until(
    client: &mut client::TestClient,
    count: usize,
    timeout: Duration,
) -> Vec<ChatEntry> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let entries = client.history().await.unwrap_or_default();
        if entries.len() == count || tokio::time::Instant::now() >= deadline {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll the roster until it holds exactly `count` entries, or timeout.
pub async fn poll_roster_until(
    client: &mut client::TestClient,
    count: usize,
    timeout: Duration,
) -> Vec<RosterEntry> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let roster = client.roster().await.unwrap_or_default();
        if roster.len() == count || tokio::time::Instant::now() >= deadline {
            return roster;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Poll status until `done` accepts it, or timeout. Returns the last status.
pub async fn poll_status_until(
    client: &mut client::TestClient,
    timeout: Duration,
    done: impl Fn(&SessionInfo) -> bool,
) -> Option<SessionInfo> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = client.status().await.ok();
        if status.as_ref().is_some_and(&done) || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Texts of `entries`, in order.
pub fn texts(entries: &[ChatEntry]) -> Vec<String> {
    entries.iter().map(|e| e.text.clone()).collect()
}

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                "roundtable_mesh=debug,roundtable_host=debug,roundtable_node=debug",
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Extract data from an Ok response, or panic.
pub fn unwrap_ok_data(resp: Response) -> Option<serde_json::Value> {
    match resp {
        Response::Ok { data } => data,
        Response::Error { code, message } => panic!("expected Ok, got Error({code}): {message}"),
        other => panic!("expected Ok, got {other:?}"),
    }
}

/// Extract the error code from an Error response, or panic.
pub fn unwrap_error_code(resp: Response) -> String {
    match resp {
        Response::Error { code, .. } => code,
        other => panic!("expected Error, got {other:?}"),
    }
}
