//! Wire protocol spoken by agent endpoints.
//!
//! Each endpoint listens on its own Unix socket inside the endpoints
//! directory. Each connection carries exactly one request → response.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default directory holding agent endpoint sockets.
///
/// Checks `$ROUNDTABLE_ENDPOINTS_DIR`, then a sibling `endpoints/` directory
/// next to the control socket.
pub fn default_endpoints_dir() -> PathBuf {
    if let Ok(p) = std::env::var("ROUNDTABLE_ENDPOINTS_DIR") {
        return PathBuf::from(p);
    }
    let node = crate::client::default_socket_path();
    node.with_file_name("endpoints")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterRequest {
    /// Liveness check; also reports which chat site the endpoint drives.
    Ping,
    /// Type `prompt` into the chat page and submit it.
    DistributePrompt { prompt: String },
    /// Scrape the most recent reply.
    HarvestLatest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterResponse {
    Pong {
        status: String,
        agent_name: String,
        url: String,
    },
    Distributed {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Harvested {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The endpoint could not handle the request at all.
    Error { message: String },
}
