//! Rendezvous (signaling) protocol.
//!
//! A host keeps one connection open to the rendezvous service for as long as
//! its room should stay discoverable. Guests open short-lived connections to
//! look a room up.

use serde::{Deserialize, Serialize};

/// Error code: no host is registered under the requested room id.
pub const CODE_PEER_UNAVAILABLE: &str = "peer-unavailable";
/// Error code: the requested room id is already registered.
pub const CODE_UNAVAILABLE_ID: &str = "unavailable-id";
/// Error code: the request was malformed or arrived out of order.
pub const CODE_INVALID_REQUEST: &str = "invalid-request";
/// Error code: the service is at its room capacity.
pub const CODE_CAPACITY: &str = "capacity";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalRequest {
    /// Register this connection as the host of a room reachable at `addr`.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        addr: String,
    },
    /// Resolve a room id to its host's address.
    Lookup { room_id: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalResponse {
    Registered { room_id: String },
    Found { room_id: String, addr: String },
    Pong,
    Error { code: String, message: String },
}
