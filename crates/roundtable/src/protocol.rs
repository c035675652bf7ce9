use crate::model::{LogChange, RosterEntry};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of a request line on the control socket (1 MiB). Responses
/// are unbounded since `history` carries the whole log.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Typed enums for wire format safety
// ---------------------------------------------------------------------------

/// Which side of the star topology this node plays.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    #[default]
    Unset,
    Host,
    Guest,
}

/// Connection lifecycle of the current session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Health of the host's rendezvous registration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalingState {
    #[default]
    Offline,
    Online,
    Reconnecting,
}

/// Severity of a user-facing system log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A request sent from the CLI to the node daemon over the Unix socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Current session info.
    Status,

    // -- Session --
    /// Become the host of a new session. Without `room_id` the rendezvous
    /// service assigns one.
    StartHost {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
    /// Join an existing room as a guest.
    JoinRoom { room_id: String },
    /// Tear down the current session.
    LeaveSession,

    // -- Chat log --
    /// Append a user prompt, broadcast it and distribute it to local agents.
    SendPrompt { text: String },
    /// Send the fixed roll-call prompt.
    RollCall,
    /// Collect the latest reply from every enabled agent.
    Harvest,
    /// Full ordered chat log.
    History,
    /// Current roster.
    Roster,
    /// Replace the text at `index`. Local only.
    EditMessage { index: usize, text: String },
    /// Delete the entry at `index`. `confirm` must be set.
    DeleteMessage {
        index: usize,
        #[serde(default)]
        confirm: bool,
    },
    /// Empty the log. `confirm` must be set.
    ClearSession {
        #[serde(default)]
        confirm: bool,
    },
    /// Change the display name used for prompts and presence.
    SetUsername { username: String },

    // -- Agents --
    /// Rediscover agent endpoints and rebind adapters.
    ScanAgents,
    /// List bound agents.
    ListAgents,
    /// Enable or disable one bound agent by key.
    SetAgentEnabled { agent: String, enabled: bool },
    /// Update context injection options. Absent fields are left unchanged.
    SetContextOptions {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_history: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        smart_context: Option<bool>,
    },

    // -- Daemon lifecycle --
    /// Shut down the daemon.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A response sent from the node daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Connection established.
    Hello { peer_id: String, version: String },
    /// Request succeeded with optional data.
    Ok { data: Option<serde_json::Value> },
    /// Request failed.
    Error { code: String, message: String },
    /// Asynchronous event.
    Event { event: Event },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Asynchronous events pushed to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// The chat log changed.
    Log { change: LogChange },
    /// The roster changed.
    RosterChanged { roster: Vec<RosterEntry> },
    /// Session role, status or signaling state changed.
    StatusChanged { status: SessionInfo },
    /// A user-facing status line.
    SystemLog { level: LogLevel, message: String },
}

// ---------------------------------------------------------------------------
// Data types returned in Ok.data
// ---------------------------------------------------------------------------

/// Session info returned by `Status` and `StartHost`/`JoinRoom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub role: SessionRole,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub peer_id: String,
    /// Name shown in the roster (`Anonymous` when unset).
    pub username: String,
    /// Sender name stamped on this node's prompts (`You` when unset).
    #[serde(default)]
    pub sender: String,
    /// Open guest links (host) or 1/0 for the host link (guest).
    pub links: usize,
    pub signaling: SignalingState,
}

/// A bound agent returned by `ListAgents` and `ScanAgents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub key: String,
    pub name: String,
    pub endpoint: String,
    pub enabled: bool,
}

/// Context injection options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub include_history: bool,
    pub smart_context: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            include_history: true,
            smart_context: true,
        }
    }
}

/// Result of a `SendPrompt`/`RollCall` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptResult {
    pub index: usize,
    pub entry_id: String,
    /// Agents the prompt was dispatched to.
    pub dispatched: Vec<String>,
}

/// Result of a `Harvest` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestResult {
    /// Agents a harvest was started for. Replies arrive as `log` events.
    pub requested: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatEntry, EntryKind};

    #[test]
    fn session_request_serde_round_trip() {
        let requests = vec![
            Request::StartHost {
                room_id: Some("room-1".to_string()),
            },
            Request::StartHost { room_id: None },
            Request::JoinRoom {
                room_id: "room-1".to_string(),
            },
            Request::LeaveSession,
            Request::SendPrompt {
                text: "hello".to_string(),
            },
            Request::DeleteMessage {
                index: 2,
                confirm: true,
            },
            Request::SetContextOptions {
                include_history: Some(false),
                smart_context: None,
            },
        ];

        for req in &requests {
            let json = serde_json::to_string(req).unwrap();
            let decoded: Request = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&decoded).unwrap();
            assert_eq!(json, json2);
        }
    }

    #[test]
    fn destructive_requests_default_to_unconfirmed() {
        let req: Request = serde_json::from_str(r#"{"type":"clear_session"}"#).unwrap();
        assert!(matches!(req, Request::ClearSession { confirm: false }));
        let req: Request =
            serde_json::from_str(r#"{"type":"delete_message","index":0}"#).unwrap();
        assert!(matches!(
            req,
            Request::DeleteMessage {
                index: 0,
                confirm: false
            }
        ));
    }

    #[test]
    fn log_event_serde_round_trip() {
        let event = Event::Log {
            change: LogChange::Appended {
                index: 0,
                entry: ChatEntry::new("You", "hi", EntryKind::User),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"log""#));
        assert!(json.contains(r#""op":"appended""#));
        let decoded: Event = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&decoded).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn session_info_room_skips_none() {
        let info = SessionInfo {
            role: SessionRole::Unset,
            status: SessionStatus::Idle,
            room_id: None,
            peer_id: "p1".to_string(),
            username: "Anonymous".to_string(),
            sender: "You".to_string(),
            links: 0,
            signaling: SignalingState::Offline,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("room_id"));
        assert!(json.contains(r#""status":"idle""#));
    }

    #[test]
    fn context_options_default_on() {
        let opts = ContextOptions::default();
        assert!(opts.include_history);
        assert!(opts.smart_context);
    }
}
