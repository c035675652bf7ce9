//! Shared session data model: chat entries, roster entries and log change
//! notifications. These types travel over both the peer wire protocol and the
//! node control socket.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Who produced a chat entry: a human prompt or a specific agent.
///
/// Serialized as a bare string: `"user"` or the agent key (`"claude"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntryKind {
    User,
    Agent(String),
}

impl EntryKind {
    pub fn is_user(&self) -> bool {
        matches!(self, EntryKind::User)
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntryKind::User => "user",
            EntryKind::Agent(key) => key,
        }
    }
}

impl From<String> for EntryKind {
    fn from(value: String) -> Self {
        if value == "user" {
            EntryKind::User
        } else {
            EntryKind::Agent(value)
        }
    }
}

impl From<EntryKind> for String {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::User => "user".to_string(),
            EntryKind::Agent(key) => key,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in the shared chat log.
///
/// Display identity is the entry's position in the log; `id` is a stable
/// identifier that survives relay and resync so position-shifting operations
/// can be matched to the right entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    pub sender: String,
    pub text: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl ChatEntry {
    /// Create a fresh entry stamped with a new id and the current time.
    pub fn new(sender: impl Into<String>, text: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            id: new_entry_id(),
            sender: sender.into(),
            text: text.into(),
            kind,
            created_at_ms: now_ms(),
        }
    }
}

/// Presence record for one participant. Overwritten wholesale on every
/// announcement from that peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub peer_id: String,
    pub display_name: String,
    #[serde(default)]
    pub bound_agents: BTreeSet<String>,
    #[serde(default)]
    pub is_host: bool,
}

/// Notification emitted by the chat log after every successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogChange {
    Appended { index: usize, entry: ChatEntry },
    Edited { index: usize, entry: ChatEntry },
    Deleted { index: usize, entry_id: String },
    Cleared,
    Replaced { len: usize },
}

/// Generate a new stable entry id.
pub fn new_entry_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_kind_serializes_as_plain_string() {
        let user = serde_json::to_string(&EntryKind::User).unwrap();
        assert_eq!(user, "\"user\"");
        let agent = serde_json::to_string(&EntryKind::Agent("claude".to_string())).unwrap();
        assert_eq!(agent, "\"claude\"");

        let decoded: EntryKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(decoded, EntryKind::Agent("gemini".to_string()));
        assert!(serde_json::from_str::<EntryKind>("\"user\"").unwrap().is_user());
    }

    #[test]
    fn entry_without_id_gets_one_on_decode() {
        let json = r#"{"sender":"You","text":"hi","kind":"user"}"#;
        let entry: ChatEntry = serde_json::from_str(json).unwrap();
        assert!(!entry.id.is_empty());
        assert_eq!(entry.created_at_ms, 0);
        assert_eq!(entry.kind, EntryKind::User);
    }

    #[test]
    fn roster_entry_defaults_missing_fields() {
        let json = r#"{"peer_id":"p1","display_name":"Ann"}"#;
        let entry: RosterEntry = serde_json::from_str(json).unwrap();
        assert!(entry.bound_agents.is_empty());
        assert!(!entry.is_host);
    }

    #[test]
    fn log_change_is_tagged_by_op() {
        let json = serde_json::to_string(&LogChange::Cleared).unwrap();
        assert_eq!(json, r#"{"op":"cleared"}"#);
    }
}
