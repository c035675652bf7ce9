//! Peer-to-peer wire protocol.
//!
//! Every frame is one JSON object per line, tagged by its `type` field. The
//! set of message kinds is closed; frames carrying a tag this build does not
//! know decode to [`Inbound::Unknown`] so newer peers can add kinds without
//! breaking older ones.

use crate::model::{ChatEntry, RosterEntry};
use serde::{Deserialize, Serialize};

/// Maximum size of a single wire frame (1 MiB). Senders refuse to encode
/// anything larger; history snapshots are split into several frames.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Room left in a snapshot frame for the envelope around its entries.
const SNAPSHOT_ENVELOPE_BYTES: usize = 128;

/// Wire tags understood by this build.
pub const KNOWN_TAGS: [&str; 5] = [
    "SYNC_HISTORY",
    "NEW_MESSAGE",
    "DELETE_MESSAGE",
    "CLEAR_SESSION",
    "PRESENCE",
];

/// A state-changing event exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// One chunk of the ordered log snapshot the host sends a newly opened
    /// guest. Every chunk but the last sets `more`; the receiver installs
    /// the concatenation once the last chunk arrives.
    SyncHistory {
        history: Vec<ChatEntry>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        more: bool,
    },
    /// One appended entry.
    NewMessage { payload: ChatEntry },
    /// Delete the entry at `index`. `entry_id` names the entry the sender saw
    /// at that position; receivers prefer it over the index.
    DeleteMessage {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry_id: Option<String>,
    },
    /// Empty the log.
    ClearSession,
    /// Presence announcement for one participant.
    Presence { payload: RosterEntry },
}

impl WireMessage {
    /// The frame's `type` tag.
    pub fn tag(&self) -> &'static str {
        match self {
            WireMessage::SyncHistory { .. } => "SYNC_HISTORY",
            WireMessage::NewMessage { .. } => "NEW_MESSAGE",
            WireMessage::DeleteMessage { .. } => "DELETE_MESSAGE",
            WireMessage::ClearSession => "CLEAR_SESSION",
            WireMessage::Presence { .. } => "PRESENCE",
        }
    }

    /// Whether the host forwards this message to its other guests after
    /// applying it. History snapshots are addressed to a single guest.
    pub fn is_relayed(&self) -> bool {
        !matches!(self, WireMessage::SyncHistory { .. })
    }

    /// Encode as a single JSON line (without the trailing newline). Fails
    /// with [`WireError::Oversized`] past [`MAX_FRAME_BYTES`].
    pub fn encode(&self) -> Result<String, WireError> {
        let line = serde_json::to_string(self)?;
        if line.len() > MAX_FRAME_BYTES {
            return Err(WireError::Oversized {
                tag: self.tag(),
                size: line.len(),
            });
        }
        Ok(line)
    }
}

/// Split a log snapshot into `SYNC_HISTORY` frames that each fit in
/// [`MAX_FRAME_BYTES`]. Always yields at least one frame.
pub fn history_frames(entries: &[ChatEntry]) -> Vec<WireMessage> {
    history_frames_within(entries, MAX_FRAME_BYTES - SNAPSHOT_ENVELOPE_BYTES)
}

fn history_frames_within(entries: &[ChatEntry], budget: usize) -> Vec<WireMessage> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for entry in entries {
        let size = serde_json::to_string(entry).map_or(0, |s| s.len() + 1);
        if used + size > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += size;
        current.push(entry.clone());
    }
    chunks.push(current);

    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, history)| WireMessage::SyncHistory {
            history,
            more: i < last,
        })
        .collect()
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(WireMessage),
    /// A well-formed frame with a tag this build does not understand.
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no type tag")]
    MissingTag,
    #[error("{tag} frame of {size} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    Oversized { tag: &'static str, size: usize },
}

/// Decode one frame.
pub fn decode(line: &str) -> Result<Inbound, WireError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let tag = match value.get("type").and_then(serde_json::Value::as_str) {
        Some(tag) => tag.to_string(),
        None => return Err(WireError::MissingTag),
    };
    if !KNOWN_TAGS.contains(&tag.as_str()) {
        return Ok(Inbound::Unknown(tag));
    }
    Ok(Inbound::Message(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryKind;
    use std::collections::BTreeSet;

    #[test]
    fn tags_match_serialized_type() {
        let messages = vec![
            WireMessage::SyncHistory {
                history: vec![],
                more: false,
            },
            WireMessage::NewMessage {
                payload: ChatEntry::new("You", "hi", EntryKind::User),
            },
            WireMessage::DeleteMessage {
                index: 3,
                entry_id: None,
            },
            WireMessage::ClearSession,
            WireMessage::Presence {
                payload: RosterEntry {
                    peer_id: "p1".to_string(),
                    display_name: "Ann".to_string(),
                    bound_agents: BTreeSet::new(),
                    is_host: true,
                },
            },
        ];
        for msg in messages {
            let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
            assert_eq!(json["type"], msg.tag());
            assert!(KNOWN_TAGS.contains(&msg.tag()));
        }
    }

    #[test]
    fn decode_new_message_from_foreign_peer() {
        let line = r#"{"type":"NEW_MESSAGE","payload":{"sender":"Guest1","text":"hello","kind":"user"}}"#;
        match decode(line).unwrap() {
            Inbound::Message(WireMessage::NewMessage { payload }) => {
                assert_eq!(payload.sender, "Guest1");
                assert_eq!(payload.text, "hello");
                assert!(payload.kind.is_user());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn delete_without_entry_id_decodes() {
        let line = r#"{"type":"DELETE_MESSAGE","index":2}"#;
        assert_eq!(
            decode(line).unwrap(),
            Inbound::Message(WireMessage::DeleteMessage {
                index: 2,
                entry_id: None
            })
        );
        let encoded = WireMessage::DeleteMessage {
            index: 2,
            entry_id: None,
        }
        .encode()
        .unwrap();
        assert!(!encoded.contains("entry_id"));
    }

    #[test]
    fn unit_variant_encodes_with_tag_only() {
        assert_eq!(
            WireMessage::ClearSession.encode().unwrap(),
            r#"{"type":"CLEAR_SESSION"}"#
        );
    }

    #[test]
    fn unknown_tag_is_not_an_error() {
        let line = r#"{"type":"TYPING","peer":"p2"}"#;
        assert_eq!(decode(line).unwrap(), Inbound::Unknown("TYPING".to_string()));
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(matches!(decode("not json"), Err(WireError::Malformed(_))));
        assert!(matches!(decode(r#"{"index":1}"#), Err(WireError::MissingTag)));
        // Known tag with a broken payload.
        assert!(matches!(
            decode(r#"{"type":"DELETE_MESSAGE","index":"two"}"#),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn history_snapshot_is_not_relayed() {
        assert!(
            !WireMessage::SyncHistory {
                history: vec![],
                more: false
            }
            .is_relayed()
        );
        assert!(WireMessage::ClearSession.is_relayed());
    }

    #[test]
    fn large_history_is_split_into_frames_that_fit() {
        let entries: Vec<ChatEntry> = (0..40)
            .map(|i| ChatEntry::new("Host", format!("{i}:{}", "x".repeat(30_000)), EntryKind::User))
            .collect();
        let frames = history_frames(&entries);
        assert!(frames.len() > 1);

        let mut rebuilt = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            assert!(frame.encode().is_ok(), "frame {i} does not fit");
            match frame {
                WireMessage::SyncHistory { history, more } => {
                    assert_eq!(*more, i + 1 < frames.len());
                    rebuilt.extend(history.iter().cloned());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(rebuilt, entries);
    }

    #[test]
    fn empty_history_is_one_final_frame() {
        let frames = history_frames(&[]);
        assert_eq!(
            frames,
            [WireMessage::SyncHistory {
                history: vec![],
                more: false
            }]
        );
        let line = frames[0].encode().unwrap();
        assert_eq!(line, r#"{"type":"SYNC_HISTORY","history":[]}"#);
    }

    #[test]
    fn oversized_frame_is_refused_on_encode() {
        let msg = WireMessage::NewMessage {
            payload: ChatEntry::new("You", "y".repeat(MAX_FRAME_BYTES), EntryKind::User),
        };
        match msg.encode() {
            Err(WireError::Oversized { tag, size }) => {
                assert_eq!(tag, "NEW_MESSAGE");
                assert!(size > MAX_FRAME_BYTES);
            }
            other => panic!("expected Oversized, got {other:?}"),
        }
    }
}
