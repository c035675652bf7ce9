//! The ordered, mutable chat log shared by every session participant.
//!
//! Positions are the display identity of an entry and shift down on delete.
//! Every entry also carries a stable id so remote deletes can find the entry
//! the sender meant even after concurrent changes moved it.

use crate::store::{KEY_CHAT_HISTORY, KeyValueStore};
use regex::Regex;
use roundtable::model::{ChatEntry, EntryKind, LogChange};
use std::sync::{Arc, LazyLock};
use tokio::sync::broadcast;

/// Boilerplate that chat sites prepend to scraped replies.
static BOILERPLATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(thinking(\.\.\.|…)|chatgpt\s*said:|here is the response|answer:)").unwrap()
});

/// Trim `text` and strip one leading boilerplate prefix.
pub fn clean_text(text: &str) -> String {
    let trimmed = text.trim();
    BOILERPLATE.replace(trimmed, "").trim().to_string()
}

/// Where a destructive mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The local user. Destructive changes need an explicit confirmation.
    Local { confirmed: bool },
    /// A peer already confirmed it before broadcasting.
    Remote,
}

impl Origin {
    fn permits(self) -> bool {
        match self {
            Origin::Local { confirmed } => confirmed,
            Origin::Remote => true,
        }
    }
}

pub struct ChatLog {
    entries: Vec<ChatEntry>,
    store: Arc<dyn KeyValueStore>,
    changes: broadcast::Sender<LogChange>,
}

impl ChatLog {
    /// Restore the log from `store`. A missing or unreadable history starts
    /// empty.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let entries = match store.get(KEY_CHAT_HISTORY) {
            Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                tracing::warn!(err = %e, "discarding unreadable chat history");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let (changes, _) = broadcast::channel(256);
        Self {
            entries,
            store,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogChange> {
        self.changes.subscribe()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&ChatEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a locally produced entry. Returns `None` when the text is empty
    /// after cleaning.
    pub fn append(&mut self, sender: &str, text: &str, kind: EntryKind) -> Option<usize> {
        self.append_entry(ChatEntry::new(sender, text, kind))
    }

    /// Append an entry produced elsewhere, keeping its id and timestamp.
    pub fn append_entry(&mut self, mut entry: ChatEntry) -> Option<usize> {
        entry.text = clean_text(&entry.text);
        if entry.text.is_empty() {
            return None;
        }
        let index = self.entries.len();
        self.entries.push(entry.clone());
        self.persist();
        self.notify(LogChange::Appended { index, entry });
        Some(index)
    }

    /// Replace the text at `index`. Returns whether anything changed.
    pub fn edit_text(&mut self, index: usize, new_text: &str) -> bool {
        let new_text = new_text.trim();
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        if new_text.is_empty() || entry.text == new_text {
            return false;
        }
        entry.text = new_text.to_string();
        let entry = entry.clone();
        self.persist();
        self.notify(LogChange::Edited { index, entry });
        true
    }

    /// Remove the entry at `index`, shifting later entries down.
    pub fn delete_at(&mut self, index: usize, origin: Origin) -> Option<ChatEntry> {
        if !origin.permits() || index >= self.entries.len() {
            return None;
        }
        let removed = self.entries.remove(index);
        self.persist();
        self.notify(LogChange::Deleted {
            index,
            entry_id: removed.id.clone(),
        });
        Some(removed)
    }

    /// Empty the log. Returns whether the clear was permitted.
    pub fn clear(&mut self, origin: Origin) -> bool {
        if !origin.permits() {
            return false;
        }
        self.entries.clear();
        self.persist();
        self.notify(LogChange::Cleared);
        true
    }

    /// Install a full snapshot verbatim. Used only for session resync.
    pub fn replace_all(&mut self, entries: Vec<ChatEntry>) {
        self.entries = entries;
        self.persist();
        self.notify(LogChange::Replaced {
            len: self.entries.len(),
        });
    }

    /// Most recent entry whose sender is `sender`.
    pub fn last_from(&self, sender: &str) -> Option<&ChatEntry> {
        self.entries.iter().rev().find(|e| e.sender == sender)
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    fn persist(&self) {
        let value = match serde_json::to_value(&self.entries) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(err = %e, "failed to encode chat history");
                return;
            }
        };
        if let Err(e) = self.store.set(KEY_CHAT_HISTORY, value) {
            tracing::warn!(err = %e, "failed to save chat history");
        }
    }

    fn notify(&self, change: LogChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}
