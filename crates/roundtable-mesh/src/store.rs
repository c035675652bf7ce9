//! Local key-value persistence for session data.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const STORE_FILE: &str = "store.json";

/// Key holding the persisted chat log.
pub const KEY_CHAT_HISTORY: &str = "chat_history";
/// Key holding the local display name.
pub const KEY_USERNAME: &str = "username";

/// Best-effort get/set persistence of JSON values.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Store backed by a single JSON object file in the state directory.
///
/// Every `set` rewrites the whole file through a temp file and rename, so a
/// crash mid-write leaves the previous contents intact.
pub struct FileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl FileStore {
    /// Load the store from `state_dir`, or start empty.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(STORE_FILE);
        let values = if path.exists() {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&data).context("invalid store.json")?
        } else {
            Map::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn write(&self, values: &Map<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(values)?;
        std::fs::write(&tmp, data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
        self.write(&values)
    }
}

/// Volatile store, for tests and `--ephemeral` nodes.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<Map<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.set(KEY_USERNAME, json!("Ann")).unwrap();
            store.set(KEY_CHAT_HISTORY, json!([])).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get(KEY_USERNAME), Some(json!("Ann")));
        assert_eq!(store.get(KEY_CHAT_HISTORY), Some(json!([])));
        assert_eq!(store.get("missing"), None);
        assert!(!dir.path().join("store.json.tmp").exists());
    }

    #[test]
    fn file_store_overwrites_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set(KEY_USERNAME, json!("Ann")).unwrap();
        store.set(KEY_USERNAME, json!("Bob")).unwrap();
        assert_eq!(store.get(KEY_USERNAME), Some(json!("Bob")));
    }

    #[test]
    fn corrupt_store_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STORE_FILE), "{not json").unwrap();
        assert!(FileStore::open(dir.path()).is_err());
    }

    #[test]
    fn memory_store_get_set() {
        let store = MemoryStore::new();
        assert_eq!(store.get(KEY_USERNAME), None);
        store.set(KEY_USERNAME, json!("Ann")).unwrap();
        assert_eq!(store.get(KEY_USERNAME), Some(json!("Ann")));
    }
}
