//! Key-value persistence contract the core consumes.
//!
//! The core only needs `save`, `load` and `remove`; running without any
//! persistence backend is a legal configuration. [`FileStore`] is a simple
//! JSON-file implementation for deployments that want subscriptions to
//! survive a restart.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::JoynrError;

/// Append/rewrite key-value store keyed by subscription, participant or
/// message id.
pub trait KeyValueStore: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), JoynrError>;
    fn load(&self) -> Result<Vec<(String, Vec<u8>)>, JoynrError>;
    fn remove(&self, key: &str) -> Result<(), JoynrError>;
}

/// JSON-file backed store; the whole map is rewritten on every change.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").field("path", &self.path).finish()
    }
}

impl FileStore {
    /// Open (or create) the store at `path`, loading existing entries.
    ///
    /// # Errors
    ///
    /// Returns [`JoynrError::Persistence`] if an existing file cannot be
    /// read or parsed.
    pub fn open(path: PathBuf) -> Result<Self, JoynrError> {
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| JoynrError::Persistence(format!("read {}: {e}", path.display())))?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str::<HashMap<String, Vec<u8>>>(&raw).map_err(|e| {
                    JoynrError::Persistence(format!("parse {}: {e}", path.display()))
                })?
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn rewrite(&self, entries: &HashMap<String, Vec<u8>>) -> Result<(), JoynrError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| JoynrError::Persistence(format!("mkdir {}: {e}", parent.display())))?;
        }
        let raw = serde_json::to_string(entries)
            .map_err(|e| JoynrError::Persistence(e.to_string()))?;
        fs::write(&self.path, raw)
            .map_err(|e| JoynrError::Persistence(format!("write {}: {e}", self.path.display())))
    }
}

impl KeyValueStore for FileStore {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), JoynrError> {
        let mut entries = self.entries.lock().expect("store lock");
        entries.insert(key.to_owned(), value.to_vec());
        self.rewrite(&entries)
    }

    fn load(&self) -> Result<Vec<(String, Vec<u8>)>, JoynrError> {
        let entries = self.entries.lock().expect("store lock");
        Ok(entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn remove(&self, key: &str) -> Result<(), JoynrError> {
        let mut entries = self.entries.lock().expect("store lock");
        if entries.remove(key).is_some() {
            self.rewrite(&entries)?;
        }
        Ok(())
    }
}
