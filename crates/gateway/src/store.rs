/// Key-value storage for session state
/// String keys to string values, the way browser local storage behaves
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{GatewayError, Result};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Writes replace the whole value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store scoped to one session
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object, rewritten after every change
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| GatewayError::Storage(e.to_string()))?;
        }

        let entries = if path.exists() {
            let data =
                fs::read_to_string(&path).map_err(|e| GatewayError::Storage(e.to_string()))?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!("Discarding unreadable store {}: {}", path.display(), e);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let entries = self.entries.read();
        let json = serde_json::to_string_pretty(&*entries)?;
        drop(entries);

        fs::write(&self.path, json).map_err(|e| GatewayError::Storage(e.to_string()))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        self.save()
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = self.entries.write().remove(key);
        if removed.is_some() {
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("a"), None);

        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").as_deref(), Some("2"));

        store.remove("a").unwrap();
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn test_file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.set("falai_api_key", "key-123").unwrap();
            store.set("daily_api_calls", "4").unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("falai_api_key").as_deref(), Some("key-123"));
        assert_eq!(reopened.get("daily_api_calls").as_deref(), Some("4"));
    }

    #[test]
    fn test_file_store_recovers_from_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get("anything"), None);
        store.set("k", "v").unwrap();
        assert_eq!(JsonFileStore::open(&path).unwrap().get("k").as_deref(), Some("v"));
    }
}
