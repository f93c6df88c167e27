//! Local key/value persistence
//!
//! The client keeps its state as JSON strings keyed by problem id and section,
//! the same way a browser keeps it in local storage. Access is read-then-write
//! without transactions; a single session is assumed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Errors raised by a store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A string key/value store
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// Per-problem sections of local state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Steps,
    Code,
    Problem,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::Steps => "steps",
            Section::Code => "code",
            Section::Problem => "problem",
        };
        write!(f, "{}", name)
    }
}

/// Key under which a problem's section is stored
pub fn problem_key(problem_id: &str, section: Section) -> String {
    format!("{}:{}", problem_id, section)
}

/// Reads and deserializes a JSON value
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serializes and writes a JSON value
pub fn save_json<T: Serialize>(
    store: &mut dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw)
}

/// Store kept in memory only
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk, rewritten on every change
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl FileStore {
    /// Opens the store at `path`, starting empty if the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let raw = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&self.path, raw).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Step, StepTree};

    #[test]
    fn test_problem_key() {
        assert_eq!(problem_key("two-sum", Section::Steps), "two-sum:steps");
        assert_eq!(problem_key("42", Section::Code), "42:code");
    }

    #[test]
    fn test_memory_store_json_roundtrip() {
        let mut store = MemoryStore::new();
        let tree = StepTree::from_steps(vec![Step::new("a", "Read input")]);
        save_json(&mut store, "p:steps", &tree).unwrap();

        let loaded: Option<StepTree> = load_json(&store, "p:steps").unwrap();
        assert_eq!(loaded, Some(tree));

        store.remove("p:steps").unwrap();
        let loaded: Option<StepTree> = load_json(&store, "p:steps").unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn test_file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let mut store = FileStore::open(&path).unwrap();
        store.set("token", "abc".to_string()).unwrap();
        drop(store);

        let mut reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("token").unwrap(), Some("abc".to_string()));
        reopened.remove("token").unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get("token").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
