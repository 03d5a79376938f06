use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::file::{self, Loaded};
use crate::config::Config;
use crate::error::Result;

/// Outcome of a single-key read.
///
/// `RecordStore::get` collapses `Absent` and `Unreadable` into `None`; this
/// type keeps them apart for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome<V> {
    Found(V),
    Absent,
    /// The backing file exists but could not be decoded. The next write
    /// replaces it.
    Unreadable,
}

impl<V> ReadOutcome<V> {
    pub fn into_option(self) -> Option<V> {
        match self {
            ReadOutcome::Found(value) => Some(value),
            ReadOutcome::Absent | ReadOutcome::Unreadable => None,
        }
    }
}

/// A JSON object on disk mapping string keys to values of type `V`.
///
/// Every operation reads the whole file, applies its change and writes the
/// whole file back. There is no locking here; use `RuntimeLock` when a
/// read-modify-write must not interleave with another process.
pub struct RecordStore<V> {
    path: PathBuf,
    _value: PhantomData<fn() -> V>,
}

impl<V> Clone for RecordStore<V> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone())
    }
}

impl<V> std::fmt::Debug for RecordStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").field("path", &self.path).finish()
    }
}

impl<V> RecordStore<V> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _value: PhantomData,
        }
    }

    /// Store backed by `file_name` inside the configured directory
    pub fn in_config(config: &Config, file_name: &str) -> Self {
        Self::new(config.path(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the backing file. A missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        if file::remove_if_exists(&self.path)? {
            debug!(path = %self.path.display(), "Store cleared");
        }
        Ok(())
    }
}

impl<V: Serialize + DeserializeOwned> RecordStore<V> {
    fn load(&self) -> Loaded<BTreeMap<String, V>> {
        file::read_json(&self.path)
    }

    /// Load the mapping, treating a missing or unreadable file as empty
    pub(crate) fn load_or_empty(&self) -> BTreeMap<String, V> {
        match self.load() {
            Loaded::Found(entries) => entries,
            Loaded::Missing => BTreeMap::new(),
            Loaded::Unreadable => {
                warn!(path = %self.path.display(), "Ignoring unreadable store file");
                BTreeMap::new()
            }
        }
    }

    /// Write the mapping back, removing the file when nothing is left
    pub(crate) fn save(&self, entries: &BTreeMap<String, V>) -> Result<()> {
        if entries.is_empty() {
            file::remove_if_exists(&self.path)?;
            debug!(path = %self.path.display(), "Store empty, file removed");
            return Ok(());
        }
        file::write_json_private(&self.path, entries)
    }

    pub fn read(&self, key: &str) -> ReadOutcome<V> {
        match self.load() {
            Loaded::Found(mut entries) => match entries.remove(key) {
                Some(value) => ReadOutcome::Found(value),
                None => ReadOutcome::Absent,
            },
            Loaded::Missing => ReadOutcome::Absent,
            Loaded::Unreadable => ReadOutcome::Unreadable,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.read(key).into_option()
    }

    /// Insert or overwrite `key`
    pub fn set(&self, key: &str, value: V) -> Result<()> {
        let mut entries = self.load_or_empty();
        entries.insert(key.to_string(), value);
        self.save(&entries)
    }

    /// Remove `key`, returning whether it was present.
    /// Removing the last key deletes the file.
    pub fn del(&self, key: &str) -> Result<bool> {
        let mut entries = match self.load() {
            Loaded::Found(entries) => entries,
            Loaded::Missing | Loaded::Unreadable => return Ok(false),
        };

        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.save(&entries)?;
        Ok(true)
    }

    /// Apply `f` to the whole mapping and persist the result
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, V>),
    {
        let mut entries = self.load_or_empty();
        f(&mut entries);
        self.save(&entries)
    }

    pub fn keys(&self) -> Vec<String> {
        self.load_or_empty().into_keys().collect()
    }

    /// All entries in key order
    pub fn entries(&self) -> Vec<(String, V)> {
        self.load_or_empty().into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.load_or_empty().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn test_store() -> (RecordStore<Value>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::new(dir.path().join("records.json"));
        (store, dir)
    }

    #[test]
    fn test_get_missing_file_is_absent() {
        let (store, _dir) = test_store();
        assert_eq!(store.get("anything"), None);
        assert_eq!(store.read("anything"), ReadOutcome::Absent);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_set_then_get() {
        let (store, _dir) = test_store();
        store.set("a", json!({"n": 1, "tags": ["x", "y"]})).unwrap();
        assert_eq!(store.get("a"), Some(json!({"n": 1, "tags": ["x", "y"]})));
    }

    #[test]
    fn test_overwrite_then_delete_removes_file() {
        let (store, _dir) = test_store();
        store.set("a", json!({"n": 1})).unwrap();
        store.set("a", json!({"n": 2})).unwrap();
        assert_eq!(store.get("a"), Some(json!({"n": 2})));

        assert!(store.del("a").unwrap());
        assert_eq!(store.get("a"), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_delete_keeps_other_keys() {
        let (store, _dir) = test_store();
        store.set("a", json!(1)).unwrap();
        store.set("b", json!(2)).unwrap();

        store.del("a").unwrap();
        assert!(store.path().exists());
        assert_eq!(store.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn test_delete_missing_key_is_noop() {
        let (store, _dir) = test_store();
        assert!(!store.del("nope").unwrap());

        store.set("a", json!(1)).unwrap();
        assert!(!store.del("nope").unwrap());
        assert_eq!(store.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_corrupt_file_reads_as_empty() {
        let (store, _dir) = test_store();
        std::fs::write(store.path(), b"\x00\x01 definitely not json").unwrap();

        assert_eq!(store.get("a"), None);
        assert_eq!(store.read("a"), ReadOutcome::Unreadable);
        assert!(!store.del("a").unwrap());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_set_heals_corrupt_file() {
        let (store, _dir) = test_store();
        std::fs::write(store.path(), b"{\"truncated\": ").unwrap();

        store.set("a", json!({"ok": true})).unwrap();

        let contents = std::fs::read_to_string(store.path()).unwrap();
        let parsed: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed, json!({"a": {"ok": true}}));
    }

    #[test]
    fn test_file_is_pretty_printed() {
        let (store, _dir) = test_store();
        store.set("a", json!({"n": 1})).unwrap();
        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert!(contents.contains('\n'));
        assert!(contents.contains("  \"a\""));
    }

    #[test]
    fn test_clear_is_unconditional() {
        let (store, _dir) = test_store();
        store.clear().unwrap();

        store.set("a", json!(1)).unwrap();
        store.set("b", json!(2)).unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_to_empty_removes_file() {
        let (store, _dir) = test_store();
        store.set("a", json!(1)).unwrap();
        store.update(|entries| entries.clear()).unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_entries_in_key_order() {
        let (store, _dir) = test_store();
        store.set("b", json!(2)).unwrap();
        store.set("a", json!(1)).unwrap();

        let entries = store.entries();
        assert_eq!(
            entries,
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        );
    }

    #[test]
    fn test_typed_values_tolerate_unknown_fields() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Entry {
            name: String,
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("typed.json");
        std::fs::write(&path, r#"{"k": {"name": "x", "extra": 42}}"#).unwrap();

        let store: RecordStore<Entry> = RecordStore::new(path);
        assert_eq!(
            store.get("k"),
            Some(Entry {
                name: "x".to_string()
            })
        );
    }
}
