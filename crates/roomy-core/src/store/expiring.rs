use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::record::RecordStore;
use crate::config::Config;
use crate::error::Result;

/// A value as written to disk: the caller's fields plus a capture timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Stamped<V> {
    #[serde(flatten)]
    pub value: V,
    pub stored_at: DateTime<Utc>,
}

impl<V> Stamped<V> {
    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.stored_at > ttl
    }
}

/// `RecordStore` whose entries expire `ttl` after they were written.
///
/// Values must serialize as JSON objects; the `stored_at` field is added
/// alongside their own fields. Expired entries are dropped on every `set` and
/// when a `get` finds them. Nothing sweeps in the background.
pub struct ExpiringRecordStore<V> {
    inner: RecordStore<Stamped<V>>,
    ttl: Duration,
}

impl<V> Clone for ExpiringRecordStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            ttl: self.ttl,
        }
    }
}

impl<V> std::fmt::Debug for ExpiringRecordStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringRecordStore")
            .field("path", &self.inner.path())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<V: Serialize + DeserializeOwned> ExpiringRecordStore<V> {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            inner: RecordStore::new(path),
            ttl,
        }
    }

    /// Store backed by `file_name` in the config directory, using the configured state TTL
    pub fn in_config(config: &Config, file_name: &str) -> Self {
        Self::new(config.path(file_name), config.state_ttl)
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert `key` stamped with the current time, dropping expired entries first
    pub fn set(&self, key: &str, value: V) -> Result<()> {
        let now = Utc::now();
        let ttl = self.ttl;

        self.inner.update(|entries| {
            let before = entries.len();
            entries.retain(|_, stamped| !stamped.is_expired(ttl, now));
            let purged = before - entries.len();
            if purged > 0 {
                debug!(purged, "Purged expired entries");
            }

            entries.insert(
                key.to_string(),
                Stamped {
                    value,
                    stored_at: now,
                },
            );
        })
    }

    /// Fetch `key` if it has not expired. An expired entry is deleted.
    pub fn get(&self, key: &str) -> Result<Option<V>> {
        let Some(stamped) = self.inner.get(key) else {
            return Ok(None);
        };

        if stamped.is_expired(self.ttl, Utc::now()) {
            debug!(key, stored_at = %stamped.stored_at, "Entry expired");
            self.inner.del(key)?;
            return Ok(None);
        }

        Ok(Some(stamped.value))
    }

    /// Fetch and remove `key` in one step, for values that may only be used once
    pub fn take(&self, key: &str) -> Result<Option<V>> {
        let value = self.get(key)?;
        if value.is_some() {
            self.inner.del(key)?;
        }
        Ok(value)
    }

    pub fn del(&self, key: &str) -> Result<bool> {
        self.inner.del(key)
    }

    pub fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    /// Keys of entries that have not expired
    pub fn live_keys(&self) -> Vec<String> {
        let now = Utc::now();
        self.inner
            .entries()
            .into_iter()
            .filter(|(_, stamped)| !stamped.is_expired(self.ttl, now))
            .map(|(key, _)| key)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct FlowState {
        code_verifier: String,
    }

    fn flow(verifier: &str) -> FlowState {
        FlowState {
            code_verifier: verifier.to_string(),
        }
    }

    fn test_store() -> (ExpiringRecordStore<FlowState>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ExpiringRecordStore::new(dir.path().join("states.json"), Duration::hours(1));
        (store, dir)
    }

    /// Write an entry directly with a chosen timestamp
    fn write_backdated(store: &ExpiringRecordStore<FlowState>, key: &str, age: Duration) {
        store
            .inner
            .set(
                key,
                Stamped {
                    value: flow(key),
                    stored_at: Utc::now() - age,
                },
            )
            .unwrap();
    }

    fn raw(store: &ExpiringRecordStore<FlowState>) -> Value {
        serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap()
    }

    #[test]
    fn test_set_then_get_strips_timestamp() {
        let (store, _dir) = test_store();
        store.set("s1", flow("v1")).unwrap();

        assert_eq!(store.get("s1").unwrap(), Some(flow("v1")));

        let on_disk = raw(&store);
        assert_eq!(on_disk["s1"]["code_verifier"], json!("v1"));
        assert!(on_disk["s1"]["stored_at"].is_string());
    }

    #[test]
    fn test_entry_just_inside_ttl_is_returned() {
        let (store, _dir) = test_store();
        write_backdated(&store, "fresh", Duration::hours(1) - Duration::minutes(1));

        assert_eq!(store.get("fresh").unwrap(), Some(flow("fresh")));
    }

    #[test]
    fn test_entry_past_ttl_is_absent_and_removed() {
        let (store, _dir) = test_store();
        write_backdated(&store, "old", Duration::hours(1) + Duration::seconds(1));

        assert_eq!(store.get("old").unwrap(), None);
        // Only entry, so the file goes with it
        assert!(!store.path().exists());

        // Second read is still absent and does not fail
        assert_eq!(store.get("old").unwrap(), None);
    }

    #[test]
    fn test_expired_get_keeps_other_entries() {
        let (store, _dir) = test_store();
        write_backdated(&store, "old", Duration::hours(2));
        store.set("new", flow("new")).unwrap();
        // set already purged "old"; put it back to exercise the get path
        write_backdated(&store, "old", Duration::hours(2));

        assert_eq!(store.get("old").unwrap(), None);
        assert_eq!(store.get("new").unwrap(), Some(flow("new")));
        assert!(raw(&store).get("old").is_none());
    }

    #[test]
    fn test_set_purges_expired_entries() {
        let (store, _dir) = test_store();
        write_backdated(&store, "abandoned-1", Duration::hours(3));
        write_backdated(&store, "abandoned-2", Duration::minutes(61));
        write_backdated(&store, "recent", Duration::minutes(5));

        store.set("current", flow("current")).unwrap();

        let on_disk = raw(&store);
        let keys: Vec<_> = on_disk.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["current".to_string(), "recent".to_string()]);
    }

    #[test]
    fn test_take_consumes_entry() {
        let (store, _dir) = test_store();
        store.set("once", flow("v")).unwrap();

        assert_eq!(store.take("once").unwrap(), Some(flow("v")));
        assert_eq!(store.take("once").unwrap(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_file_is_absent_then_healed() {
        let (store, _dir) = test_store();
        std::fs::write(store.path(), "garbage").unwrap();

        assert_eq!(store.get("s1").unwrap(), None);
        store.set("s1", flow("v1")).unwrap();
        assert_eq!(store.get("s1").unwrap(), Some(flow("v1")));
    }

    #[test]
    fn test_live_keys_skips_expired() {
        let (store, _dir) = test_store();
        write_backdated(&store, "old", Duration::hours(2));
        write_backdated(&store, "new", Duration::minutes(2));

        assert_eq!(store.live_keys(), vec!["new".to_string()]);
    }
}
