//! Single-writer JSON-file persistence.
//!
//! Each store owns one file under the state directory: the full record
//! map lives in memory behind a mutex and every mutation rewrites the
//! file under that lock. Open one store per file and share the handle;
//! concurrent handles on the same file would reintroduce lost updates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{OrchestratorError, Result};

/// Resolve the state directory from `ORCHESTRATOR_STATE_DIR` env var,
/// defaulting to `./orchestrator-state`.
///
/// Creates the directory with restrictive permissions (0o700) if it doesn't exist.
pub fn state_dir() -> PathBuf {
    let dir = std::env::var("ORCHESTRATOR_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("orchestrator-state"));

    if !dir.exists() {
        std::fs::create_dir_all(&dir).ok();
        // Restrict directory permissions: only owner can read/write/traverse.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }

    dir
}

fn restrict_file(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).ok();
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// String-keyed map of records persisted as one JSON file.
#[derive(Debug)]
pub struct PersistentStore<V> {
    path: PathBuf,
    records: Mutex<HashMap<String, V>>,
}

impl<V> PersistentStore<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Open the store, loading existing records from `path`.
    ///
    /// A corrupt file is an error rather than an empty store; losing
    /// sessions or the authenticator secret silently is worse than
    /// refusing to start.
    pub fn open(path: PathBuf) -> Result<Self> {
        let records = if path.exists() {
            let data = std::fs::read_to_string(&path).map_err(|err| {
                OrchestratorError::Storage(format!("read {}: {err}", path.display()))
            })?;
            serde_json::from_str(&data).map_err(|err| {
                OrchestratorError::Storage(format!("corrupt store {}: {err}", path.display()))
            })?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, V>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self, records: &HashMap<String, V>) -> Result<()> {
        let data = serde_json::to_string_pretty(records).map_err(|err| {
            OrchestratorError::Storage(format!("serialize {}: {err}", self.path.display()))
        })?;
        std::fs::write(&self.path, data).map_err(|err| {
            OrchestratorError::Storage(format!("write {}: {err}", self.path.display()))
        })?;
        restrict_file(&self.path);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn find<F>(&self, predicate: F) -> Option<V>
    where
        F: Fn(&V) -> bool,
    {
        self.lock().values().find(|v| predicate(v)).cloned()
    }

    pub fn values(&self) -> Vec<V> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn insert(&self, key: String, value: V) -> Result<()> {
        let mut records = self.lock();
        records.insert(key, value);
        self.save(&records)
    }

    pub fn remove(&self, key: &str) -> Result<Option<V>> {
        let mut records = self.lock();
        let prev = records.remove(key);
        if prev.is_some() {
            self.save(&records)?;
        }
        Ok(prev)
    }

    pub fn update<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut V),
    {
        let mut records = self.lock();
        let updated = match records.get_mut(key) {
            Some(value) => {
                f(value);
                true
            }
            None => false,
        };
        if updated {
            self.save(&records)?;
        }
        Ok(updated)
    }

    /// Drop every record the predicate rejects; returns how many were dropped.
    pub fn retain<F>(&self, f: F) -> Result<usize>
    where
        F: FnMut(&String, &mut V) -> bool,
    {
        let mut records = self.lock();
        let before = records.len();
        records.retain(f);
        let dropped = before - records.len();
        if dropped > 0 {
            self.save(&records)?;
        }
        Ok(dropped)
    }

    /// Replace the whole record set, rewriting the file even when empty.
    pub fn replace(&self, map: HashMap<String, V>) -> Result<()> {
        let mut records = self.lock();
        *records = map;
        self.save(&records)
    }

    pub fn clear(&self) -> Result<()> {
        self.replace(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(dir: &tempfile::TempDir) -> PersistentStore<String> {
        PersistentStore::open(dir.path().join("records.json")).unwrap()
    }

    #[test]
    fn insert_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);

        store.insert("k1".into(), "v1".into()).unwrap();
        assert_eq!(store.get("k1"), Some("v1".into()));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let store = PersistentStore::<String>::open(path.clone()).unwrap();
        store.insert("k1".into(), "v1".into()).unwrap();
        drop(store);

        let reopened = PersistentStore::<String>::open(path).unwrap();
        assert_eq!(reopened.get("k1"), Some("v1".into()));
    }

    #[test]
    fn remove_returns_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);

        store.insert("k1".into(), "v1".into()).unwrap();
        assert_eq!(store.remove("k1").unwrap(), Some("v1".into()));
        assert_eq!(store.remove("k1").unwrap(), None);
    }

    #[test]
    fn update_missing_key_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);

        assert!(!store.update("missing", |_| {}).unwrap());

        store.insert("k1".into(), "v1".into()).unwrap();
        assert!(store.update("k1", |v| v.push('!')).unwrap());
        assert_eq!(store.get("k1"), Some("v1!".into()));
    }

    #[test]
    fn retain_drops_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let store = PersistentStore::<String>::open(path.clone()).unwrap();
        store.insert("keep".into(), "a".into()).unwrap();
        store.insert("drop".into(), "b".into()).unwrap();

        let dropped = store.retain(|k, _| k == "keep").unwrap();
        assert_eq!(dropped, 1);
        drop(store);

        let reopened = PersistentStore::<String>::open(path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("keep"), Some("a".into()));
    }

    #[test]
    fn clear_rewrites_file_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");

        let store = PersistentStore::<String>::open(path.clone()).unwrap();
        store.insert("k1".into(), "v1".into()).unwrap();
        store.clear().unwrap();
        drop(store);

        let reopened = PersistentStore::<String>::open(path).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = PersistentStore::<String>::open(path).unwrap_err();
        assert!(err.to_string().contains("corrupt store"));
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let store = PersistentStore::<String>::open(path.clone()).unwrap();
        store.insert("k1".into(), "v1".into()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
