//! Durable pairing records.
//!
//! A JSON file with one root object keyed by the lowercase hex instance UID;
//! each value carries exactly the pairing slot `index` and the 32-byte `key`
//! in lowercase hex. A missing file is an empty store, unknown keys are
//! ignored on read and malformed entries are skipped with a warning, so the
//! format can grow without breaking older readers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::types::PairingInfo;
use crate::{Error, Result};

/// File-backed map of card instance UID → pairing record.
#[derive(Debug)]
pub struct PairingStore {
    path: PathBuf,
    entries: BTreeMap<String, PairingInfo>,
}

impl PairingStore {
    /// Load the store at `path`, treating a missing file as empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => parse_entries(&contents, &path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "pairing store loaded");
        Ok(Self { path, entries })
    }

    /// Pairing for a card instance, if stored.
    pub fn get(&self, instance_uid_hex: &str) -> Option<&PairingInfo> {
        self.entries.get(instance_uid_hex)
    }

    /// Insert or replace a pairing and flush to disk.
    pub fn insert(&mut self, instance_uid_hex: &str, pairing: PairingInfo) -> Result<()> {
        self.entries.insert(instance_uid_hex.to_lowercase(), pairing);
        self.flush()
    }

    /// Remove a pairing and flush to disk.
    pub fn remove(&mut self, instance_uid_hex: &str) -> Result<Option<PairingInfo>> {
        let removed = self.entries.remove(instance_uid_hex);
        if removed.is_some() {
            self.flush()?;
        }
        Ok(removed)
    }

    /// Number of stored pairings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // Write the whole store; readers only ever observe the renamed file.
    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut root = Map::new();
        for (uid, pairing) in &self.entries {
            root.insert(
                uid.clone(),
                json!({
                    "index": pairing.index,
                    "key": hex::encode(pairing.key),
                }),
            );
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&Value::Object(root))?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_entries(contents: &str, path: &Path) -> Result<BTreeMap<String, PairingInfo>> {
    let root: Value = serde_json::from_str(contents)?;
    let Value::Object(root) = root else {
        return Err(Error::InvalidData("pairing store root is not an object"));
    };

    let mut entries = BTreeMap::new();
    for (uid, record) in root {
        match parse_record(&record) {
            Some(pairing) => {
                entries.insert(uid.to_lowercase(), pairing);
            }
            None => {
                warn!(path = %path.display(), %uid, "skipping malformed pairing entry");
            }
        }
    }
    Ok(entries)
}

fn parse_record(record: &Value) -> Option<PairingInfo> {
    let index = u8::try_from(record.get("index")?.as_u64()?).ok()?;
    let key_hex = record.get("key")?.as_str()?;
    let key_bytes = hex::decode(key_hex).ok()?;
    let key: [u8; 32] = key_bytes.try_into().ok()?;
    Some(PairingInfo { key, index })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("pairings.json")
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::load(store_path(&dir)).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let pairing = PairingInfo {
            key: [0xAB; 32],
            index: 1,
        };

        {
            let mut store = PairingStore::load(&path).unwrap();
            store
                .insert("00112233445566778899aabbccddeeff", pairing.clone())
                .unwrap();
        }

        let store = PairingStore::load(&path).unwrap();
        assert_eq!(
            store.get("00112233445566778899aabbccddeeff"),
            Some(&pairing)
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/pairings.json");
        let mut store = PairingStore::load(&path).unwrap();
        store
            .insert(
                "ffeeddccbbaa99887766554433221100",
                PairingInfo {
                    key: [1; 32],
                    index: 0,
                },
            )
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn remove_flushes_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        let mut store = PairingStore::load(&path).unwrap();
        store
            .insert(
                "00000000000000000000000000000001",
                PairingInfo {
                    key: [2; 32],
                    index: 3,
                },
            )
            .unwrap();
        assert!(store
            .remove("00000000000000000000000000000001")
            .unwrap()
            .is_some());

        let reloaded = PairingStore::load(&path).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn malformed_entries_are_skipped_and_unknown_keys_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = store_path(&dir);
        fs::write(
            &path,
            r#"{
                "00112233445566778899aabbccddeeff": {
                    "index": 0,
                    "key": "2222222222222222222222222222222222222222222222222222222222222222",
                    "comment": "extra fields are fine"
                },
                "deadbeef": { "index": "zero", "key": 17 },
                "cafebabe": { "index": 1, "key": "abc" }
            }"#,
        )
        .unwrap();

        let store = PairingStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(
            store
                .get("00112233445566778899aabbccddeeff")
                .map(|p| p.index),
            Some(0)
        );
    }
}
