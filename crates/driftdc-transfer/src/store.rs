//! Persisted download state.
//!
//! The queue survives restarts through this collaborator. The interface
//! mirrors what the scheduler needs and nothing more; the default
//! implementation is a JSON file rewritten atomically, with an in-memory
//! variant for tests.

use crate::item::{DlError, Priority};
use driftdc_hub::Uid;
use driftdc_tth::Root;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// One persisted item row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlRow {
    /// Base32 content hash.
    pub tth: String,
    /// Total size.
    pub size: u64,
    /// Destination path.
    pub dest: PathBuf,
    /// Priority code.
    pub prio: i8,
    /// Error code.
    pub err: i8,
    /// Error message.
    pub err_msg: Option<String>,
    /// Length of the stored leaf blob, 0 if absent.
    pub tthl_len: u32,
}

/// One persisted source row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlSourceRow {
    /// Base32 content hash.
    pub tth: String,
    /// Source uid.
    pub uid: u64,
    /// Per-source error code.
    pub err: i8,
    /// Per-source error message.
    pub err_msg: Option<String>,
}

/// The persistence collaborator.
pub trait DlStore: Send + Sync {
    /// All persisted items.
    fn list_dls(&self) -> Vec<DlRow>;
    /// All persisted sources.
    fn list_dl_sources(&self) -> Vec<DlSourceRow>;
    /// Insert a new item.
    fn insert_dl(&self, row: DlRow);
    /// Update an item's priority/error status.
    fn set_status(&self, tth: Root, prio: Priority, err: DlError, err_msg: Option<&str>);
    /// Set or clear a per-source error.
    fn set_uerr(&self, uid: Uid, tth: Root, err: DlError, err_msg: Option<&str>);
    /// Store the leaf blob for an item.
    fn set_tthl(&self, tth: Root, bytes: &[u8]);
    /// Fetch the leaf blob for an item.
    fn get_tthl(&self, tth: Root) -> Option<Vec<u8>>;
    /// Store the verified-block bitmap for an item.
    fn set_bitmap(&self, tth: Root, bytes: &[u8]);
    /// Fetch the verified-block bitmap for an item.
    fn get_bitmap(&self, tth: Root) -> Option<Vec<u8>>;
    /// Add a source pairing.
    fn insert_source(&self, row: DlSourceRow);
    /// Remove an item and everything attached to it.
    fn remove_dl(&self, tth: Root);
    /// Remove one source pairing.
    fn remove_user(&self, uid: Uid, tth: Root);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    items: Vec<DlRow>,
    sources: Vec<DlSourceRow>,
    #[serde(default)]
    tthl: HashMap<String, Vec<u8>>,
    #[serde(default)]
    bitmaps: HashMap<String, Vec<u8>>,
}

impl StoreData {
    fn apply_status(&mut self, tth: Root, prio: Priority, err: DlError, err_msg: Option<&str>) {
        let key = tth.to_base32();
        for row in &mut self.items {
            if row.tth == key {
                row.prio = prio.code();
                row.err = err.code();
                row.err_msg = err_msg.map(str::to_owned);
            }
        }
    }

    fn apply_uerr(&mut self, uid: Uid, tth: Root, err: DlError, err_msg: Option<&str>) {
        let key = tth.to_base32();
        for row in &mut self.sources {
            if row.tth == key && row.uid == uid.0 {
                row.err = err.code();
                row.err_msg = err_msg.map(str::to_owned);
            }
        }
    }

    fn apply_remove_dl(&mut self, tth: Root) {
        let key = tth.to_base32();
        self.items.retain(|r| r.tth != key);
        self.sources.retain(|r| r.tth != key);
        self.tthl.remove(&key);
        self.bitmaps.remove(&key);
    }
}

/// In-memory store for tests and throwaway sessions.
#[derive(Default)]
pub struct MemStore {
    data: Mutex<StoreData>,
}

impl MemStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut StoreData) -> R) -> R {
        let mut guard = self
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

impl DlStore for MemStore {
    fn list_dls(&self) -> Vec<DlRow> {
        self.with(|d| d.items.clone())
    }

    fn list_dl_sources(&self) -> Vec<DlSourceRow> {
        self.with(|d| d.sources.clone())
    }

    fn insert_dl(&self, row: DlRow) {
        self.with(|d| d.items.push(row));
    }

    fn set_status(&self, tth: Root, prio: Priority, err: DlError, err_msg: Option<&str>) {
        self.with(|d| d.apply_status(tth, prio, err, err_msg));
    }

    fn set_uerr(&self, uid: Uid, tth: Root, err: DlError, err_msg: Option<&str>) {
        self.with(|d| d.apply_uerr(uid, tth, err, err_msg));
    }

    fn set_tthl(&self, tth: Root, bytes: &[u8]) {
        self.with(|d| {
            d.tthl.insert(tth.to_base32(), bytes.to_vec());
        });
    }

    fn get_tthl(&self, tth: Root) -> Option<Vec<u8>> {
        self.with(|d| d.tthl.get(&tth.to_base32()).cloned())
    }

    fn set_bitmap(&self, tth: Root, bytes: &[u8]) {
        self.with(|d| {
            d.bitmaps.insert(tth.to_base32(), bytes.to_vec());
        });
    }

    fn get_bitmap(&self, tth: Root) -> Option<Vec<u8>> {
        self.with(|d| d.bitmaps.get(&tth.to_base32()).cloned())
    }

    fn insert_source(&self, row: DlSourceRow) {
        self.with(|d| d.sources.push(row));
    }

    fn remove_dl(&self, tth: Root) {
        self.with(|d| d.apply_remove_dl(tth));
    }

    fn remove_user(&self, uid: Uid, tth: Root) {
        let key = tth.to_base32();
        self.with(|d| {
            d.sources.retain(|r| !(r.tth == key && r.uid == uid.0));
        });
    }
}

/// JSON-file-backed store. Every mutation rewrites the file through a
/// rename, so a crash never leaves a half-written queue.
pub struct JsonStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonStore {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// I/O or JSON failure while reading an existing file.
    pub fn open(path: PathBuf) -> std::io::Result<Self> {
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> R {
        let guard = self
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&guard)
    }

    fn with<R>(&self, f: impl FnOnce(&mut StoreData) -> R) -> R {
        let mut guard = self
            .data
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let out = f(&mut guard);
        if let Ok(bytes) = serde_json::to_vec_pretty(&*guard) {
            let tmp = self.path.with_extension("tmp");
            if std::fs::write(&tmp, &bytes)
                .and_then(|()| std::fs::rename(&tmp, &self.path))
                .is_err()
            {
                tracing::warn!(path = %self.path.display(), "failed to persist download state");
            }
        }
        out
    }
}

impl DlStore for JsonStore {
    fn list_dls(&self) -> Vec<DlRow> {
        self.read(|d| d.items.clone())
    }

    fn list_dl_sources(&self) -> Vec<DlSourceRow> {
        self.read(|d| d.sources.clone())
    }

    fn insert_dl(&self, row: DlRow) {
        self.with(|d| d.items.push(row));
    }

    fn set_status(&self, tth: Root, prio: Priority, err: DlError, err_msg: Option<&str>) {
        self.with(|d| d.apply_status(tth, prio, err, err_msg));
    }

    fn set_uerr(&self, uid: Uid, tth: Root, err: DlError, err_msg: Option<&str>) {
        self.with(|d| d.apply_uerr(uid, tth, err, err_msg));
    }

    fn set_tthl(&self, tth: Root, bytes: &[u8]) {
        self.with(|d| {
            d.tthl.insert(tth.to_base32(), bytes.to_vec());
        });
    }

    fn get_tthl(&self, tth: Root) -> Option<Vec<u8>> {
        self.read(|d| d.tthl.get(&tth.to_base32()).cloned())
    }

    fn set_bitmap(&self, tth: Root, bytes: &[u8]) {
        self.with(|d| {
            d.bitmaps.insert(tth.to_base32(), bytes.to_vec());
        });
    }

    fn get_bitmap(&self, tth: Root) -> Option<Vec<u8>> {
        self.read(|d| d.bitmaps.get(&tth.to_base32()).cloned())
    }

    fn insert_source(&self, row: DlSourceRow) {
        self.with(|d| d.sources.push(row));
    }

    fn remove_dl(&self, tth: Root) {
        self.with(|d| d.apply_remove_dl(tth));
    }

    fn remove_user(&self, uid: Uid, tth: Root) {
        let key = tth.to_base32();
        self.with(|d| {
            d.sources.retain(|r| !(r.tth == key && r.uid == uid.0));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(hash: Root) -> DlRow {
        DlRow {
            tth: hash.to_base32(),
            size: 100,
            dest: "/dl/x".into(),
            prio: 0,
            err: 0,
            err_msg: None,
            tthl_len: 0,
        }
    }

    #[test]
    fn mem_store_roundtrip() {
        let store = MemStore::new();
        let hash = Root([1; 24]);
        store.insert_dl(row(hash));
        store.insert_source(DlSourceRow {
            tth: hash.to_base32(),
            uid: 42,
            err: 0,
            err_msg: None,
        });
        assert_eq!(store.list_dls().len(), 1);
        assert_eq!(store.list_dl_sources().len(), 1);

        store.set_status(hash, Priority::Err, DlError::Hash, Some("boom"));
        let items = store.list_dls();
        assert_eq!(items[0].prio, -65);
        assert_eq!(items[0].err, 5);

        store.set_uerr(Uid(42), hash, DlError::NoFile, None);
        assert_eq!(store.list_dl_sources()[0].err, 2);

        store.set_tthl(hash, &[1, 2, 3]);
        assert_eq!(store.get_tthl(hash), Some(vec![1, 2, 3]));
        store.set_bitmap(hash, &[0xFF]);
        assert_eq!(store.get_bitmap(hash), Some(vec![0xFF]));

        store.remove_user(Uid(42), hash);
        assert!(store.list_dl_sources().is_empty());
        store.remove_dl(hash);
        assert!(store.list_dls().is_empty());
        assert_eq!(store.get_tthl(hash), None);
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dl.json");
        let hash = Root([7; 24]);
        {
            let store = JsonStore::open(path.clone()).unwrap();
            store.insert_dl(row(hash));
            store.set_tthl(hash, &[9, 9]);
        }
        let store = JsonStore::open(path).unwrap();
        assert_eq!(store.list_dls().len(), 1);
        assert_eq!(store.get_tthl(hash), Some(vec![9, 9]));
    }
}
