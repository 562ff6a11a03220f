//! The key-value store underneath all durable state.
//!
//! The core only ever needs four verbs — get, put, delete, and a prefix
//! scan — so that is the whole trait. [`FsStore`] keeps one file per key
//! in a flat directory, writing through a temporary file so a crash can
//! never leave a half-written value behind; [`MemStore`] backs tests.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64ct::{Base64UrlUnpadded, Encoding as _};

/// An error produced by a store.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The underlying medium failed.
    #[error("Storage IO error in {action}")]
    Io {
        /// What we were doing.
        action: &'static str,
        /// What happened.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The store has been poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Construct an [`StoreError::Io`] from an action and its cause.
    fn io(action: &'static str, source: std::io::Error) -> Self {
        StoreError::Io {
            action,
            source: Arc::new(source),
        }
    }
}

/// A byte-keyed, byte-valued durable map.
///
/// Writes for the same key are serialized by the callers holding the
/// relevant application lock; the store itself only promises that each
/// individual operation is atomic.
pub trait Store: Send + Sync + 'static {
    /// Fetch the value under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Delete `key`. Deleting an absent key is fine.
    fn del(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Every key currently starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError>;
}

/// An in-memory store for tests.
#[derive(Default)]
pub struct MemStore {
    /// The map, ordered so prefix scans are cheap.
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    /// Create an empty in-memory store.
    pub fn new() -> Arc<Self> {
        Arc::new(MemStore::default())
    }
}

impl Store for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        map.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let map = self.map.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// A store keeping one file per key in a single directory.
///
/// Key bytes are encoded into the file name (unpadded base64url), so any
/// byte sequence is a valid key. Values are written to a temporary file
/// in the same directory and renamed into place.
pub struct FsStore {
    /// The data directory.
    dir: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io("create dir", e))?;
        Ok(Arc::new(FsStore { dir }))
    }

    /// The file path holding `key`.
    fn path_of(&self, key: &[u8]) -> PathBuf {
        self.dir.join(Base64UrlUnpadded::encode_string(key))
    }
}

impl Store for FsStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match std::fs::read(self.path_of(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io("read", e)),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| StoreError::io("create temp file", e))?;
        tmp.write_all(value)
            .map_err(|e| StoreError::io("write", e))?;
        tmp.flush().map_err(|e| StoreError::io("flush", e))?;
        tmp.persist(self.path_of(key))
            .map_err(|e| StoreError::io("rename", e.error))?;
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_of(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("remove", e)),
        }
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut keys = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StoreError::io("read dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("read dir entry", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(key) = Base64UrlUnpadded::decode_vec(name) else {
                // Not one of ours (e.g. a temp file mid-write).
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;

    /// Exercise the Store contract against any implementation.
    fn exercise(store: &dyn Store) {
        assert_eq!(store.get(b"missing").unwrap(), None);
        store.put(b"profile", b"{}").unwrap();
        store.put(b"contact-a", b"1").unwrap();
        store.put(b"contact-b", b"2").unwrap();
        assert_eq!(store.get(b"profile").unwrap().unwrap(), b"{}");

        // Overwrite.
        store.put(b"profile", b"{\"name\":\"x\"}").unwrap();
        assert_eq!(store.get(b"profile").unwrap().unwrap(), b"{\"name\":\"x\"}");

        // Prefix scan.
        let mut keys = store.keys_with_prefix(b"contact-").unwrap();
        keys.sort();
        assert_eq!(keys, vec![b"contact-a".to_vec(), b"contact-b".to_vec()]);

        // Delete is idempotent.
        store.del(b"contact-a").unwrap();
        store.del(b"contact-a").unwrap();
        assert_eq!(store.get(b"contact-a").unwrap(), None);
    }

    #[test]
    fn mem_store_contract() {
        exercise(&*MemStore::new());
    }

    #[test]
    fn fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&*FsStore::open(dir.path()).unwrap());
    }

    #[test]
    fn fs_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FsStore::open(dir.path()).unwrap();
            store.put(b"profile", b"alice").unwrap();
        }
        let store = FsStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"profile").unwrap().unwrap(), b"alice");
    }

    #[test]
    fn fs_store_handles_binary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let key = [b"cdn-image-".as_slice(), &[0_u8, 255, 7, 42][..]].concat();
        store.put(&key, b"bytes").unwrap();
        assert_eq!(store.get(&key).unwrap().unwrap(), b"bytes");
        assert_eq!(store.keys_with_prefix(b"cdn-image-").unwrap(), vec![key]);
    }
}
