//! The reference-counted, content-addressed image store.
//!
//! Images (avatars, event banners) are stored once per distinct content
//! and shared by hash. A reference counter per hash decides when the
//! bytes themselves can go: upload always increments, release always
//! decrements (never below zero), and the bytes exist exactly while the
//! counter is positive.

use std::sync::{Arc, Mutex};

use sha3::{Digest as _, Sha3_256};

use crate::{Result, SharedStore};

/// Key prefix of image bytes.
const IMAGE_PREFIX: &[u8] = b"cdn-image-";

/// Key suffix of the reference counter.
const REFS_SUFFIX: &[u8] = b"-refs";

/// Reference-counted content-addressed storage on top of a [`Store`].
///
/// [`Store`]: crate::Store
#[derive(Clone)]
pub struct ContentStore {
    /// The backing store.
    store: SharedStore,
    /// Serializes the read-refs / write-bytes / write-refs transaction.
    lock: Arc<Mutex<()>>,
}

impl ContentStore {
    /// Build a content store over `store`.
    pub fn new(store: SharedStore) -> Self {
        ContentStore {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store `data`, incrementing its reference count, and return its
    /// content hash.
    pub fn upload(&self, data: &[u8]) -> Result<[u8; 32]> {
        let hash: [u8; 32] = Sha3_256::digest(data).into();
        let _guard = self.lock.lock().map_err(|_| crate::Error::Internal("poisoned lock"))?;
        let refs = self.read_refs(&hash)?;
        if refs == 0 {
            self.store.put(&image_key(&hash), data)?;
        }
        self.write_refs(&hash, refs + 1)?;
        Ok(hash)
    }

    /// Fetch the bytes under `hash`, if present.
    pub fn fetch(&self, hash: &[u8; 32]) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get(&image_key(hash))?)
    }

    /// Drop one reference to `hash`, removing the bytes when the last
    /// reference goes. Releasing an unreferenced hash is a no-op.
    pub fn release(&self, hash: &[u8; 32]) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| crate::Error::Internal("poisoned lock"))?;
        let refs = self.read_refs(hash)?;
        match refs {
            0 => {}
            1 => {
                self.store.del(&image_key(hash))?;
                self.store.del(&refs_key(hash))?;
            }
            n => self.write_refs(hash, n - 1)?,
        }
        Ok(())
    }

    /// Current reference count of `hash`.
    pub fn refs(&self, hash: &[u8; 32]) -> Result<u64> {
        self.read_refs(hash)
    }

    /// Decode the stored reference counter, absent meaning zero.
    fn read_refs(&self, hash: &[u8; 32]) -> Result<u64> {
        match self.store.get(&refs_key(hash))? {
            Some(raw) => decode_uvarint(&raw).ok_or(crate::Error::Corrupt {
                what: "image refs",
                source: None,
            }),
            None => Ok(0),
        }
    }

    /// Store the reference counter.
    fn write_refs(&self, hash: &[u8; 32], refs: u64) -> Result<()> {
        Ok(self.store.put(&refs_key(hash), &encode_uvarint(refs))?)
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore").finish_non_exhaustive()
    }
}

/// The key of an image's bytes.
fn image_key(hash: &[u8; 32]) -> Vec<u8> {
    [IMAGE_PREFIX, hash].concat()
}

/// The key of an image's reference counter.
fn refs_key(hash: &[u8; 32]) -> Vec<u8> {
    [IMAGE_PREFIX, hash, REFS_SUFFIX].concat()
}

/// Encode an unsigned varint (LEB128).
fn encode_uvarint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Decode an unsigned varint (LEB128); `None` on truncation or overflow.
fn decode_uvarint(raw: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0_u32;
    for byte in raw {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use crate::MemStore;

    #[test]
    fn varint_roundtrip() {
        for value in [0_u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            assert_eq!(decode_uvarint(&encode_uvarint(value)), Some(value));
        }
        assert_eq!(decode_uvarint(&[]), None);
        assert_eq!(decode_uvarint(&[0x80]), None);
    }

    #[test]
    fn refcount_lifecycle() {
        let cdn = ContentStore::new(MemStore::new());
        let hash = cdn.upload(b"image").unwrap();
        assert_eq!(cdn.refs(&hash).unwrap(), 1);
        assert_eq!(cdn.fetch(&hash).unwrap().unwrap(), b"image");

        // A second upload of the same bytes shares storage.
        let hash2 = cdn.upload(b"image").unwrap();
        assert_eq!(hash2, hash);
        assert_eq!(cdn.refs(&hash).unwrap(), 2);

        // First release keeps the bytes, second removes them.
        cdn.release(&hash).unwrap();
        assert_eq!(cdn.refs(&hash).unwrap(), 1);
        assert!(cdn.fetch(&hash).unwrap().is_some());
        cdn.release(&hash).unwrap();
        assert_eq!(cdn.refs(&hash).unwrap(), 0);
        assert!(cdn.fetch(&hash).unwrap().is_none());

        // Releasing below zero is a no-op.
        cdn.release(&hash).unwrap();
        assert_eq!(cdn.refs(&hash).unwrap(), 0);
    }

    #[test]
    fn distinct_content_distinct_hashes() {
        let cdn = ContentStore::new(MemStore::new());
        let a = cdn.upload(b"aaa").unwrap();
        let b = cdn.upload(b"bbb").unwrap();
        assert_ne!(a, b);
        cdn.release(&a).unwrap();
        assert!(cdn.fetch(&b).unwrap().is_some());
        assert!(cdn.fetch(&a).unwrap().is_none());
    }
}
