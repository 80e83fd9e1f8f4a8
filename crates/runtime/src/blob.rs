//! Content-addressed blob store collaborator
//!
//! Blocks are published by content id before their CIDs are handed to the
//! gossip scheduler. Only the contract lives here plus an in-memory store
//! suitable for single-node runs and tests.

use dashmap::DashMap;
use powchain_codec::{sha256, H256};
use std::sync::Arc;
use thiserror::Error;

/// Content id: SHA-256 of the blob
pub type Cid = H256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(Cid),

    #[error("blob backend error: {0}")]
    Backend(String),
}

pub trait BlobStore: Send + Sync {
    /// Store bytes and return their content id
    fn put(&self, bytes: &[u8]) -> Result<Cid, BlobError>;

    /// Ask for `quorum` replicas. Returns whether the quorum is met.
    fn pin(&self, cid: &Cid, quorum: usize) -> Result<bool, BlobError>;

    fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlobError>;
}

/// Single-replica in-memory blob store
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<Cid, Arc<Vec<u8>>>>,
    pins: Arc<DashMap<Cid, usize>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn is_pinned(&self, cid: &Cid) -> bool {
        self.pins.contains_key(cid)
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<Cid, BlobError> {
        let cid = sha256(&[bytes]);
        self.blobs
            .entry(cid)
            .or_insert_with(|| Arc::new(bytes.to_vec()));
        Ok(cid)
    }

    fn pin(&self, cid: &Cid, quorum: usize) -> Result<bool, BlobError> {
        if !self.blobs.contains_key(cid) {
            return Err(BlobError::NotFound(*cid));
        }
        self.pins.insert(*cid, quorum);
        // One local replica
        Ok(quorum <= 1)
    }

    fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .get(cid)
            .map(|b| b.value().as_ref().clone())
            .ok_or(BlobError::NotFound(*cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_is_content_addressed() {
        let store = MemoryBlobStore::new();
        let a = store.put(b"block bytes").unwrap();
        let b = store.put(b"block bytes").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, sha256(&[b"block bytes"]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).unwrap(), b"block bytes".to_vec());
    }

    #[test]
    fn test_missing_blob() {
        let store = MemoryBlobStore::new();
        let cid = H256([1; 32]);
        assert_eq!(store.get(&cid), Err(BlobError::NotFound(cid)));
        assert_eq!(store.pin(&cid, 1), Err(BlobError::NotFound(cid)));
    }

    #[test]
    fn test_pin_quorum() {
        let store = MemoryBlobStore::new();
        let cid = store.put(&[1, 2, 3]).unwrap();
        assert!(store.pin(&cid, 1).unwrap());
        assert!(!store.pin(&cid, 3).unwrap());
        assert!(store.is_pinned(&cid));
    }
}
