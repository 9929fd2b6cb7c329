//! Content-addressed storage interface.

use crate::{ManifestError, ManifestResult};
use basalt_types::Hash256;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A content-addressed store keyed by Blake2b-256 of the content.
pub trait ContentStore: Send + Sync {
    /// Retrieve an object by key.
    fn get(&self, key: &Hash256) -> ManifestResult<Vec<u8>>;

    /// Store an object, returning its key.
    fn put(&self, data: Vec<u8>) -> ManifestResult<Hash256>;
}

/// In-memory content store.
pub struct MemoryStore {
    objects: RwLock<HashMap<Hash256, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore for MemoryStore {
    fn get(&self, key: &Hash256) -> ManifestResult<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ManifestError::NotFound(key.to_string()))
    }

    fn put(&self, data: Vec<u8>) -> ManifestResult<Hash256> {
        let key = Hash256::of(&data);
        self.objects.write().insert(key, data);
        Ok(key)
    }
}
