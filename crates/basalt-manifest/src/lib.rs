//! # basalt-manifest
//!
//! Content-manifest trie for the Basalt content-addressed store.
//!
//! A manifest maps paths to stored-object hashes, directory-style.
//! Large manifests split into subtries that are stored separately and
//! loaded lazily on demand; modifying any entry invalidates the cached
//! hash along the root path until the next [`ManifestTrie::recalc_and_store`].

mod store;
mod trie;

pub use store::{ContentStore, MemoryStore};
pub use trie::{
    regular_slashes, Manifest, ManifestEntry, ManifestTrie, WalkStep, MANIFEST_MIME,
    STATUS_MULTIPLE_CHOICES,
};

use thiserror::Error;

/// Manifest errors.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// The store has no object under the given key.
    #[error("manifest not found: {0}")]
    NotFound(String),

    /// The stored object is not a valid manifest.
    #[error("manifest {0} is malformed: {1}")]
    Malformed(String, String),

    /// An entry's subtrie hash is not valid hex.
    #[error("invalid subtrie hash: {0}")]
    InvalidHash(String),

    /// Storage layer failure.
    #[error("store error: {0}")]
    Store(String),
}

/// Result type for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;
