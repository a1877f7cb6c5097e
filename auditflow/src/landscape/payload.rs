//! Content-addressed payload storage.
//!
//! Row payloads and call request/response bodies live outside the ledger
//! tables, keyed by the SHA-256 of their bytes. The ledger keeps only the
//! key, so a retention policy can delete payloads without touching the
//! audit trail.

use crate::canonical::sha256_hex;
use dashmap::DashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by a [`PayloadStore`].
#[derive(Debug, Error)]
pub enum PayloadError {
    /// No payload exists for this key (never stored, or purged).
    #[error("payload '{0}' not found")]
    NotFound(String),

    /// Stored bytes no longer hash to their key.
    #[error("payload '{expected}' is corrupt (content hashes to '{actual}')")]
    Corrupt {
        /// Key the payload was stored under.
        expected: String,
        /// Hash of the bytes actually read.
        actual: String,
    },

    /// Key is not a SHA-256 hex digest.
    #[error("invalid payload key '{0}'")]
    InvalidKey(String),

    /// File-system failure.
    #[error("payload i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Content-addressed blob storage.
pub trait PayloadStore: Send + Sync + Debug {
    /// Stores `content` and returns its key. Storing the same bytes twice
    /// returns the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    fn store(&self, content: &[u8]) -> Result<String, PayloadError>;

    /// Reads a payload back, verifying its hash.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::NotFound`] if absent.
    fn retrieve(&self, key: &str) -> Result<Vec<u8>, PayloadError>;

    /// Returns true if a payload exists under `key`.
    fn exists(&self, key: &str) -> bool;

    /// Deletes a payload. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be modified.
    fn delete(&self, key: &str) -> Result<bool, PayloadError>;
}

fn verify(key: &str, content: Vec<u8>) -> Result<Vec<u8>, PayloadError> {
    let actual = sha256_hex(&content);
    if actual == key {
        Ok(content)
    } else {
        Err(PayloadError::Corrupt {
            expected: key.to_string(),
            actual,
        })
    }
}

/// Payload store held in memory. Used for tests and in-memory ledgers.
#[derive(Debug, Default)]
pub struct InMemoryPayloadStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl InMemoryPayloadStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl PayloadStore for InMemoryPayloadStore {
    fn store(&self, content: &[u8]) -> Result<String, PayloadError> {
        let key = sha256_hex(content);
        self.blobs
            .entry(key.clone())
            .or_insert_with(|| content.to_vec());
        Ok(key)
    }

    fn retrieve(&self, key: &str) -> Result<Vec<u8>, PayloadError> {
        let content = self
            .blobs
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PayloadError::NotFound(key.to_string()))?;
        verify(key, content)
    }

    fn exists(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }

    fn delete(&self, key: &str) -> Result<bool, PayloadError> {
        Ok(self.blobs.remove(key).is_some())
    }
}

/// Payload store on the local file system.
///
/// Payloads are sharded by the first two hex characters of their key:
/// `<root>/ab/abcdef...`.
#[derive(Debug, Clone)]
pub struct FilesystemPayloadStore {
    root: PathBuf,
}

impl FilesystemPayloadStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PayloadError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PayloadError> {
        let valid = key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit());
        if !valid {
            return Err(PayloadError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(&key[..2]).join(key))
    }
}

impl PayloadStore for FilesystemPayloadStore {
    fn store(&self, content: &[u8]) -> Result<String, PayloadError> {
        let key = sha256_hex(content);
        let path = self.path_for(&key)?;
        if path.exists() {
            return Ok(key);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(key)
    }

    fn retrieve(&self, key: &str) -> Result<Vec<u8>, PayloadError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(content) => verify(key, content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PayloadError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.exists()).unwrap_or(false)
    }

    fn delete(&self, key: &str) -> Result<bool, PayloadError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
