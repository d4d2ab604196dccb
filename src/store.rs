//! Durable credential storage: one JSON session record per key.
//!
//! Writes are atomic — the record is written to a temporary sibling and
//! renamed over the final path, so a crash mid-write never leaves a
//! partially-written record. Keys are normalized into filesystem-safe slugs;
//! the mapping is deterministic.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::session::{SessionKey, SessionRecord};

/// Errors from the credential store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("session store I/O error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A stored record could not be decoded.
    #[error("corrupt session record at {path}: {source}")]
    Decode {
        /// Path of the corrupt record.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be encoded for writing.
    #[error("failed to encode session record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Persists session records under one base directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    base: PathBuf,
}

impl CredentialStore {
    /// Create a store rooted at `base`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        std::fs::create_dir_all(&base).map_err(|source| StoreError::Io {
            path: base.clone(),
            source,
        })?;
        Ok(Self { base })
    }

    /// The file a key's record lives at.
    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.base.join(format!("{}.json", key.slug()))
    }

    /// Atomically persist a record, returning its final path.
    ///
    /// # Errors
    ///
    /// Returns an error when encoding or any filesystem step fails.
    pub async fn persist(&self, record: &SessionRecord) -> Result<PathBuf, StoreError> {
        let path = self.path_for(&record.key);
        let tmp = path.with_extension("tmp");

        let payload = serde_json::to_vec_pretty(record).map_err(StoreError::Encode)?;
        fs::write(&tmp, payload)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(key = %record.key, path = %path.display(), "session record persisted");
        Ok(path)
    }

    /// Load the record for a key. A missing record is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error on unreadable files or corrupt JSON.
    pub async fn load(&self, key: &SessionKey) -> Result<Option<SessionRecord>, StoreError> {
        let path = self.path_for(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let record =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Decode { path, source })?;
        Ok(Some(record))
    }

    /// Delete the record for a key. Deleting a missing record is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be removed.
    pub async fn delete(&self, key: &SessionKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "session record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// The store's base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }
}
