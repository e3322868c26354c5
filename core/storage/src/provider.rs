//! Storage provider trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lockbox_common::{Error, Result};

/// Metadata for a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

/// Reject names that could escape the storage root.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidInput(format!("Invalid file name '{}'", name)));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidInput(
            "File name cannot contain separators".to_string(),
        ));
    }
    Ok(())
}

/// Storage backend holding vault files.
///
/// Implementations must handle their own locking; every method may be
/// called concurrently.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Provider name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Read a whole file.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Read at most `len` bytes from the start of a file.
    ///
    /// Used to inspect headers without loading a whole vault.
    async fn read_prefix(&self, name: &str, len: usize) -> Result<Vec<u8>>;

    /// Create or atomically replace a file.
    ///
    /// # Postconditions
    /// - Either the old content or the complete new content is visible,
    ///   never a mix
    async fn write(&self, name: &str, data: Vec<u8>) -> Result<FileMetadata>;

    /// Check if a file exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Delete a file.
    ///
    /// # Errors
    /// - `NotFound` if the file does not exist
    async fn delete(&self, name: &str) -> Result<()>;

    /// List the files in this location.
    async fn list(&self) -> Result<Vec<FileMetadata>>;

    /// Get metadata for a file.
    async fn metadata(&self, name: &str) -> Result<FileMetadata>;
}
