//! In-memory storage provider for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::provider::{validate_name, FileMetadata, StorageProvider};
use lockbox_common::{Error, Result};

#[derive(Debug, Clone)]
struct StoredFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

impl StoredFile {
    fn metadata(&self, name: &str) -> FileMetadata {
        FileMetadata {
            name: name.to_string(),
            size: self.data.len() as u64,
            modified: self.modified,
        }
    }
}

/// In-memory storage provider.
///
/// Useful for testing and development. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    storage: Arc<RwLock<HashMap<String, StoredFile>>>,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, to exercise persistence errors.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail, to exercise I/O errors.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn poisoned() -> Error {
        Error::Storage("memory storage lock poisoned".to_string())
    }

    fn get(&self, name: &str) -> Result<StoredFile> {
        validate_name(name)?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("read of {} failed", name)));
        }
        let storage = self.storage.read().map_err(|_| Self::poisoned())?;
        storage
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", name)))
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        Ok(self.get(name)?.data)
    }

    async fn read_prefix(&self, name: &str, len: usize) -> Result<Vec<u8>> {
        let mut data = self.get(name)?.data;
        data.truncate(len);
        Ok(data)
    }

    async fn write(&self, name: &str, data: Vec<u8>) -> Result<FileMetadata> {
        validate_name(name)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("write to {} failed", name)));
        }
        let file = StoredFile {
            data,
            modified: Utc::now(),
        };
        let metadata = file.metadata(name);
        self.storage
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(name.to_string(), file);
        Ok(metadata)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let storage = self.storage.read().map_err(|_| Self::poisoned())?;
        Ok(storage.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.storage
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", name)))
    }

    async fn list(&self) -> Result<Vec<FileMetadata>> {
        let storage = self.storage.read().map_err(|_| Self::poisoned())?;
        Ok(storage
            .iter()
            .map(|(name, file)| file.metadata(name))
            .collect())
    }

    async fn metadata(&self, name: &str) -> Result<FileMetadata> {
        Ok(self.get(name)?.metadata(name))
    }
}
