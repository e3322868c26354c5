//! Local filesystem storage provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::provider::{validate_name, FileMetadata, StorageProvider};
use lockbox_common::{Error, Result};

/// Local filesystem storage provider.
///
/// Stores vault files flat inside a root directory.
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Create a provider rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn to_fs_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    fn create_metadata(name: &str, fs_meta: std::fs::Metadata) -> FileMetadata {
        let modified: DateTime<Utc> = fs_meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());

        FileMetadata {
            name: name.to_string(),
            size: fs_meta.len(),
            modified,
        }
    }

    /// Write `data` to `tmp_path`, flush it, restrict it to the owner and
    /// rename it over `fs_path`.
    async fn replace_via(tmp_path: &Path, fs_path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(tmp_path, fs_path).await
    }

    async fn existing_file(&self, name: &str) -> Result<PathBuf> {
        let fs_path = self.to_fs_path(name)?;
        match fs::metadata(&fs_path).await {
            Ok(meta) if meta.is_file() => Ok(fs_path),
            Ok(_) => Err(Error::InvalidInput(format!("{} is not a file", name))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("File not found: {}", name)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let fs_path = self.existing_file(name).await?;
        Ok(fs::read(&fs_path).await?)
    }

    async fn read_prefix(&self, name: &str, len: usize) -> Result<Vec<u8>> {
        let fs_path = self.existing_file(name).await?;
        let file = fs::File::open(&fs_path).await?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, name: &str, data: Vec<u8>) -> Result<FileMetadata> {
        let fs_path = self.to_fs_path(name)?;
        // Temp file in the same directory so the rename stays on one filesystem.
        let tmp_path = self.root.join(format!(".{}.tmp", name));

        if let Err(e) = Self::replace_via(&tmp_path, &fs_path, &data).await {
            // Never leave a partial copy next to the target.
            if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", tmp_path.display(), cleanup);
                }
            }
            return Err(e.into());
        }
        debug!("Wrote {} ({} bytes)", name, data.len());

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(Self::create_metadata(name, fs_meta))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let fs_path = self.to_fs_path(name)?;
        Ok(fs::try_exists(&fs_path).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let fs_path = self.existing_file(name).await?;
        fs::remove_file(&fs_path).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FileMetadata>> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            // Skip in-flight temp files.
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            let fs_meta = entry.metadata().await?;
            if fs_meta.is_file() {
                files.push(Self::create_metadata(&name, fs_meta));
            }
        }

        Ok(files)
    }

    async fn metadata(&self, name: &str) -> Result<FileMetadata> {
        let fs_path = self.existing_file(name).await?;
        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(Self::create_metadata(name, fs_meta))
    }
}
