//! Catalog of known vault files.
//!
//! The registry is an unencrypted JSON index used for discovery and listing.
//! It holds no secrets, and every entry can be rebuilt from the vault file
//! headers, so losing or corrupting it never blocks access to a vault.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lockbox_common::{Error, Result, VaultId};
use lockbox_storage::StorageProvider;

use crate::body::BodyStats;
use crate::file::VAULT_EXTENSION;
use crate::header::{read_header, HEADER_LEN};

/// Registry file name inside its storage location.
pub const REGISTRY_FILE: &str = "registry.json";

const REGISTRY_VERSION: u32 = 1;

/// Catalog record for one vault file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRegistryEntry {
    pub vault_id: VaultId,
    pub name: String,
    /// File name inside its storage location.
    pub file_path: String,
    /// Name of the storage location holding the file.
    pub storage_strategy: String,
    pub file_size: u64,
    pub entry_count: usize,
    pub folder_count: usize,
    pub tag_count: usize,
    pub is_default: bool,
    pub is_loaded: bool,
    pub last_accessed: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VaultRegistryEntry {
    pub fn new(
        vault_id: VaultId,
        name: impl Into<String>,
        file_path: impl Into<String>,
        storage_strategy: impl Into<String>,
    ) -> Self {
        Self {
            vault_id,
            name: name.into(),
            file_path: file_path.into(),
            storage_strategy: storage_strategy.into(),
            file_size: 0,
            entry_count: 0,
            folder_count: 0,
            tag_count: 0,
            is_default: false,
            is_loaded: false,
            last_accessed: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    version: u32,
    entries: Vec<VaultRegistryEntry>,
}

/// In-memory registry backed by a JSON file.
pub struct VaultRegistry {
    provider: Arc<dyn StorageProvider>,
    entries: Vec<VaultRegistryEntry>,
}

impl VaultRegistry {
    /// Empty registry that will be saved to `provider`.
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            provider,
            entries: Vec::new(),
        }
    }

    /// Load the registry from `provider`.
    ///
    /// A missing file gives an empty registry. So does a corrupt one, which
    /// is logged; call [`rebuild`](Self::rebuild) to repopulate it.
    ///
    /// # Errors
    /// - Storage failures other than the file being absent
    pub async fn load(provider: Arc<dyn StorageProvider>) -> Result<Self> {
        let mut registry = Self::new(provider);

        let bytes = match registry.provider.read(REGISTRY_FILE).await {
            Ok(bytes) => bytes,
            Err(Error::NotFound(_)) => return Ok(registry),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<RegistryDocument>(&bytes) {
            Ok(doc) => {
                debug!("Loaded registry with {} entries", doc.entries.len());
                registry.entries = doc.entries;
            }
            Err(e) => warn!("Registry is corrupt, starting empty: {}", e),
        }
        Ok(registry)
    }

    /// Persist the registry (atomic replace).
    pub async fn save(&self) -> Result<()> {
        let doc = RegistryDocument {
            version: REGISTRY_VERSION,
            entries: self.entries.clone(),
        };
        let bytes =
            serde_json::to_vec_pretty(&doc).map_err(|e| Error::Serialization(e.to_string()))?;
        self.provider.write(REGISTRY_FILE, bytes).await?;
        Ok(())
    }

    pub fn list(&self) -> &[VaultRegistryEntry] {
        &self.entries
    }

    pub fn get(&self, vault_id: &VaultId) -> Option<&VaultRegistryEntry> {
        self.entries.iter().find(|e| e.vault_id == *vault_id)
    }

    fn get_mut(&mut self, vault_id: &VaultId) -> Result<&mut VaultRegistryEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.vault_id == *vault_id)
            .ok_or_else(|| Error::NotFound(format!("Vault not registered: {}", vault_id)))
    }

    /// Insert or replace the entry for `entry.vault_id`.
    ///
    /// The first vault registered becomes the default.
    pub fn upsert(&mut self, mut entry: VaultRegistryEntry) {
        if self.entries.is_empty() {
            entry.is_default = true;
        }
        if entry.is_default {
            for other in &mut self.entries {
                other.is_default = false;
            }
        }
        match self.entries.iter_mut().find(|e| e.vault_id == entry.vault_id) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    /// Forget a vault. Does not touch its file.
    pub fn remove(&mut self, vault_id: &VaultId) -> Option<VaultRegistryEntry> {
        let index = self.entries.iter().position(|e| e.vault_id == *vault_id)?;
        Some(self.entries.remove(index))
    }

    pub fn default_vault(&self) -> Option<&VaultRegistryEntry> {
        self.entries.iter().find(|e| e.is_default)
    }

    /// Make `vault_id` the only default vault.
    pub fn set_default(&mut self, vault_id: &VaultId) -> Result<()> {
        self.get_mut(vault_id)?;
        for entry in &mut self.entries {
            entry.is_default = entry.vault_id == *vault_id;
        }
        Ok(())
    }

    /// Flag a vault as loaded (unlocked) or not, touching its access time.
    pub fn mark_loaded(&mut self, vault_id: &VaultId, loaded: bool) -> Result<()> {
        let entry = self.get_mut(vault_id)?;
        entry.is_loaded = loaded;
        if loaded {
            entry.last_accessed = Some(Utc::now());
        }
        Ok(())
    }

    /// Clear every loaded flag. Returns how many were set.
    pub fn clear_loaded(&mut self) -> usize {
        let mut cleared = 0;
        for entry in self.entries.iter_mut().filter(|e| e.is_loaded) {
            entry.is_loaded = false;
            cleared += 1;
        }
        cleared
    }

    /// Refresh size and counts after a save.
    pub fn update_statistics(
        &mut self,
        vault_id: &VaultId,
        file_size: u64,
        stats: BodyStats,
    ) -> Result<()> {
        let entry = self.get_mut(vault_id)?;
        entry.file_size = file_size;
        entry.entry_count = stats.entries;
        entry.folder_count = stats.folders;
        entry.tag_count = stats.tags;
        entry.last_accessed = Some(Utc::now());
        Ok(())
    }

    /// Re-scan `locations` and rebuild entries from vault headers.
    ///
    /// Only headers are read; no password is needed. Names, default flags
    /// and counts of vaults already known are kept, and `loaded` lists the
    /// vaults that are currently unlocked. Files whose header cannot be read
    /// are logged and skipped. Entries whose files are gone are dropped.
    /// Returns the number of vaults found.
    ///
    /// # Errors
    /// - Storage failures listing a location
    pub async fn rebuild(
        &mut self,
        locations: &HashMap<String, Arc<dyn StorageProvider>>,
        loaded: &[VaultId],
    ) -> Result<usize> {
        let mut found = Vec::new();

        for (location, provider) in locations {
            for meta in provider.list().await? {
                if !meta.name.ends_with(&format!(".{}", VAULT_EXTENSION)) {
                    continue;
                }
                let prefix = match provider.read_prefix(&meta.name, HEADER_LEN).await {
                    Ok(prefix) => prefix,
                    Err(e) => {
                        warn!("Cannot read {} in {}: {}", meta.name, location, e);
                        continue;
                    }
                };
                let header = match read_header(&prefix) {
                    Ok(header) => header,
                    Err(e) => {
                        warn!("Skipping {} in {}: {}", meta.name, location, e);
                        continue;
                    }
                };

                let mut entry = match self.get(&header.vault_id) {
                    Some(existing) => existing.clone(),
                    None => {
                        let stem = meta
                            .name
                            .trim_end_matches(&format!(".{}", VAULT_EXTENSION))
                            .to_string();
                        VaultRegistryEntry::new(header.vault_id, stem, "", "")
                    }
                };
                entry.file_path = meta.name.clone();
                entry.storage_strategy = location.clone();
                entry.file_size = meta.size;
                entry.is_loaded = loaded.contains(&header.vault_id);
                if let Some(created) = Utc.timestamp_millis_opt(header.created_at).single() {
                    entry.created_at = created;
                }
                found.push(entry);
            }
        }

        if !found.is_empty() && !found.iter().any(|e| e.is_default) {
            found[0].is_default = true;
        }
        let count = found.len();
        self.entries = found;
        info!("Registry rebuilt with {} vaults", count);
        Ok(count)
    }
}
