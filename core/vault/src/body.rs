//! Decrypted vault contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use lockbox_common::{Error, Result};

/// One credential record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VaultEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    #[zeroize(skip)]
    pub modified_at: DateTime<Utc>,
}

impl VaultEntry {
    pub fn new(title: impl Into<String>, password: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            username: String::new(),
            password: password.into(),
            url: String::new(),
            notes: String::new(),
            folder: None,
            tags: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// Everything inside the ciphertext of one vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct VaultBody {
    #[serde(default)]
    pub entries: Vec<VaultEntry>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Entry, folder and tag counts recorded in the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyStats {
    pub entries: usize,
    pub folders: usize,
    pub tags: usize,
}

impl VaultBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> BodyStats {
        BodyStats {
            entries: self.entries.len(),
            folders: self.folders.len(),
            tags: self.tags.len(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&VaultEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Insert `entry`, or replace the entry with the same id.
    ///
    /// Folders and tags it references are added to the body's lists.
    pub fn upsert(&mut self, mut entry: VaultEntry) {
        entry.modified_at = Utc::now();
        if let Some(folder) = &entry.folder {
            if !self.folders.contains(folder) {
                self.folders.push(folder.clone());
            }
        }
        for tag in &entry.tags {
            if !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }

        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                entry.created_at = existing.created_at;
                *existing = entry;
            }
            None => self.entries.push(entry),
        }
    }

    /// Remove the entry with `id`.
    ///
    /// # Errors
    /// - `NotFound` if no entry has that id
    pub fn remove(&mut self, id: &str) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("Entry not found: {}", id)))?;
        // Dropping the removed entry zeroizes it.
        self.entries.remove(index);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut body = VaultBody::new();
        let mut entry = VaultEntry::new("demo", "p@ss");
        body.upsert(entry.clone());
        assert_eq!(body.entries.len(), 1);

        entry.password = "changed".to_string();
        body.upsert(entry.clone());
        assert_eq!(body.entries.len(), 1);
        assert_eq!(body.find(&entry.id).unwrap().password, "changed");
    }

    #[test]
    fn test_upsert_collects_folders_and_tags() {
        let mut body = VaultBody::new();
        let mut entry = VaultEntry::new("mail", "x");
        entry.folder = Some("work".to_string());
        entry.tags = vec!["email".to_string(), "2fa".to_string()];
        body.upsert(entry);

        let mut other = VaultEntry::new("chat", "y");
        other.folder = Some("work".to_string());
        other.tags = vec!["2fa".to_string()];
        body.upsert(other);

        assert_eq!(
            body.stats(),
            BodyStats {
                entries: 2,
                folders: 1,
                tags: 2
            }
        );
    }

    #[test]
    fn test_remove() {
        let mut body = VaultBody::new();
        let entry = VaultEntry::new("demo", "p@ss");
        let id = entry.id.clone();
        body.upsert(entry);

        body.remove(&id).unwrap();
        assert!(body.entries.is_empty());
        assert!(matches!(body.remove(&id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let mut body = VaultBody::new();
        body.upsert(VaultEntry::new("demo", "p@ss"));
        let restored = VaultBody::from_bytes(&body.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, body);
    }
}
