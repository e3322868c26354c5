//! Key types with secure memory handling.
//!
//! Key material zeroizes itself on drop so it does not outlive its owner.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use lockbox_common::{Error, Result};

/// Length of vault encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of freshly generated salts.
pub const SALT_LENGTH: usize = 32;

/// Shortest salt accepted from storage.
pub const MIN_SALT_LENGTH: usize = 16;

/// Symmetric vault key derived from the master password.
///
/// The length follows the KDF output length; the AEAD layer rejects
/// anything other than [`KEY_LENGTH`].
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    key: Vec<u8>,
}

impl VaultKey {
    /// Wrap raw key bytes. The vector is moved, not copied.
    pub fn from_bytes(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Generate a random key, used for tests and key-file material.
    pub fn generate() -> Self {
        let mut key = vec![0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey([REDACTED])")
    }
}

/// Per-vault salt for key derivation.
///
/// Always random; never derived from the vault id or any other value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SaltRecord", into = "SaltRecord")]
pub struct Salt(Vec<u8>);

#[derive(Serialize, Deserialize)]
struct SaltRecord(#[serde(with = "crate::encoding::base64_bytes")] Vec<u8>);

impl TryFrom<SaltRecord> for Salt {
    type Error = Error;

    fn try_from(record: SaltRecord) -> Result<Self> {
        Salt::from_bytes(record.0)
    }
}

impl From<Salt> for SaltRecord {
    fn from(salt: Salt) -> Self {
        SaltRecord(salt.0)
    }
}

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = vec![0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from stored bytes.
    ///
    /// # Errors
    /// - Returns error if shorter than [`MIN_SALT_LENGTH`]
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < MIN_SALT_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Salt must be at least {} bytes, got {}",
                MIN_SALT_LENGTH,
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_key_debug_redacted() {
        let key = VaultKey::from_bytes(vec![7u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "VaultKey([REDACTED])");
    }

    #[test]
    fn test_generated_keys_differ() {
        let key1 = VaultKey::generate();
        let key2 = VaultKey::generate();
        assert_eq!(key1.len(), KEY_LENGTH);
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_salt_generate() {
        let salt1 = Salt::generate();
        let salt2 = Salt::generate();

        assert_eq!(salt1.as_bytes().len(), SALT_LENGTH);
        assert_ne!(salt1.as_bytes(), salt2.as_bytes());
    }

    #[test]
    fn test_short_salt_rejected() {
        assert!(Salt::from_bytes(vec![0u8; 8]).is_err());
        assert!(Salt::from_bytes(vec![0u8; MIN_SALT_LENGTH]).is_ok());
    }

    #[test]
    fn test_salt_serde_rejects_short() {
        let salt = Salt::generate();
        let json = serde_json::to_string(&salt).unwrap();
        let back: Salt = serde_json::from_str(&json).unwrap();
        assert_eq!(salt, back);

        // base64 of 4 bytes
        assert!(serde_json::from_str::<Salt>("\"AAAAAA==\"").is_err());
    }
}
