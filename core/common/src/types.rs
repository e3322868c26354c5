//! Identifier types used throughout Lockbox.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a vault.
///
/// Backed by a UUID so it fits the fixed-size slot in the vault file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultId(Uuid);

impl VaultId {
    /// Generate a fresh random vault id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build from the 16 raw bytes stored in a header.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw bytes for the header slot.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse from the hyphenated string form.
    ///
    /// # Errors
    /// - Returns error if `id` is not a valid UUID
    pub fn parse(id: &str) -> crate::Result<Self> {
        Uuid::parse_str(id)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid vault id '{}': {}", id, e)))
    }
}

impl FromStr for VaultId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session handle for tracking unlocked vaults.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new unique session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_id_bytes_roundtrip() {
        let id = VaultId::generate();
        let restored = VaultId::from_bytes(*id.as_bytes());
        assert_eq!(id, restored);
    }

    #[test]
    fn test_vault_id_parse() {
        let id = VaultId::generate();
        let parsed: VaultId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_vault_id_parse_invalid() {
        assert!(VaultId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_session_ids_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_vault_id_serde() {
        let id = VaultId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: VaultId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
