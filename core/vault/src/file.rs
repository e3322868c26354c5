//! Vault file container.
//!
//! `[header][u32 LE key data length][VaultKeyData JSON][EncryptedPayload]`
//!
//! Key data sits next to the ciphertext so the key can be re-derived on a
//! later unlock with identical parameters.

use lockbox_common::{Error, Result};
use lockbox_crypto::{EncryptedPayload, VaultKeyData};

use crate::header::{read_header, VaultFileHeader, HEADER_LEN};

/// File extension used for vault files.
pub const VAULT_EXTENSION: &str = "lbx";

/// Upper bound on the key data block.
const MAX_KEY_DATA_LEN: usize = 64 * 1024;

/// A parsed vault file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultFile {
    pub header: VaultFileHeader,
    pub key_data: VaultKeyData,
    pub payload: EncryptedPayload,
}

impl VaultFile {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let key_data = self.key_data.to_bytes()?;
        let payload = self.payload.to_bytes();
        let key_data_len = u32::try_from(key_data.len())
            .map_err(|_| Error::Serialization("key data too large".to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + 4 + key_data.len() + payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&key_data_len.to_le_bytes());
        out.extend_from_slice(&key_data);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse a whole vault file. The header is validated before anything
    /// else is looked at.
    ///
    /// # Errors
    /// - `HeaderInvalid` for a foreign, unsupported or truncated file
    /// - `Serialization` if the key data block is malformed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = read_header(bytes)?;
        let rest = &bytes[HEADER_LEN..];

        if rest.len() < 4 {
            return Err(Error::HeaderInvalid("truncated vault file".to_string()));
        }
        let key_data_len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if key_data_len > MAX_KEY_DATA_LEN || rest.len() < 4 + key_data_len {
            return Err(Error::HeaderInvalid("truncated vault file".to_string()));
        }

        let key_data = VaultKeyData::from_bytes(&rest[4..4 + key_data_len])?;
        if key_data.salt.as_bytes() != &header.salt[..] {
            return Err(Error::HeaderInvalid(
                "header salt does not match key data".to_string(),
            ));
        }
        let payload = EncryptedPayload::from_bytes(&rest[4 + key_data_len..])?;

        Ok(Self {
            header,
            key_data,
            payload,
        })
    }
}

/// Storage file name for a vault id.
pub fn file_name_for(vault_id: &lockbox_common::VaultId) -> String {
    format!("{}.{}", vault_id, VAULT_EXTENSION)
}
