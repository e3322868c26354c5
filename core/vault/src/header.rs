//! Fixed-layout vault file header.
//!
//! The header is the unencrypted prefix of every vault file. It is readable
//! without the password and holds no key material, so a foreign or damaged
//! file is rejected before any KDF work starts.
//!
//! Layout (little-endian, 136 bytes):
//!
//! | offset | size | field           |
//! |--------|------|-----------------|
//! | 0      | 4    | magic `LBOX`    |
//! | 4      | 2    | version         |
//! | 6      | 2    | flags           |
//! | 8      | 16   | vault id        |
//! | 24     | 32   | salt            |
//! | 56     | 8    | created at (ms) |
//! | 64     | 8    | modified at (ms)|
//! | 72     | 32   | body checksum   |
//! | 104    | 32   | key file hash   |

use lockbox_common::{Error, Result, VaultId};
use lockbox_crypto::constant_time_eq;
use lockbox_crypto::hash::{checksum, HASH_LENGTH};
use lockbox_crypto::keys::SALT_LENGTH;
use lockbox_crypto::Salt;

/// File magic.
pub const MAGIC: [u8; 4] = *b"LBOX";

/// Version written by this build.
pub const FORMAT_VERSION: u16 = 1;

/// Highest version this build can read.
pub const MAX_SUPPORTED_VERSION: u16 = 1;

/// Serialized header size.
pub const HEADER_LEN: usize = 136;

/// Flag bit: the vault requires a key file.
pub const FLAG_KEY_FILE: u16 = 0x0001;

/// Unencrypted vault file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub flags: u16,
    pub vault_id: VaultId,
    pub salt: [u8; SALT_LENGTH],
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last save time, epoch milliseconds.
    pub modified_at: i64,
    /// Checksum of the decrypted body, checked after decryption.
    pub checksum: [u8; HASH_LENGTH],
    /// Fingerprint of the key file, when the vault uses one.
    pub key_file_hash: Option<[u8; HASH_LENGTH]>,
}

impl VaultFileHeader {
    /// Create a header for a new vault.
    ///
    /// # Errors
    /// - `InvalidInput` if the salt is not exactly 32 bytes
    pub fn new(vault_id: VaultId, salt: &Salt, now_millis: i64) -> Result<Self> {
        Ok(Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flags: 0,
            vault_id,
            salt: salt_array(salt)?,
            created_at: now_millis,
            modified_at: now_millis,
            checksum: [0u8; HASH_LENGTH],
            key_file_hash: None,
        })
    }

    /// Magic matches and the version is one this build can read.
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC && self.version >= 1 && self.version <= MAX_SUPPORTED_VERSION
    }

    pub fn has_key_file(&self) -> bool {
        self.flags & FLAG_KEY_FILE != 0
    }

    pub fn set_key_file_hash(&mut self, hash: Option<[u8; HASH_LENGTH]>) {
        match hash {
            Some(_) => self.flags |= FLAG_KEY_FILE,
            None => self.flags &= !FLAG_KEY_FILE,
        }
        self.key_file_hash = hash;
    }

    /// Replace the salt after a re-key.
    pub fn set_salt(&mut self, salt: &Salt) -> Result<()> {
        self.salt = salt_array(salt)?;
        Ok(())
    }

    /// Record the checksum of a freshly encrypted body.
    pub fn seal_body(&mut self, plaintext: &[u8], now_millis: i64) {
        self.checksum = checksum(plaintext);
        self.modified_at = now_millis;
    }

    /// Compare the stored checksum with one computed over `plaintext`.
    ///
    /// # Errors
    /// - `ChecksumMismatch` if they differ
    pub fn verify_checksum(&self, plaintext: &[u8]) -> Result<()> {
        if constant_time_eq(&checksum(plaintext), &self.checksum) {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch)
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..24].copy_from_slice(self.vault_id.as_bytes());
        out[24..56].copy_from_slice(&self.salt);
        out[56..64].copy_from_slice(&self.created_at.to_le_bytes());
        out[64..72].copy_from_slice(&self.modified_at.to_le_bytes());
        out[72..104].copy_from_slice(&self.checksum);
        if let Some(hash) = &self.key_file_hash {
            out[104..136].copy_from_slice(hash);
        }
        out
    }

    /// Decode the fixed fields without judging them.
    ///
    /// Use [`read_header`] to also reject foreign or unsupported files.
    ///
    /// # Errors
    /// - `HeaderInvalid` if fewer than [`HEADER_LEN`] bytes are given
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::HeaderInvalid(format!(
                "header too short: {} bytes, need {}",
                bytes.len(),
                HEADER_LEN
            )));
        }

        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        let key_file_hash = if flags & FLAG_KEY_FILE != 0 {
            Some(array(&bytes[104..136]))
        } else {
            None
        };

        Ok(Self {
            magic: array(&bytes[0..4]),
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            flags,
            vault_id: VaultId::from_bytes(array(&bytes[8..24])),
            salt: array(&bytes[24..56]),
            created_at: i64::from_le_bytes(array(&bytes[56..64])),
            modified_at: i64::from_le_bytes(array(&bytes[64..72])),
            checksum: array(&bytes[72..104]),
            key_file_hash,
        })
    }
}

/// Parse and validate the header at the start of `bytes`.
///
/// # Errors
/// - `HeaderInvalid` for short input, a foreign magic number, or a version
///   newer than [`MAX_SUPPORTED_VERSION`]
pub fn read_header(bytes: &[u8]) -> Result<VaultFileHeader> {
    let header = VaultFileHeader::parse(bytes)?;
    if header.magic != MAGIC {
        return Err(Error::HeaderInvalid("not a vault file".to_string()));
    }
    if !header.is_valid() {
        return Err(Error::HeaderInvalid(format!(
            "unsupported format version {}",
            header.version
        )));
    }
    Ok(header)
}

fn salt_array(salt: &Salt) -> Result<[u8; SALT_LENGTH]> {
    salt.as_bytes().try_into().map_err(|_| {
        Error::InvalidInput(format!(
            "Vault salt must be {} bytes, got {}",
            SALT_LENGTH,
            salt.as_bytes().len()
        ))
    })
}

// Callers always pass a slice of exactly N bytes.
fn array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}
