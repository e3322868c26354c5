//! Password verifier derived from the vault key.
//!
//! The current format is `verifier_salt (32) || hash (32)`, where `hash` is a
//! cheaper Argon2id pass over the vault key with its own random salt. Vaults
//! created before the salted scheme store a bare 32-byte BLAKE2b hash of the
//! key. The format is chosen by length alone, and a legacy verifier is never
//! fed to the salted scheme.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::hash::blake2b_256;
use crate::keys::VaultKey;
use crate::memory::constant_time_eq;
use lockbox_common::{Error, Result};

pub const VERIFIER_SALT_LENGTH: usize = 32;
pub const VERIFIER_HASH_LENGTH: usize = 32;
pub const VERIFIER_LENGTH: usize = VERIFIER_SALT_LENGTH + VERIFIER_HASH_LENGTH;
pub const LEGACY_VERIFIER_LENGTH: usize = 32;

// Well below the main KDF so unlock stays interactive.
const VERIFIER_MEMORY_KIB: u32 = 8192;
const VERIFIER_ITERATIONS: u32 = 2;
const VERIFIER_PARALLELISM: u32 = 1;

/// Layout of a stored verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierFormat {
    /// Bare hash of the key, no salt.
    Legacy,
    /// Salt followed by a secondary Argon2id hash.
    Salted,
}

impl VerifierFormat {
    /// Detect the format from the verifier length.
    ///
    /// # Errors
    /// - `InvalidVerifierFormat` for any other length
    pub fn detect(verifier: &[u8]) -> Result<Self> {
        match verifier.len() {
            VERIFIER_LENGTH => Ok(VerifierFormat::Salted),
            LEGACY_VERIFIER_LENGTH => Ok(VerifierFormat::Legacy),
            other => Err(Error::InvalidVerifierFormat(other)),
        }
    }
}

fn secondary_hash(key: &VaultKey, salt: &[u8]) -> Result<Zeroizing<[u8; VERIFIER_HASH_LENGTH]>> {
    let params = Params::new(
        VERIFIER_MEMORY_KIB,
        VERIFIER_ITERATIONS,
        VERIFIER_PARALLELISM,
        Some(VERIFIER_HASH_LENGTH),
    )
    .map_err(|e| Error::KeyDerivation(format!("verifier parameters: {}", e)))?;

    let mut out = Zeroizing::new([0u8; VERIFIER_HASH_LENGTH]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(key.as_bytes(), salt, out.as_mut())
        .map_err(|e| Error::KeyDerivation(format!("verifier hash: {}", e)))?;
    Ok(out)
}

/// Build a salted verifier for `key`.
pub fn create_verifier(key: &VaultKey) -> Result<Vec<u8>> {
    let mut salt = [0u8; VERIFIER_SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    let hash = secondary_hash(key, &salt)?;

    let mut verifier = Vec::with_capacity(VERIFIER_LENGTH);
    verifier.extend_from_slice(&salt);
    verifier.extend_from_slice(hash.as_ref());
    Ok(verifier)
}

/// Legacy verifier: a plain hash of the key.
pub fn legacy_verifier(key: &VaultKey) -> Vec<u8> {
    blake2b_256(&[key.as_bytes()]).to_vec()
}

/// Check `key` against a stored verifier of either format.
///
/// # Errors
/// - `InvalidVerifierFormat` if the verifier length is unknown
pub fn check_verifier(key: &VaultKey, verifier: &[u8]) -> Result<bool> {
    match VerifierFormat::detect(verifier)? {
        VerifierFormat::Salted => {
            let (salt, stored) = verifier.split_at(VERIFIER_SALT_LENGTH);
            let computed = secondary_hash(key, salt)?;
            Ok(constant_time_eq(computed.as_ref(), stored))
        }
        VerifierFormat::Legacy => {
            let computed = Zeroizing::new(blake2b_256(&[key.as_bytes()]));
            Ok(constant_time_eq(computed.as_ref(), verifier))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_salted_verifier_accepts_right_key() {
        let key = VaultKey::generate();
        let verifier = create_verifier(&key).unwrap();
        assert_eq!(verifier.len(), VERIFIER_LENGTH);
        assert!(check_verifier(&key, &verifier).unwrap());
    }

    #[test]
    fn test_salted_verifier_rejects_other_key() {
        let verifier = create_verifier(&VaultKey::generate()).unwrap();
        assert!(!check_verifier(&VaultKey::generate(), &verifier).unwrap());
    }

    #[test]
    fn test_verifier_never_contains_key() {
        let key = VaultKey::generate();
        let verifier = create_verifier(&key).unwrap();
        assert!(!verifier.windows(key.len()).any(|w| w == key.as_bytes()));
    }

    #[test]
    fn test_verifier_salts_are_random() {
        let key = VaultKey::generate();
        let v1 = create_verifier(&key).unwrap();
        let v2 = create_verifier(&key).unwrap();
        assert_ne!(v1, v2);
        assert!(check_verifier(&key, &v1).unwrap());
        assert!(check_verifier(&key, &v2).unwrap());
    }

    #[test]
    fn test_legacy_verifier() {
        let key = VaultKey::generate();
        let verifier = legacy_verifier(&key);
        assert_eq!(VerifierFormat::detect(&verifier).unwrap(), VerifierFormat::Legacy);
        assert!(check_verifier(&key, &verifier).unwrap());
        assert!(!check_verifier(&VaultKey::generate(), &verifier).unwrap());
    }

    #[test]
    fn test_unknown_length_rejected() {
        let key = VaultKey::generate();
        assert!(matches!(
            check_verifier(&key, &[0u8; 48]),
            Err(Error::InvalidVerifierFormat(48))
        ));
        assert!(matches!(
            VerifierFormat::detect(&[]),
            Err(Error::InvalidVerifierFormat(0))
        ));
    }
}
