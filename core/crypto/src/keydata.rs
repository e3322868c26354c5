//! Vault key data: everything needed to re-derive and check the vault key.
//!
//! Stored next to the ciphertext, never inside it. Holds no key material.

use serde::{Deserialize, Serialize};

use crate::aead::AeadAlgorithm;
use crate::kdf::{derive_key, KdfParams};
use crate::keys::{Salt, VaultKey};
use crate::verifier::{check_verifier, create_verifier, VerifierFormat};
use lockbox_common::{Error, Result};

/// Salt, KDF parameters, verifier and cipher tag for one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultKeyData {
    pub salt: Salt,
    pub kdf_params: KdfParams,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub verifier: Vec<u8>,
    pub algorithm: AeadAlgorithm,
}

/// Outcome of checking a candidate password.
///
/// Carries the derived key when valid so the caller does not derive twice.
#[derive(Debug)]
pub struct Verification {
    pub valid: bool,
    key: Option<VaultKey>,
}

impl Verification {
    /// Take the derived key out of a successful verification.
    pub fn into_key(self) -> Option<VaultKey> {
        self.key
    }
}

impl VaultKeyData {
    /// Create key data for a new vault (or a re-key) from `password`.
    ///
    /// A fresh salt is generated every time.
    pub fn create(
        password: &[u8],
        kdf_params: KdfParams,
        algorithm: AeadAlgorithm,
    ) -> Result<(Self, VaultKey)> {
        kdf_params.validate()?;
        let salt = Salt::generate();
        let key = derive_key(password, &salt, &kdf_params)?;
        let verifier = create_verifier(&key)?;

        Ok((
            Self {
                salt,
                kdf_params,
                verifier,
                algorithm,
            },
            key,
        ))
    }

    /// Re-derive the key from `password` without checking it.
    pub fn derive(&self, password: &[u8]) -> Result<VaultKey> {
        derive_key(password, &self.salt, &self.kdf_params)
    }

    /// Check a candidate password against the stored verifier.
    ///
    /// The verifier format is checked before any derivation work happens.
    ///
    /// # Errors
    /// - `InvalidVerifierFormat` if the stored verifier is malformed
    /// - KDF errors for invalid parameters
    pub fn verify(&self, password: &[u8]) -> Result<Verification> {
        VerifierFormat::detect(&self.verifier)?;
        let key = self.derive(password)?;
        if check_verifier(&key, &self.verifier)? {
            Ok(Verification {
                valid: true,
                key: Some(key),
            })
        } else {
            Ok(Verification {
                valid: false,
                key: None,
            })
        }
    }

    pub fn verifier_format(&self) -> Result<VerifierFormat> {
        VerifierFormat::detect(&self.verifier)
    }

    /// Replace a legacy verifier with a salted one. Returns whether anything
    /// changed.
    pub fn upgrade_verifier(&mut self, key: &VaultKey) -> Result<bool> {
        if self.verifier_format()? == VerifierFormat::Salted {
            return Ok(false);
        }
        if !check_verifier(key, &self.verifier)? {
            return Err(Error::WrongPassword);
        }
        self.verifier = create_verifier(key)?;
        Ok(true)
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
    use crate::kdf::tests::{fast_argon2, fast_scrypt};
    use crate::verifier::legacy_verifier;

    #[test]
    fn test_verify_correct_and_wrong_password() {
        for params in [fast_argon2(), fast_scrypt()] {
            let (data, key) =
                VaultKeyData::create(b"Tr0ub4dor&3", params, AeadAlgorithm::default()).unwrap();

            let ok = data.verify(b"Tr0ub4dor&3").unwrap();
            assert!(ok.valid);
            assert_eq!(ok.into_key().unwrap().as_bytes(), key.as_bytes());

            let bad = data.verify(b"wrong").unwrap();
            assert!(!bad.valid);
            assert!(bad.into_key().is_none());
        }
    }

    #[test]
    fn test_legacy_and_salted_accepted_by_same_verify() {
        let (mut data, key) =
            VaultKeyData::create(b"pw", fast_argon2(), AeadAlgorithm::default()).unwrap();
        assert_eq!(data.verifier.len(), 64);
        assert!(data.verify(b"pw").unwrap().valid);

        data.verifier = legacy_verifier(&key);
        assert_eq!(data.verifier.len(), 32);
        assert!(data.verify(b"pw").unwrap().valid);
        assert!(!data.verify(b"nope").unwrap().valid);
    }

    #[test]
    fn test_upgrade_legacy_verifier() {
        let (mut data, key) =
            VaultKeyData::create(b"pw", fast_argon2(), AeadAlgorithm::default()).unwrap();
        data.verifier = legacy_verifier(&key);

        assert!(data.upgrade_verifier(&key).unwrap());
        assert_eq!(data.verifier_format().unwrap(), VerifierFormat::Salted);
        assert!(!data.upgrade_verifier(&key).unwrap());
        assert!(data.verify(b"pw").unwrap().valid);
    }

    #[test]
    fn test_malformed_verifier() {
        let (mut data, _) =
            VaultKeyData::create(b"pw", fast_argon2(), AeadAlgorithm::default()).unwrap();
        data.verifier.truncate(40);
        assert!(matches!(data.verify(b"pw"), Err(Error::InvalidVerifierFormat(40))));
    }

    #[test]
    fn test_each_vault_gets_fresh_salt() {
        let (a, _) = VaultKeyData::create(b"pw", fast_argon2(), AeadAlgorithm::default()).unwrap();
        let (b, _) = VaultKeyData::create(b"pw", fast_argon2(), AeadAlgorithm::default()).unwrap();
        assert_ne!(a.salt, b.salt);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let (data, _) =
            VaultKeyData::create(b"pw", fast_scrypt(), AeadAlgorithm::Aes256Gcm).unwrap();
        let restored = VaultKeyData::from_bytes(&data.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, data);
        assert!(restored.verify(b"pw").unwrap().valid);
    }
}
