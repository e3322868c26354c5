//! Authenticated encryption with tagged algorithm profiles.
//!
//! Every [`EncryptedPayload`] carries the [`AeadAlgorithm`] that produced it.
//! Profiles are not interchangeable: the tag is checked before any
//! decryption is attempted and a payload is only ever opened by the profile
//! that sealed it.
//!
//! Nonces are drawn from the OS CSPRNG on every call. Key lifetime spans
//! process restarts, so a counter would not be safe.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use crypto_secretbox::XSalsa20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

use crate::keys::KEY_LENGTH;
use lockbox_common::{Error, Result};

/// Authentication tag size shared by every profile (16 bytes).
pub const TAG_SIZE: usize = 16;

/// AEAD profile identifier, persisted with every payload and in vault key data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AeadAlgorithm {
    /// XSalsa20-Poly1305 secretbox, 24-byte nonce. Local-only storage.
    #[default]
    XSalsa20Poly1305,
    /// XChaCha20-Poly1305, 24-byte nonce.
    XChaCha20Poly1305,
    /// AES-256-GCM, 12-byte nonce. Cross-platform export.
    Aes256Gcm,
}

impl AeadAlgorithm {
    pub const ALL: [AeadAlgorithm; 3] = [
        AeadAlgorithm::XSalsa20Poly1305,
        AeadAlgorithm::XChaCha20Poly1305,
        AeadAlgorithm::Aes256Gcm,
    ];

    /// Persisted string tag.
    pub fn tag(&self) -> &'static str {
        match self {
            AeadAlgorithm::XSalsa20Poly1305 => "xsalsa20-poly1305",
            AeadAlgorithm::XChaCha20Poly1305 => "xchacha20-poly1305",
            AeadAlgorithm::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Resolve a persisted string tag.
    pub fn from_tag(tag: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.tag() == tag)
            .ok_or_else(|| Error::UnsupportedAlgorithm(format!("AEAD '{}' is not wired", tag)))
    }

    /// One-byte id used in the binary payload encoding.
    pub fn wire_id(&self) -> u8 {
        match self {
            AeadAlgorithm::XSalsa20Poly1305 => 1,
            AeadAlgorithm::XChaCha20Poly1305 => 2,
            AeadAlgorithm::Aes256Gcm => 3,
        }
    }

    pub fn from_wire_id(id: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.wire_id() == id)
            .ok_or_else(|| Error::UnsupportedAlgorithm(format!("AEAD id {} is not wired", id)))
    }

    /// Nonce length required by this profile.
    pub fn nonce_len(&self) -> usize {
        match self {
            AeadAlgorithm::XSalsa20Poly1305 | AeadAlgorithm::XChaCha20Poly1305 => 24,
            AeadAlgorithm::Aes256Gcm => 12,
        }
    }
}

impl fmt::Display for AeadAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl TryFrom<String> for AeadAlgorithm {
    type Error = Error;

    fn try_from(tag: String) -> Result<Self> {
        Self::from_tag(&tag)
    }
}

impl From<AeadAlgorithm> for String {
    fn from(algorithm: AeadAlgorithm) -> Self {
        algorithm.tag().to_string()
    }
}

/// A unit of ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub algorithm: AeadAlgorithm,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub nonce: Vec<u8>,
    /// Ciphertext including the authentication tag.
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Binary form: `[algorithm id][nonce][ciphertext || tag]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.nonce.len() + self.ciphertext.len());
        out.push(self.algorithm.wire_id());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the binary form.
    ///
    /// # Errors
    /// - `UnsupportedAlgorithm` for an unknown algorithm id
    /// - `DecryptionFailed` if the data is too short to hold a nonce and tag
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&id, rest) = bytes.split_first().ok_or(Error::DecryptionFailed)?;
        let algorithm = AeadAlgorithm::from_wire_id(id)?;
        let nonce_len = algorithm.nonce_len();
        if rest.len() < nonce_len + TAG_SIZE {
            return Err(Error::DecryptionFailed);
        }
        let (nonce, ciphertext) = rest.split_at(nonce_len);
        Ok(Self {
            algorithm,
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LENGTH {
        return Err(Error::InvalidKeyLength {
            expected: KEY_LENGTH,
            actual: key.len(),
        });
    }
    Ok(())
}

fn check_nonce(algorithm: AeadAlgorithm, nonce: &[u8]) -> Result<()> {
    if nonce.len() != algorithm.nonce_len() {
        return Err(Error::InvalidNonceLength {
            expected: algorithm.nonce_len(),
            actual: nonce.len(),
        });
    }
    Ok(())
}

fn invalid_key(key: &[u8]) -> Error {
    Error::InvalidKeyLength {
        expected: KEY_LENGTH,
        actual: key.len(),
    }
}

/// Seal `plaintext` with an explicit nonce. Lengths must already be checked.
pub(crate) fn seal(
    algorithm: AeadAlgorithm,
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let sealed = match algorithm {
        AeadAlgorithm::XSalsa20Poly1305 => XSalsa20Poly1305::new_from_slice(key)
            .map_err(|_| invalid_key(key))?
            .encrypt(GenericArray::from_slice(nonce), plaintext),
        AeadAlgorithm::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| invalid_key(key))?
            .encrypt(GenericArray::from_slice(nonce), plaintext),
        AeadAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|_| invalid_key(key))?
            .encrypt(GenericArray::from_slice(nonce), plaintext),
    };
    sealed.map_err(|_| Error::EncryptionFailed)
}

/// Open `ciphertext`. Every authentication failure maps to `DecryptionFailed`.
pub(crate) fn open(
    algorithm: AeadAlgorithm,
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let opened = match algorithm {
        AeadAlgorithm::XSalsa20Poly1305 => XSalsa20Poly1305::new_from_slice(key)
            .map_err(|_| invalid_key(key))?
            .decrypt(GenericArray::from_slice(nonce), ciphertext),
        AeadAlgorithm::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| invalid_key(key))?
            .decrypt(GenericArray::from_slice(nonce), ciphertext),
        AeadAlgorithm::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|_| invalid_key(key))?
            .decrypt(GenericArray::from_slice(nonce), ciphertext),
    };
    opened.map_err(|_| Error::DecryptionFailed)
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
/// - `InvalidKeyLength` if key is not KEY_LENGTH bytes
/// - `EncryptionFailed` if the primitive fails
pub fn encrypt(algorithm: AeadAlgorithm, plaintext: &[u8], key: &[u8]) -> Result<EncryptedPayload> {
    check_key(key)?;

    let mut nonce = vec![0u8; algorithm.nonce_len()];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = seal(algorithm, key, &nonce, plaintext)?;
    Ok(EncryptedPayload {
        algorithm,
        nonce,
        ciphertext,
    })
}

/// Decrypt raw ciphertext and nonce produced by `algorithm`.
///
/// # Errors
/// - `InvalidKeyLength` / `InvalidNonceLength` on malformed inputs
/// - `DecryptionFailed` for a wrong key, corrupted data or tampering alike
pub fn decrypt(
    algorithm: AeadAlgorithm,
    ciphertext: &[u8],
    nonce: &[u8],
    key: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    check_key(key)?;
    check_nonce(algorithm, nonce)?;
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::DecryptionFailed);
    }
    open(algorithm, key, nonce, ciphertext).map(Zeroizing::new)
}

/// Encryption engine bound to one algorithm profile.
#[derive(Debug, Clone, Copy)]
pub struct AeadEngine {
    algorithm: AeadAlgorithm,
}

impl AeadEngine {
    /// Create an engine, running the crypto self-test if it has not run yet.
    ///
    /// # Errors
    /// - `CryptoInit` if the self-test failed
    pub fn new(algorithm: AeadAlgorithm) -> Result<Self> {
        crate::init::init()?;
        Ok(Self { algorithm })
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    pub fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<EncryptedPayload> {
        encrypt(self.algorithm, plaintext, key)
    }

    /// Decrypt a payload sealed by this engine's profile.
    ///
    /// # Errors
    /// - `AlgorithmMismatch` if the payload tag names another profile
    /// - otherwise as [`decrypt`]
    pub fn decrypt(&self, payload: &EncryptedPayload, key: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if payload.algorithm != self.algorithm {
            return Err(Error::AlgorithmMismatch {
                expected: self.algorithm.to_string(),
                found: payload.algorithm.to_string(),
            });
        }
        decrypt(self.algorithm, &payload.ciphertext, &payload.nonce, key)
    }

    pub fn encrypt_string(&self, plaintext: &str, key: &[u8]) -> Result<EncryptedPayload> {
        self.encrypt(plaintext.as_bytes(), key)
    }

    /// Decrypt a UTF-8 string.
    ///
    /// # Errors
    /// - `Serialization` if the plaintext is not UTF-8
    pub fn decrypt_string(&self, payload: &EncryptedPayload, key: &[u8]) -> Result<Zeroizing<String>> {
        let mut bytes = self.decrypt(payload, key)?;
        let text = String::from_utf8(std::mem::take(&mut *bytes)).map_err(|e| {
            let message = format!("plaintext is not UTF-8: {}", e.utf8_error());
            e.into_bytes().zeroize();
            Error::Serialization(message)
        })?;
        Ok(Zeroizing::new(text))
    }

    /// Serialize to JSON, then encrypt.
    pub fn encrypt_object<T: Serialize>(&self, value: &T, key: &[u8]) -> Result<EncryptedPayload> {
        let json = Zeroizing::new(
            serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?,
        );
        self.encrypt(&json, key)
    }

    /// Decrypt, then deserialize from JSON.
    pub fn decrypt_object<T: DeserializeOwned>(&self, payload: &EncryptedPayload, key: &[u8]) -> Result<T> {
        let json = self.decrypt(payload, key)?;
        serde_json::from_slice(&json).map_err(|e| Error::Serialization(e.to_string()))
    }
}
