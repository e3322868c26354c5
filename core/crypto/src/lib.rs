//! Cryptographic primitives for Lockbox.
//!
//! This module provides:
//! - Key derivation using Argon2id or scrypt behind one interface
//! - Authenticated encryption with tagged algorithm profiles
//!   (XSalsa20-Poly1305, XChaCha20-Poly1305, AES-256-GCM)
//! - A salted password verifier with legacy-format support
//! - Secure memory buffers with multi-pass wipes and bulk emergency wipe
//!
//! # Security Guarantees
//! - All key material is zeroized on drop
//! - No plaintext or key material is ever logged
//! - Secret comparisons are constant-time
//!
//! Call [`init`] once before first use. It is idempotent and every engine
//! constructor calls it, so forgetting it only moves the self-test cost.

pub mod aead;
mod encoding;
pub mod hash;
pub mod init;
pub mod kdf;
pub mod keydata;
pub mod keyfile;
pub mod keys;
pub mod memory;
pub mod verifier;

pub use aead::{AeadAlgorithm, AeadEngine, EncryptedPayload};
pub use init::{init, is_initialized};
pub use kdf::{calibrate, derive_key, kdf_for, KdfAlgorithm, KdfParams, KeyDerivation};
pub use keydata::{VaultKeyData, Verification};
pub use keys::{Salt, VaultKey, KEY_LENGTH};
pub use memory::{constant_time_eq, SecureBuffer, SecureMemory};
pub use verifier::VerifierFormat;
