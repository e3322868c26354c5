//! Common error types for Lockbox.
//!
//! Cryptographic failures are deliberately coarse: a failed authentication
//! tag, a wrong key and a corrupted ciphertext all surface as
//! [`Error::DecryptionFailed`], and every unlock mismatch surfaces as
//! [`Error::WrongPassword`].

use thiserror::Error;

/// Top-level error type for Lockbox operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Key length does not match what the algorithm requires.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Nonce length does not match what the algorithm requires.
    #[error("Invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    /// Authenticated decryption failed.
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Authenticated encryption failed.
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Stored verifier has a length no known scheme produces.
    #[error("Invalid verifier format: unexpected length {0}")]
    InvalidVerifierFormat(usize),

    /// Algorithm tag is unknown or not wired into this build.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Payload was produced by a different AEAD profile than requested.
    #[error("Algorithm mismatch: expected {expected}, found {found}")]
    AlgorithmMismatch { expected: String, found: String },

    /// KDF parameters failed validation.
    #[error("Invalid KDF parameters: {0}")]
    InvalidKdfParams(String),

    /// Key derivation itself failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Crypto runtime self-test failed; nothing may be encrypted.
    #[error("Crypto initialization failed: {0}")]
    CryptoInit(String),

    /// Candidate master password (or key file) is not correct.
    #[error("Wrong password")]
    WrongPassword,

    /// No live session with this id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session existed but its TTL has elapsed.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Vault has no unlocked session.
    #[error("Vault is locked: {0}")]
    VaultLocked(String),

    /// Vault file header has a bad magic number or unsupported version.
    #[error("Invalid vault header: {0}")]
    HeaderInvalid(String),

    /// Decrypted body does not match the checksum recorded in the header.
    #[error("Checksum mismatch: vault body is corrupted")]
    ChecksumMismatch,

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Configuration is invalid or unreadable.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decryption_failed_message_is_generic() {
        let msg = Error::DecryptionFailed.to_string();
        assert_eq!(msg, "Decryption failed");
        assert!(!msg.contains("key"));
        assert!(!msg.contains("tag"));
    }

    #[test]
    fn test_wrong_password_message_is_generic() {
        assert_eq!(Error::WrongPassword.to_string(), "Wrong password");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
