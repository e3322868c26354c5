//! Key-file second factor.
//!
//! A key file is 32 random bytes. When a vault uses one, the KDF input is
//! `BLAKE2b-256(KEYFILE_DOMAIN || keyfile || password)` instead of the bare
//! password, and the vault header records `BLAKE2b-256(keyfile)` so the
//! right file can be recognised without the password.

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::hash::{blake2b_256, HASH_LENGTH};
use lockbox_common::{Error, Result};

/// Expected length of a key file in bytes.
pub const KEYFILE_LEN: usize = 32;

/// Prefix of the combined KDF input, so it never equals a plain key-file hash.
pub const KEYFILE_DOMAIN: &[u8] = b"lockbox.keyfile.v1";

/// Generate a new random key file at `path` (owner-only on Unix).
pub fn generate_keyfile(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    if path.exists() {
        return Err(Error::AlreadyExists(format!(
            "Key file already exists at {}",
            path.display()
        )));
    }

    let mut keyfile = Zeroizing::new(vec![0u8; KEYFILE_LEN]);
    OsRng.fill_bytes(&mut keyfile);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, keyfile.as_slice())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(keyfile)
}

/// Load a key file and check its length.
pub fn load_keyfile(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    if !path.exists() {
        return Err(Error::NotFound(format!("Key file not found at {}", path.display())));
    }
    let data = Zeroizing::new(fs::read(path)?);
    if data.len() != KEYFILE_LEN {
        return Err(Error::InvalidInput(format!(
            "Key file must be exactly {} bytes, got {}",
            KEYFILE_LEN,
            data.len()
        )));
    }
    Ok(data)
}

/// Fingerprint recorded in the vault header.
pub fn keyfile_hash(keyfile: &[u8]) -> [u8; HASH_LENGTH] {
    blake2b_256(&[keyfile])
}

/// KDF input for a password plus key file:
/// `BLAKE2b-256(KEYFILE_DOMAIN || keyfile || password)`.
pub fn combine(password: &[u8], keyfile: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(blake2b_256(&[KEYFILE_DOMAIN, keyfile, password]).to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("vault.key");

        let generated = generate_keyfile(&path).unwrap();
        let loaded = load_keyfile(&path).unwrap();
        assert_eq!(generated.as_slice(), loaded.as_slice());
        assert!(generate_keyfile(&path).is_err());
    }

    #[test]
    fn test_load_wrong_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.key");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(load_keyfile(&path), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_combine_depends_on_both_inputs() {
        let a = combine(b"pw", &[1u8; 32]);
        let b = combine(b"pw", &[2u8; 32]);
        let c = combine(b"pw2", &[1u8; 32]);
        assert_ne!(a.as_slice(), b.as_slice());
        assert_ne!(a.as_slice(), c.as_slice());
        assert_ne!(a.as_slice(), &keyfile_hash(&[1u8; 32])[..]);
    }

    #[test]
    fn test_combine_layout() {
        let keyfile = [9u8; KEYFILE_LEN];
        let mut concatenated = KEYFILE_DOMAIN.to_vec();
        concatenated.extend_from_slice(&keyfile);
        concatenated.extend_from_slice(b"Tr0ub4dor&3");

        let combined = combine(b"Tr0ub4dor&3", &keyfile);
        assert_eq!(combined.as_slice(), &blake2b_256(&[concatenated.as_slice()])[..]);
        assert_eq!(combined.len(), HASH_LENGTH);
    }
}
