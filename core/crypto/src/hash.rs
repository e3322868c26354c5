//! BLAKE2b-256 hashing for checksums, key-file fingerprints and the legacy
//! verifier.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// Output length of [`blake2b_256`].
pub const HASH_LENGTH: usize = 32;

/// Hash the concatenation of `parts`.
pub fn blake2b_256(parts: &[&[u8]]) -> [u8; HASH_LENGTH] {
    let mut hasher = Blake2b::<U32>::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut out = [0u8; HASH_LENGTH];
    out.copy_from_slice(&result);
    out
}

/// Checksum of a decrypted vault body, recorded in the file header.
pub fn checksum(data: &[u8]) -> [u8; HASH_LENGTH] {
    blake2b_256(&[b"lockbox.checksum.v1", data])
}
