//! Password-based key derivation.
//!
//! Two memory-hard algorithms sit behind the [`KeyDerivation`] trait:
//! Argon2id (the default for new vaults) and scrypt. Parameters are validated
//! when they are constructed or deserialized, so a bad cost factor fails
//! before any password ever reaches the KDF.
//!
//! Switching a vault from one algorithm to the other is a re-key, never an
//! implicit fallback.

use std::time::{Duration, Instant};

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::keys::{Salt, VaultKey, KEY_LENGTH};
use lockbox_common::{Error, Result};

/// Smallest accepted derived-key length.
pub const MIN_OUTPUT_LEN: usize = 16;

/// Largest accepted derived-key length.
pub const MAX_OUTPUT_LEN: usize = 64;

/// Upper bound for calibrated Argon2id iterations.
const MAX_CALIBRATED_ITERATIONS: u32 = 32;

/// Upper bound for calibrated scrypt cost (2^20).
const MAX_CALIBRATED_SCRYPT_LOG_N: u32 = 20;

/// Identifier of a KDF algorithm as persisted in vault key data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KdfAlgorithm {
    Scrypt,
    Argon2id,
}

impl KdfAlgorithm {
    /// Persisted tag.
    pub fn tag(&self) -> &'static str {
        match self {
            KdfAlgorithm::Scrypt => "scrypt",
            KdfAlgorithm::Argon2id => "argon2id",
        }
    }

    /// Resolve a persisted tag.
    ///
    /// # Errors
    /// - `UnsupportedAlgorithm` for any tag this build does not implement
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "scrypt" => Ok(KdfAlgorithm::Scrypt),
            "argon2id" => Ok(KdfAlgorithm::Argon2id),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "KDF '{}' is not wired",
                other
            ))),
        }
    }
}

/// KDF algorithm plus its cost parameters.
///
/// Immutable for the life of a vault unless an explicit re-key runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "KdfParamsRecord", into = "KdfParamsRecord")]
pub enum KdfParams {
    Scrypt {
        /// CPU/memory cost N; a power of two greater than 1.
        cost: u64,
        /// Block size r.
        block_size: u32,
        /// Parallelism p.
        parallelism: u32,
        output_len: usize,
    },
    Argon2id {
        /// Memory cost in KiB (e.g., 65536 = 64 MiB).
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
        output_len: usize,
    },
}

impl KdfParams {
    /// Validated scrypt parameters.
    ///
    /// # Errors
    /// - `InvalidKdfParams` if `cost` is not a power of two > 1, or
    ///   `block_size`/`parallelism` is zero, or `output_len` is out of range
    pub fn scrypt(cost: u64, block_size: u32, parallelism: u32, output_len: usize) -> Result<Self> {
        let params = KdfParams::Scrypt {
            cost,
            block_size,
            parallelism,
            output_len,
        };
        params.validate()?;
        Ok(params)
    }

    /// Validated Argon2id parameters.
    pub fn argon2id(
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
        output_len: usize,
    ) -> Result<Self> {
        let params = KdfParams::Argon2id {
            memory_kib,
            iterations,
            parallelism,
            output_len,
        };
        params.validate()?;
        Ok(params)
    }

    /// Argon2id tuned for interactive unlock on desktop hardware.
    pub fn interactive() -> Self {
        KdfParams::Argon2id {
            memory_kib: 65536, // 64 MiB
            iterations: 3,
            parallelism: 4,
            output_len: KEY_LENGTH,
        }
    }

    /// Argon2id for sensitive vaults; may take several seconds.
    pub fn sensitive() -> Self {
        KdfParams::Argon2id {
            memory_kib: 262144, // 256 MiB
            iterations: 4,
            parallelism: 4,
            output_len: KEY_LENGTH,
        }
    }

    /// Argon2id for mobile devices.
    pub fn moderate() -> Self {
        KdfParams::Argon2id {
            memory_kib: 32768, // 32 MiB
            iterations: 3,
            parallelism: 2,
            output_len: KEY_LENGTH,
        }
    }

    /// scrypt with N=2^15, r=8, p=1.
    pub fn scrypt_default() -> Self {
        KdfParams::Scrypt {
            cost: 1 << 15,
            block_size: 8,
            parallelism: 1,
            output_len: KEY_LENGTH,
        }
    }

    pub fn algorithm(&self) -> KdfAlgorithm {
        match self {
            KdfParams::Scrypt { .. } => KdfAlgorithm::Scrypt,
            KdfParams::Argon2id { .. } => KdfAlgorithm::Argon2id,
        }
    }

    pub fn output_len(&self) -> usize {
        match self {
            KdfParams::Scrypt { output_len, .. } | KdfParams::Argon2id { output_len, .. } => {
                *output_len
            }
        }
    }

    /// Check every parameter without deriving anything.
    pub fn validate(&self) -> Result<()> {
        let output_len = self.output_len();
        if !(MIN_OUTPUT_LEN..=MAX_OUTPUT_LEN).contains(&output_len) {
            return Err(Error::InvalidKdfParams(format!(
                "output length must be between {} and {}, got {}",
                MIN_OUTPUT_LEN, MAX_OUTPUT_LEN, output_len
            )));
        }

        match self {
            KdfParams::Scrypt {
                cost,
                block_size,
                parallelism,
                output_len,
            } => {
                if *cost <= 1 || !cost.is_power_of_two() {
                    return Err(Error::InvalidKdfParams(format!(
                        "scrypt cost must be a power of two greater than 1, got {}",
                        cost
                    )));
                }
                if *block_size == 0 {
                    return Err(Error::InvalidKdfParams(
                        "scrypt block size must be greater than 0".to_string(),
                    ));
                }
                if *parallelism == 0 {
                    return Err(Error::InvalidKdfParams(
                        "scrypt parallelism must be greater than 0".to_string(),
                    ));
                }
                scrypt_params(*cost, *block_size, *parallelism, *output_len).map(|_| ())
            }
            KdfParams::Argon2id {
                memory_kib,
                iterations,
                parallelism,
                output_len,
            } => {
                if *iterations == 0 {
                    return Err(Error::InvalidKdfParams(
                        "Argon2id iterations must be at least 1".to_string(),
                    ));
                }
                if *parallelism == 0 {
                    return Err(Error::InvalidKdfParams(
                        "Argon2id parallelism must be at least 1".to_string(),
                    ));
                }
                argon2_params(*memory_kib, *iterations, *parallelism, *output_len).map(|_| ())
            }
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Flat persisted form; the algorithm tag is resolved on load so unknown
/// algorithms fail with a clear error instead of a serde variant mismatch.
#[derive(Serialize, Deserialize)]
struct KdfParamsRecord {
    algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cost: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memory_kib: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iterations: Option<u32>,
    parallelism: u32,
    output_len: usize,
}

impl TryFrom<KdfParamsRecord> for KdfParams {
    type Error = Error;

    fn try_from(record: KdfParamsRecord) -> Result<Self> {
        let missing = |field: &str| {
            Error::InvalidKdfParams(format!("{} parameters missing '{}'", record.algorithm, field))
        };
        match KdfAlgorithm::from_tag(&record.algorithm)? {
            KdfAlgorithm::Scrypt => KdfParams::scrypt(
                record.cost.ok_or_else(|| missing("cost"))?,
                record.block_size.ok_or_else(|| missing("block_size"))?,
                record.parallelism,
                record.output_len,
            ),
            KdfAlgorithm::Argon2id => KdfParams::argon2id(
                record.memory_kib.ok_or_else(|| missing("memory_kib"))?,
                record.iterations.ok_or_else(|| missing("iterations"))?,
                record.parallelism,
                record.output_len,
            ),
        }
    }
}

impl From<KdfParams> for KdfParamsRecord {
    fn from(params: KdfParams) -> Self {
        let algorithm = params.algorithm().tag().to_string();
        match params {
            KdfParams::Scrypt {
                cost,
                block_size,
                parallelism,
                output_len,
            } => KdfParamsRecord {
                algorithm,
                cost: Some(cost),
                block_size: Some(block_size),
                memory_kib: None,
                iterations: None,
                parallelism,
                output_len,
            },
            KdfParams::Argon2id {
                memory_kib,
                iterations,
                parallelism,
                output_len,
            } => KdfParamsRecord {
                algorithm,
                cost: None,
                block_size: None,
                memory_kib: Some(memory_kib),
                iterations: Some(iterations),
                parallelism,
                output_len,
            },
        }
    }
}

fn scrypt_params(cost: u64, block_size: u32, parallelism: u32, output_len: usize) -> Result<scrypt::Params> {
    let log_n = u8::try_from(cost.trailing_zeros())
        .map_err(|_| Error::InvalidKdfParams(format!("scrypt cost {} too large", cost)))?;
    scrypt::Params::new(log_n, block_size, parallelism, output_len)
        .map_err(|e| Error::InvalidKdfParams(format!("scrypt: {}", e)))
}

fn argon2_params(memory_kib: u32, iterations: u32, parallelism: u32, output_len: usize) -> Result<Params> {
    Params::new(memory_kib, iterations, parallelism, Some(output_len))
        .map_err(|e| Error::InvalidKdfParams(format!("Argon2id: {}", e)))
}

/// A configured password-based key derivation function.
pub trait KeyDerivation: Send + Sync {
    /// Algorithm this instance runs.
    fn algorithm(&self) -> KdfAlgorithm;

    /// Derive a key from `password` and `salt`.
    ///
    /// Deterministic: the same inputs always produce the same key. Slow by
    /// design; callers on an async runtime should run it on a blocking
    /// thread.
    fn derive(&self, password: &[u8], salt: &Salt) -> Result<VaultKey>;
}

/// scrypt key derivation.
pub struct ScryptKdf {
    params: scrypt::Params,
    output_len: usize,
}

impl ScryptKdf {
    /// # Errors
    /// - `InvalidKdfParams` if the parameters fail validation
    pub fn new(cost: u64, block_size: u32, parallelism: u32, output_len: usize) -> Result<Self> {
        KdfParams::scrypt(cost, block_size, parallelism, output_len)?;
        Ok(Self {
            params: scrypt_params(cost, block_size, parallelism, output_len)?,
            output_len,
        })
    }
}

impl KeyDerivation for ScryptKdf {
    fn algorithm(&self) -> KdfAlgorithm {
        KdfAlgorithm::Scrypt
    }

    fn derive(&self, password: &[u8], salt: &Salt) -> Result<VaultKey> {
        ensure_password(password)?;
        let mut key = vec![0u8; self.output_len];
        scrypt::scrypt(password, salt.as_bytes(), &self.params, &mut key)
            .map_err(|e| Error::KeyDerivation(format!("scrypt: {}", e)))?;
        Ok(VaultKey::from_bytes(key))
    }
}

/// Argon2id key derivation.
pub struct Argon2idKdf {
    params: Params,
    output_len: usize,
}

impl Argon2idKdf {
    /// # Errors
    /// - `InvalidKdfParams` if the parameters fail validation
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32, output_len: usize) -> Result<Self> {
        KdfParams::argon2id(memory_kib, iterations, parallelism, output_len)?;
        Ok(Self {
            params: argon2_params(memory_kib, iterations, parallelism, output_len)?,
            output_len,
        })
    }
}

impl KeyDerivation for Argon2idKdf {
    fn algorithm(&self) -> KdfAlgorithm {
        KdfAlgorithm::Argon2id
    }

    fn derive(&self, password: &[u8], salt: &Salt) -> Result<VaultKey> {
        ensure_password(password)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut key = vec![0u8; self.output_len];
        argon2
            .hash_password_into(password, salt.as_bytes(), &mut key)
            .map_err(|e| Error::KeyDerivation(format!("Argon2id: {}", e)))?;
        Ok(VaultKey::from_bytes(key))
    }
}

fn ensure_password(password: &[u8]) -> Result<()> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }
    Ok(())
}

/// Build the KDF described by `params`.
pub fn kdf_for(params: &KdfParams) -> Result<Box<dyn KeyDerivation>> {
    match *params {
        KdfParams::Scrypt {
            cost,
            block_size,
            parallelism,
            output_len,
        } => Ok(Box::new(ScryptKdf::new(cost, block_size, parallelism, output_len)?)),
        KdfParams::Argon2id {
            memory_kib,
            iterations,
            parallelism,
            output_len,
        } => Ok(Box::new(Argon2idKdf::new(
            memory_kib,
            iterations,
            parallelism,
            output_len,
        )?)),
    }
}

/// Derive a vault key from a password and salt.
///
/// # Errors
/// - `InvalidInput` if password is empty
/// - `InvalidKdfParams` if parameters are invalid
/// - `KeyDerivation` if the primitive fails
///
/// # Security
/// - Password is not stored or logged
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<VaultKey> {
    kdf_for(params)?.derive(password, salt)
}

fn time_derivation(params: &KdfParams) -> Result<Duration> {
    let salt = Salt::from_bytes(vec![0x5a; 16])?;
    let kdf = kdf_for(params)?;
    let start = Instant::now();
    kdf.derive(b"lockbox-calibration", &salt)?;
    Ok(start.elapsed())
}

/// Tune `base` so one derivation takes roughly `target` on this host.
///
/// Argon2id scales its iteration count; scrypt doubles its cost factor.
/// Memory, block size and parallelism are kept from `base`.
pub fn calibrate(base: &KdfParams, target: Duration) -> Result<KdfParams> {
    base.validate()?;

    match *base {
        KdfParams::Argon2id {
            memory_kib,
            parallelism,
            output_len,
            ..
        } => {
            let probe = KdfParams::argon2id(memory_kib, 1, parallelism, output_len)?;
            let per_iteration = time_derivation(&probe)?.max(Duration::from_micros(1));
            let ratio = target.as_secs_f64() / per_iteration.as_secs_f64();
            let iterations = (ratio.round() as u32).clamp(1, MAX_CALIBRATED_ITERATIONS);
            debug!(
                "Calibrated Argon2id: {:?} per iteration, {} iterations",
                per_iteration, iterations
            );
            KdfParams::argon2id(memory_kib, iterations, parallelism, output_len)
        }
        KdfParams::Scrypt {
            cost,
            block_size,
            parallelism,
            output_len,
        } => {
            let mut current = KdfParams::scrypt(cost, block_size, parallelism, output_len)?;
            let mut log_n = cost.trailing_zeros();
            let mut elapsed = time_derivation(&current)?;
            while elapsed < target && log_n < MAX_CALIBRATED_SCRYPT_LOG_N {
                log_n += 1;
                current = KdfParams::scrypt(1u64 << log_n, block_size, parallelism, output_len)?;
                elapsed = time_derivation(&current)?;
            }
            debug!("Calibrated scrypt: N=2^{} in {:?}", log_n, elapsed);
            Ok(current)
        }
    }
}
