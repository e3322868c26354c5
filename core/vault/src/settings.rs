//! Runtime settings for the vault core.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use lockbox_common::{Error, Result};
use lockbox_crypto::{AeadAlgorithm, KdfParams};

/// Tunables for sessions, sweeping and new vaults.
///
/// Every field has a default, so a settings file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Sliding session lifetime.
    pub session_ttl_ms: u64,
    /// Period of the background expiry sweep.
    pub sweep_interval_ms: u64,
    /// How long the app may stay backgrounded before every vault locks.
    /// Zero locks as soon as it is backgrounded.
    pub background_lock_threshold_ms: u64,
    /// KDF parameters for new vaults and password changes.
    pub default_kdf: KdfParams,
    /// Cipher for new vaults.
    pub default_algorithm: AeadAlgorithm,
    /// Target time for one derivation when calibrating on first run.
    /// Zero turns calibration off and new vaults use `default_kdf` as is.
    pub calibration_target_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session_ttl_ms: 5 * 60 * 1000,
            sweep_interval_ms: 30 * 1000,
            background_lock_threshold_ms: 0,
            default_kdf: KdfParams::default(),
            default_algorithm: AeadAlgorithm::default(),
            calibration_target_ms: 500,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. A missing file gives the defaults.
    ///
    /// # Errors
    /// - `Config` if the file is unreadable JSON or fails validation
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        let settings: Settings = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_ms == 0 {
            return Err(Error::Config("session_ttl_ms must be positive".to_string()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("sweep_interval_ms must be positive".to_string()));
        }
        if self.session_ttl_ms > i64::MAX as u64 {
            return Err(Error::Config("session_ttl_ms is too large".to_string()));
        }
        self.default_kdf
            .validate()
            .map_err(|e| Error::Config(format!("default_kdf: {}", e)))
    }

    pub fn session_ttl_millis(&self) -> i64 {
        self.session_ttl_ms as i64
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn calibration_target(&self) -> Duration {
        Duration::from_millis(self.calibration_target_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.session_ttl_ms, 300_000);
        assert_eq!(settings.default_algorithm, AeadAlgorithm::XSalsa20Poly1305);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"session_ttl_ms": 60000, "default_algorithm": "aes-256-gcm"}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.session_ttl_ms, 60_000);
        assert_eq!(settings.default_algorithm, AeadAlgorithm::Aes256Gcm);
        assert_eq!(settings.sweep_interval_ms, 30_000);
    }

    #[test]
    fn test_rejects_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"session_ttl_ms": 0}"#).unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));

        std::fs::write(
            &path,
            r#"{"default_kdf": {"algorithm": "scrypt", "cost": 1000, "block_size": 8, "parallelism": 1, "output_len": 32}}"#,
        )
        .unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));
    }
}
