//! First-run KDF calibration.
//!
//! The first time a manager opens, the configured KDF is tuned to take about
//! `calibration_target_ms` on this host and the result is stored next to the
//! registry. Later runs reuse it until the base parameters or the target
//! change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lockbox_common::{Error, Result};
use lockbox_crypto::{calibrate, KdfParams};
use lockbox_storage::StorageProvider;

use crate::manager::run_blocking;
use crate::settings::Settings;

/// Calibration file name inside the registry's storage location.
pub const CALIBRATION_FILE: &str = "calibration.json";

/// Stored outcome of one calibration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    /// Parameters the calibration started from.
    pub base: KdfParams,
    pub target_ms: u64,
    /// Tuned parameters used for new vaults.
    pub params: KdfParams,
    pub calibrated_at: DateTime<Utc>,
}

impl CalibrationRecord {
    fn matches(&self, settings: &Settings) -> bool {
        self.base == settings.default_kdf
            && self.target_ms == settings.calibration_target_ms
            && self.params.validate().is_ok()
    }
}

/// Read the stored calibration, if any.
///
/// # Errors
/// - Storage failures other than the file being absent
pub async fn load_record(provider: &Arc<dyn StorageProvider>) -> Result<Option<CalibrationRecord>> {
    let bytes = match provider.read(CALIBRATION_FILE).await {
        Ok(bytes) => bytes,
        Err(Error::NotFound(_)) => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!("Calibration record is corrupt: {}", e);
            Ok(None)
        }
    }
}

/// KDF parameters for new vaults.
///
/// With a zero target this is `settings.default_kdf`. Otherwise a stored
/// calibration for the same base and target is reused, or a new one is run
/// on the blocking pool and saved. A failed save is logged; the tuned
/// parameters are still returned.
///
/// # Errors
/// - `InvalidKdfParams` / `KeyDerivation` if calibration fails
/// - Storage failures reading an existing record
pub async fn load_or_calibrate(
    provider: &Arc<dyn StorageProvider>,
    settings: &Settings,
) -> Result<KdfParams> {
    if settings.calibration_target_ms == 0 {
        return Ok(settings.default_kdf.clone());
    }

    if let Some(record) = load_record(provider).await? {
        if record.matches(settings) {
            debug!("Using KDF calibration from {}", record.calibrated_at);
            return Ok(record.params);
        }
        info!("KDF settings changed since last calibration");
    }

    let base = settings.default_kdf.clone();
    let target = settings.calibration_target();
    let params = run_blocking(move || calibrate(&base, target)).await?;
    info!("Calibrated KDF for new vaults: {:?}", params);

    let record = CalibrationRecord {
        base: settings.default_kdf.clone(),
        target_ms: settings.calibration_target_ms,
        params: params.clone(),
        calibrated_at: Utc::now(),
    };
    let bytes = serde_json::to_vec_pretty(&record).map_err(|e| Error::Serialization(e.to_string()))?;
    if let Err(e) = provider.write(CALIBRATION_FILE, bytes).await {
        warn!("Failed to save KDF calibration: {}", e);
    }
    Ok(params)
}
