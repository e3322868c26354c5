//! Vault engine for Lockbox.
//!
//! This module provides:
//! - The vault file format (fixed header plus key data and ciphertext)
//! - The registry of known vault files
//! - First-run KDF calibration
//! - The session store holding unlocked vaults, with a background sweep
//! - The vault manager: create, unlock, read/write, change password, lock
//!
//! # Architecture
//! The manager sits between callers and storage providers. A vault's key
//! and decrypted body only ever live inside a session, in wiped-on-drop
//! buffers, and disappear when the session is locked or expires.

pub mod body;
pub mod calibration;
pub mod file;
pub mod header;
pub mod manager;
pub mod registry;
pub mod session;
pub mod settings;

pub use body::{BodyStats, VaultBody, VaultEntry};
pub use calibration::{load_or_calibrate, CalibrationRecord, CALIBRATION_FILE};
pub use file::VaultFile;
pub use header::{read_header, VaultFileHeader};
pub use manager::{VaultManager, VaultState};
pub use registry::{VaultRegistry, VaultRegistryEntry};
pub use session::{SessionInfo, SessionState, SessionStore, SessionTtl, SweeperHandle};
pub use settings::Settings;
