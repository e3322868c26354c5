//! Common utilities and types shared across Lockbox crates.
//!
//! This crate provides the error taxonomy used by every layer of the vault
//! core, identifier newtypes, and the clock abstraction that session expiry
//! is computed against.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use types::{SessionId, VaultId};
