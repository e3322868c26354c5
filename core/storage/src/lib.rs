//! Storage provider abstraction for Lockbox.
//!
//! Vault files are opaque blobs addressed by a flat file name inside a
//! storage location. Providers replace files atomically so a reader never
//! observes a half-written vault.

pub mod local;
pub mod memory;
pub mod provider;

pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{validate_name, FileMetadata, StorageProvider};
