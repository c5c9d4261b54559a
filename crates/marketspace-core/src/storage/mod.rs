//! Key-value persistence backends.
//!
//! The session layer only needs async get/set/remove by string key. Three
//! backends are provided:
//! - `MemoryStore`: process-local map, used in tests and ephemeral runs
//! - `FileStore`: one file per key under a data directory
//! - `KeyringStore`: one OS keychain entry per key

pub mod file;
pub mod keychain;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use self::file::FileStore;
pub use self::keychain::KeyringStore;
pub use self::memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Async string key-value storage.
///
/// A missing key is `Ok(None)` on read and a no-op on remove; only real I/O
/// failures are errors.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}
