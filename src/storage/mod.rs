//! Async key-value persistence.
//!
//! Every piece of durable client state (auth/cart/product slices, the
//! mutation queue blob) goes through a [`KeyValueStore`]. Production wraps a
//! [`FileStore`] in an [`EncryptedStore`]; tests use [`MemoryStore`].

pub mod encrypted;
pub mod file;
pub mod memory;

pub use encrypted::EncryptedStore;
pub use file::FileStore;
pub use memory::MemoryStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::crypto::aes::AesError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stored value could not be decrypted: {0}")]
    Crypto(#[from] AesError),
    #[error("Stored value is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Keys double as file names, so only a conservative alphabet is allowed.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Byte-oriented async key-value store.
#[allow(async_fn_in_trait)]
pub trait KeyValueStore {
    /// Returns `None` when the key has never been written (or was removed).
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Idempotent.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes).await
    }
}
