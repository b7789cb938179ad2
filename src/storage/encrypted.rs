//! AES-256-GCM encryption at rest over any [`KeyValueStore`].

use super::{KeyValueStore, StorageError};
use crate::crypto::aes;
use crate::crypto::keys::StoreKey;

pub struct EncryptedStore<S> {
    inner: S,
    key: StoreKey,
}

impl<S: KeyValueStore> EncryptedStore<S> {
    pub fn new(inner: S, key: StoreKey) -> Self {
        Self { inner, key }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: KeyValueStore> KeyValueStore for EncryptedStore<S> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.inner.get(key).await? {
            Some(sealed) => Ok(Some(aes::unseal(&sealed, self.key.as_bytes())?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let sealed = aes::seal(value, self.key.as_bytes())?;
        self.inner.set(key, &sealed).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key).await
    }
}
