//! Keychain-backed secret storage.
//!
//! Uses the `keyring` crate so the auth tokens and the store master secret
//! live in the OS keychain, never in the persisted state directory.

use std::sync::Mutex;

use keyring::Entry;
use thiserror::Error;

use crate::crypto::utils::generate_secret;

/// Keychain service name.
const SERVICE_NAME: &str = "app.storefront.client";

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const MASTER_SECRET_KEY: &str = "store_master_secret";

#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("Keychain operation failed: {0}")]
    OperationFailed(String),
}

impl From<keyring::Error> for KeychainError {
    fn from(err: keyring::Error) -> Self {
        KeychainError::OperationFailed(err.to_string())
    }
}

fn read_entry(key: &str) -> Result<Option<String>, KeychainError> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    match entry.get_password() {
        Ok(value) => Ok(Some(value)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(KeychainError::from(e)),
    }
}

fn write_entry(key: &str, value: &str) -> Result<(), KeychainError> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Idempotent: a missing entry is not an error.
fn delete_entry(key: &str) -> Result<(), KeychainError> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(KeychainError::from(e)),
    }
}

/// Load the hex-encoded store master secret, creating it on first launch.
pub fn get_or_create_master_secret() -> Result<String, KeychainError> {
    if let Some(existing) = read_entry(MASTER_SECRET_KEY)? {
        return Ok(existing);
    }
    let encoded = hex::encode(generate_secret());
    write_entry(MASTER_SECRET_KEY, &encoded)?;
    log::info!("Generated new store master secret");
    Ok(encoded)
}

/// Where the API client reads and writes its bearer and refresh tokens.
pub trait TokenStore: Send + Sync {
    fn access_token(&self) -> Result<Option<String>, KeychainError>;
    fn refresh_token(&self) -> Result<Option<String>, KeychainError>;
    fn store_tokens(&self, access: &str, refresh: Option<&str>) -> Result<(), KeychainError>;
    fn clear(&self) -> Result<(), KeychainError>;
}

/// Tokens in the OS keychain.
#[derive(Debug, Default)]
pub struct KeychainTokenStore;

impl TokenStore for KeychainTokenStore {
    fn access_token(&self) -> Result<Option<String>, KeychainError> {
        read_entry(ACCESS_TOKEN_KEY)
    }

    fn refresh_token(&self) -> Result<Option<String>, KeychainError> {
        read_entry(REFRESH_TOKEN_KEY)
    }

    fn store_tokens(&self, access: &str, refresh: Option<&str>) -> Result<(), KeychainError> {
        write_entry(ACCESS_TOKEN_KEY, access)?;
        if let Some(refresh) = refresh {
            write_entry(REFRESH_TOKEN_KEY, refresh)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), KeychainError> {
        delete_entry(ACCESS_TOKEN_KEY)?;
        delete_entry(REFRESH_TOKEN_KEY)
    }
}

/// Process-local token store for tests and headless runs.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<(Option<String>, Option<String>)>,
}

impl MemoryTokenStore {
    pub fn with_tokens(access: &str, refresh: &str) -> Self {
        Self {
            tokens: Mutex::new((Some(access.to_string()), Some(refresh.to_string()))),
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, (Option<String>, Option<String>)>, KeychainError> {
        self.tokens
            .lock()
            .map_err(|_| KeychainError::OperationFailed("token store poisoned".to_string()))
    }
}

impl TokenStore for MemoryTokenStore {
    fn access_token(&self) -> Result<Option<String>, KeychainError> {
        Ok(self.lock()?.0.clone())
    }

    fn refresh_token(&self) -> Result<Option<String>, KeychainError> {
        Ok(self.lock()?.1.clone())
    }

    fn store_tokens(&self, access: &str, refresh: Option<&str>) -> Result<(), KeychainError> {
        let mut tokens = self.lock()?;
        tokens.0 = Some(access.to_string());
        if let Some(refresh) = refresh {
            tokens.1 = Some(refresh.to_string());
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), KeychainError> {
        *self.lock()? = (None, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_keeps_refresh_when_not_rotated() {
        let store = MemoryTokenStore::with_tokens("a1", "r1");
        store.store_tokens("a2", None).unwrap();
        assert_eq!(store.access_token().unwrap().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().unwrap().as_deref(), Some("r1"));

        store.store_tokens("a3", Some("r2")).unwrap();
        assert_eq!(store.refresh_token().unwrap().as_deref(), Some("r2"));
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemoryTokenStore::with_tokens("a", "r");
        store.clear().unwrap();
        assert!(store.access_token().unwrap().is_none());
        assert!(store.refresh_token().unwrap().is_none());
    }
}
