//! Storage key derivation.
//!
//! The at-rest key is never stored directly. A random 32-byte master secret
//! lives in the OS keychain and purpose keys are derived from it:
//!
//!   master secret (32 bytes)
//!     -> HKDF-SHA256(salt="Storefront-v1", info=<purpose>)
//!     -> 32-byte AES-256 key

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::aes::AES_KEY_SIZE;

const HKDF_SALT: &[u8] = b"Storefront-v1";

/// HKDF info for the persisted state store.
pub const STORE_KEY_INFO: &[u8] = b"storefront-persist-v1";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid master secret size: expected {AES_KEY_SIZE} bytes, got {0}")]
    InvalidSecretSize(usize),
    #[error("Invalid master secret encoding")]
    InvalidEncoding,
    #[error("HKDF derivation failed")]
    DerivationFailed,
}

/// A 32-byte AES key, zeroed when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StoreKey([u8; AES_KEY_SIZE]);

impl StoreKey {
    pub fn from_bytes(bytes: [u8; AES_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreKey(..)")
    }
}

/// Derive a purpose key from the master secret.
pub fn derive_key(master: &[u8], info: &[u8]) -> Result<StoreKey, KeyError> {
    if master.len() != AES_KEY_SIZE {
        return Err(KeyError::InvalidSecretSize(master.len()));
    }
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), master);
    let mut okm = [0u8; AES_KEY_SIZE];
    hk.expand(info, &mut okm)
        .map_err(|_| KeyError::DerivationFailed)?;
    let key = StoreKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Decode a hex-encoded master secret as stored in the keychain.
pub fn decode_master_secret(encoded: &str) -> Result<Vec<u8>, KeyError> {
    let bytes = hex::decode(encoded.trim()).map_err(|_| KeyError::InvalidEncoding)?;
    if bytes.len() != AES_KEY_SIZE {
        return Err(KeyError::InvalidSecretSize(bytes.len()));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let master = [3u8; 32];
        let a = derive_key(&master, STORE_KEY_INFO).unwrap();
        let b = derive_key(&master, STORE_KEY_INFO).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_derive_key_domain_separated() {
        let master = [3u8; 32];
        let a = derive_key(&master, STORE_KEY_INFO).unwrap();
        let b = derive_key(&master, b"something-else").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), &master);
    }

    #[test]
    fn test_derive_key_rejects_short_secret() {
        assert!(matches!(
            derive_key(&[0u8; 16], STORE_KEY_INFO),
            Err(KeyError::InvalidSecretSize(16))
        ));
    }

    #[test]
    fn test_decode_master_secret() {
        let encoded = hex::encode([9u8; 32]);
        assert_eq!(decode_master_secret(&encoded).unwrap(), vec![9u8; 32]);
        assert!(matches!(
            decode_master_secret("zz"),
            Err(KeyError::InvalidEncoding)
        ));
        assert!(matches!(
            decode_master_secret("abcd"),
            Err(KeyError::InvalidSecretSize(2))
        ));
    }

    #[test]
    fn test_store_key_debug_redacted() {
        let key = StoreKey::from_bytes([1u8; 32]);
        assert_eq!(format!("{:?}", key), "StoreKey(..)");
    }
}
