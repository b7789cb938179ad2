//! AES-256-GCM sealing for values persisted at rest.
//!
//! Sealed format: IV (12 bytes) || Ciphertext || Auth Tag (16 bytes)

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

use super::utils::generate_iv;

/// AES-256-GCM key size in bytes (256 bits).
pub const AES_KEY_SIZE: usize = 32;

/// AES-GCM IV size in bytes (96 bits).
pub const AES_IV_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits).
pub const AES_TAG_SIZE: usize = 16;

/// Minimum sealed data size: IV + auth tag (empty plaintext).
const MIN_SEALED_SIZE: usize = AES_IV_SIZE + AES_TAG_SIZE;

#[derive(Debug, Error)]
pub enum AesError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Sealed value too short ({0} bytes)")]
    Truncated(usize),
}

/// Seal `plaintext` under `key` with a fresh random IV.
///
/// Returns: IV (12 bytes) || Ciphertext || Auth Tag (16 bytes).
pub fn seal(plaintext: &[u8], key: &[u8; AES_KEY_SIZE]) -> Result<Vec<u8>, AesError> {
    let iv = generate_iv();
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AesError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| AesError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(AES_IV_SIZE + ciphertext.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a value produced by [`seal`].
///
/// Fails on truncated input, a wrong key, or any tampering with IV,
/// ciphertext or tag.
pub fn unseal(sealed: &[u8], key: &[u8; AES_KEY_SIZE]) -> Result<Vec<u8>, AesError> {
    if sealed.len() < MIN_SEALED_SIZE {
        return Err(AesError::Truncated(sealed.len()));
    }

    let (iv, ciphertext) = sealed.split_at(AES_IV_SIZE);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AesError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| AesError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_seal_layout() {
        let sealed = seal(b"cart", &KEY).unwrap();
        assert_eq!(sealed.len(), AES_IV_SIZE + 4 + AES_TAG_SIZE);
        assert_eq!(unseal(&sealed, &KEY).unwrap(), b"cart");
    }

    #[test]
    fn test_seal_uses_fresh_iv() {
        let a = seal(b"same", &KEY).unwrap();
        let b = seal(b"same", &KEY).unwrap();
        assert_ne!(a[..AES_IV_SIZE], b[..AES_IV_SIZE]);
    }

    #[test]
    fn test_unseal_wrong_key_fails() {
        let sealed = seal(b"secret", &KEY).unwrap();
        assert!(matches!(
            unseal(&sealed, &[8u8; 32]),
            Err(AesError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_unseal_tampered_fails() {
        let mut sealed = seal(b"secret", &KEY).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(unseal(&sealed, &KEY).is_err());
    }

    #[test]
    fn test_unseal_truncated() {
        assert!(matches!(unseal(&[0u8; 10], &KEY), Err(AesError::Truncated(10))));
    }
}
