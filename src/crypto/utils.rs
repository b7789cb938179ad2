//! Randomness helpers shared by the store and the queue.

use rand::RngCore;

use super::aes::{AES_IV_SIZE, AES_KEY_SIZE};

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate a random 32-byte secret.
pub fn generate_secret() -> [u8; AES_KEY_SIZE] {
    let mut key = [0u8; AES_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Generate a random 12-byte IV.
pub fn generate_iv() -> [u8; AES_IV_SIZE] {
    let mut iv = [0u8; AES_IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Opaque identifier: 16 random bytes, hex-encoded.
pub fn generate_id() -> String {
    hex::encode(generate_random_bytes(16))
}
