//! Crypto for data at rest.
//!
//! Persisted state is sealed with AES-256-GCM under a key derived (HKDF-SHA256)
//! from a master secret held in the OS keychain.

pub mod aes;
pub mod keys;
pub mod utils;

pub use aes::{seal, unseal};
pub use keys::{decode_master_secret, derive_key, StoreKey, STORE_KEY_INFO};
pub use utils::{generate_id, generate_iv, generate_random_bytes};
