//! Offline-first client core for the storefront app.
//!
//! Writes made while offline are queued, persisted, and replayed against the
//! backend once connectivity returns; the cart stays optimistic in between.

pub mod api;
pub mod config;
pub mod connectivity;
pub mod crypto;
pub mod deeplink;
pub mod state;
pub mod status;
pub mod storage;
pub mod sync;
