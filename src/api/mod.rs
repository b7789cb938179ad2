//! API client module for the storefront backend.
//!
//! Provides the HTTP client with auth header injection and refresh, keychain
//! token storage, the endpoint table, error classification, and
//! request/response types matching the backend API.

pub mod auth;
pub mod client;
pub mod endpoints;
pub mod error;
#[cfg(test)]
mod tests;
pub mod types;

pub use client::ApiClient;
pub use endpoints::Endpoint;
pub use error::{ApiError, ErrorKind, OFFLINE_ERROR_CODE};
