//! Runtime configuration from the environment (and `.env`).
//!
//! API base URL: STOREFRONT_API_URL > API_URL > localhost default.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sync::queue::DEFAULT_DEAD_LETTER_AFTER;
use crate::sync::{SyncSettings, SYNC_INTERVAL};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const DATA_DIR_NAME: &str = "storefront-sync";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("No data directory available; set STOREFRONT_DATA_DIR")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub data_dir: PathBuf,
    pub sync: SyncSettings,
    pub sync_interval: Duration,
    pub probe_interval: Duration,
    pub dead_letter_after: u32,
}

impl Config {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("STOREFRONT_API_URL")
            .or_else(|| lookup("API_URL"))
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let data_dir = match lookup("STOREFRONT_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join(DATA_DIR_NAME),
        };

        let defaults = SyncSettings::default();
        let number = |name: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(n) if n > 0 => Ok(Some(n)),
                    _ => Err(ConfigError::InvalidNumber { name, value: raw }),
                },
            }
        };

        let sync = SyncSettings {
            batch_size: number("STOREFRONT_SYNC_BATCH_SIZE")?
                .map(|n| n as usize)
                .unwrap_or(defaults.batch_size),
            max_attempts: number("STOREFRONT_SYNC_MAX_ATTEMPTS")?
                .map(|n| n.min(u64::from(u32::MAX)) as u32)
                .unwrap_or(defaults.max_attempts),
            base_backoff: number("STOREFRONT_SYNC_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_backoff),
            batch_delay: number("STOREFRONT_SYNC_BATCH_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_delay),
            ..defaults
        };

        Ok(Self {
            api_url,
            data_dir,
            sync,
            sync_interval: number("STOREFRONT_SYNC_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(SYNC_INTERVAL),
            probe_interval: number("STOREFRONT_PROBE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PROBE_INTERVAL),
            dead_letter_after: number("STOREFRONT_DEAD_LETTER_AFTER")?
                .map(|n| n.min(u64::from(u32::MAX)) as u32)
                .unwrap_or(DEFAULT_DEAD_LETTER_AFTER),
        })
    }
}
