//! Cloud session and OTA configuration.
//!
//! All tunable parameters for the connectivity core. Values normally come
//! from a JSON document provisioned alongside the object model schema.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::schema::WireDialect;

/// Core cloud session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    // --- Identity ---
    pub product_key: String,
    pub product_secret: String,
    pub device_name: String,
    pub device_secret: String,
    /// MQTT client identifier handed to the transport.
    pub client_id: String,
    /// Broker host or URL.
    pub server: String,
    /// Identifier style of the backend (`"named"` or `"numeric"`).
    pub dialect: WireDialect,

    // --- Transport ---
    /// Keepalive interval negotiated with the broker (seconds).
    pub keepalive_secs: u16,
    /// Let the transport reconnect on its own after a drop.
    pub reconnect: bool,
    /// QoS used for every subscription.
    pub subscribe_qos: u8,

    // --- Modules reported to the cloud ---
    pub mcu_name: String,
    pub mcu_version: String,
    pub firmware_name: String,
    pub firmware_version: String,

    // --- Timing ---
    /// How long `post_data` and friends wait for each reply (milliseconds).
    pub publish_timeout_ms: u32,
    /// Poll interval of the reply wait loop (milliseconds).
    pub poll_interval_ms: u32,

    pub ota: OtaConfig,
}

/// OTA staging and transfer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Directory the composite archive is unpacked into.
    pub staging_root: PathBuf,
    /// Directory staged files are installed into on the next boot.
    pub install_root: PathBuf,
    /// Where the downloaded composite archive is written.
    pub archive_path: PathBuf,
    /// Upper bound for one composite download (seconds).
    pub download_timeout_secs: u32,
    /// MCU flashing block size (bytes).
    pub block_size: usize,
    /// Token-bucket rate for percent progress reports (per second).
    pub progress_rate_per_sec: u32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            product_key: String::new(),
            product_secret: String::new(),
            device_name: String::new(),
            device_secret: String::new(),
            client_id: String::new(),
            server: String::new(),
            dialect: WireDialect::Named,

            keepalive_secs: 120,
            reconnect: true,
            subscribe_qos: 0,

            mcu_name: String::new(),
            mcu_version: String::new(),
            firmware_name: String::new(),
            firmware_version: String::new(),

            publish_timeout_ms: 10_000, // 10 s
            poll_interval_ms: 50,

            ota: OtaConfig::default(),
        }
    }
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("/usr/.updater/usr"),
            install_root: PathBuf::from("/usr"),
            archive_path: PathBuf::from("/usr/sotaFile.tar.gz"),
            download_timeout_secs: 3600, // 1 h
            block_size: 4096,
            progress_rate_per_sec: 5,
        }
    }
}

impl CloudConfig {
    /// Parse a JSON configuration document and validate it.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Reject values that would make the session unusable.
    pub fn validate(&self) -> Result<(), Error> {
        if self.product_key.is_empty() {
            return Err(Error::Schema("product_key must not be empty".into()));
        }
        if self.device_name.is_empty() {
            return Err(Error::Schema("device_name must not be empty".into()));
        }
        if self.publish_timeout_ms == 0 || self.poll_interval_ms == 0 {
            return Err(Error::Schema("timeouts must be non-zero".into()));
        }
        if self.ota.block_size == 0 {
            return Err(Error::Schema("ota.block_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.publish_timeout_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.poll_interval_ms))
    }
}

impl OtaConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.download_timeout_secs))
    }
}
