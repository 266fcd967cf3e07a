//! Configuration file support for ccpflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CCPFLASH_*)
//! 3. Local config file (./ccpflash.toml)
//! 4. Global config file (~/.config/ccpflash/config.toml)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ccpflash::{HandlerConfig, Password, RetryPolicy};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "ccpflash.toml";

/// Default lower bound on command timeouts, in milliseconds.
pub const DEFAULT_MINIMUM_TIMEOUT_MS: u64 = 100;

/// CAN bus identifiers and station.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// Identifier of host command frames.
    pub host_id: Option<u32>,
    /// Identifier of bootloader reply frames.
    pub reply_id: Option<u32>,
    /// Station address to connect to.
    pub station: Option<u8>,
}

/// Timeouts and connect retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Lower bound applied to every command timeout.
    pub minimum_timeout_ms: Option<u64>,
    /// Extra connect attempts.
    pub connect_retries: Option<usize>,
    /// Pause after the connect burst.
    pub settle_ms: Option<u64>,
}

/// Unlock settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnlockConfig {
    /// 16-bit unlock key; the DSP flash key when unset.
    pub key: Option<u16>,
}

/// Simulator backend settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    /// Size of each simulated memory region in bytes.
    pub memory_size: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bus configuration.
    #[serde(default)]
    pub bus: BusConfig,
    /// Timing configuration.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Unlock configuration.
    #[serde(default)]
    pub unlock: UnlockConfig,
    /// Simulator configuration.
    #[serde(default)]
    pub sim: SimConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ccpflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.bus.host_id.is_some() {
            self.bus.host_id = other.bus.host_id;
        }
        if other.bus.reply_id.is_some() {
            self.bus.reply_id = other.bus.reply_id;
        }
        if other.bus.station.is_some() {
            self.bus.station = other.bus.station;
        }

        if other.timing.minimum_timeout_ms.is_some() {
            self.timing.minimum_timeout_ms = other.timing.minimum_timeout_ms;
        }
        if other.timing.connect_retries.is_some() {
            self.timing.connect_retries = other.timing.connect_retries;
        }
        if other.timing.settle_ms.is_some() {
            self.timing.settle_ms = other.timing.settle_ms;
        }

        if other.unlock.key.is_some() {
            self.unlock.key = other.unlock.key;
        }

        if other.sim.memory_size.is_some() {
            self.sim.memory_size = other.sim.memory_size;
        }
    }

    /// Handler settings for this configuration.
    pub fn handler_config(&self) -> HandlerConfig {
        let defaults = HandlerConfig::default();
        HandlerConfig::new(
            self.bus.host_id.unwrap_or(defaults.host_id),
            self.bus.reply_id.unwrap_or(defaults.reply_id),
        )
        .with_minimum_timeout(Duration::from_millis(
            self.timing
                .minimum_timeout_ms
                .unwrap_or(DEFAULT_MINIMUM_TIMEOUT_MS),
        ))
    }

    /// Connect retry policy for this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(retries) = self.timing.connect_retries {
            policy = policy.with_connect_retries(retries);
        }
        if let Some(settle) = self.timing.settle_ms {
            policy = policy.with_settle(Duration::from_millis(settle));
        }
        policy
    }

    /// Unlock secret for this configuration.
    pub fn password(&self) -> Password {
        match self.unlock.key {
            None | Some(Password::DSP_FLASH_KEY) => Password::DspFlash,
            Some(key) => Password::Custom(key),
        }
    }
}
