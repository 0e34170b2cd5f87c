// src/config.rs

//! Runtime configuration for `kmsflip`.
//!
//! Everything has a default, so an absent or partial JSON file is fine. The
//! file path comes from `KMSFLIP_CONFIG`; `KMSFLIP_CARD` overrides the card
//! index after the file is read.

use crate::kms::binder::Settle;
use crate::render::canvas::{Painter, Rgb, SolidFill, XorPattern};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "KMSFLIP_CONFIG";
pub const CARD_ENV: &str = "KMSFLIP_CARD";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("KMSFLIP_CARD={value:?} is not a card index")]
    InvalidCard { value: String },
}

// --- Top-Level Configuration Structure ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub sync: SyncConfig,
    pub render: RenderConfig,
}

// --- Device Configuration ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Opens `/dev/dri/card{card_index}`.
    pub card_index: u32,
    /// Fallback pause after the initial mode-set when the CRTC cannot report
    /// a vblank.
    pub settle_delay_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            card_index: 0,
            settle_delay_ms: 100,
        }
    }
}

// --- Synchronisation Configuration ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    #[default]
    Vblank,
    PageFlip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
    /// How long a page flip may stay unconfirmed before the wait fails.
    pub flip_timeout_ms: u64,
    /// How often the event listener wakes to check whether it should stop.
    pub event_poll_interval_ms: u64,
    /// Ask for tearing flips when the device supports them.
    pub async_flip: bool,
    /// Present without vblank when the vblank wait fails.
    pub allow_unsynchronized: bool,
    /// A render loop gives up after this many sync failures in a row.
    pub max_consecutive_failures: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            strategy: SyncStrategy::Vblank,
            flip_timeout_ms: 1000,
            event_poll_interval_ms: 100,
            async_flip: false,
            allow_unsynchronized: false,
            max_consecutive_failures: 10,
        }
    }
}

// --- Render Configuration ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pattern {
    #[default]
    Xor,
    Solid { red: u8, green: u8, blue: u8 },
}

impl Pattern {
    pub fn painter(&self) -> Box<dyn Painter + Send> {
        match *self {
            Pattern::Xor => Box::new(XorPattern),
            Pattern::Solid { red, green, blue } => Box::new(SolidFill(Rgb::new(red, green, blue))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub pattern: Pattern,
    /// Stop each output after this many frames; run until interrupted if unset.
    pub max_frames: Option<u64>,
}

impl Config {
    pub fn from_json(text: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads `path` (defaults if it does not exist) and applies a card override.
    pub fn load_from(path: Option<&Path>, card: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            None => Config::default(),
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => {
                    info!("Loaded configuration from {}", path.display());
                    Self::from_json(&text, path)?
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Config file {} not found; using defaults", path.display());
                    Config::default()
                }
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            },
        };
        if let Some(value) = card {
            config.device.card_index =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidCard {
                        value: value.to_string(),
                    })?;
        }
        Ok(config)
    }

    /// Loads using `KMSFLIP_CONFIG` and `KMSFLIP_CARD`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let card = std::env::var(CARD_ENV).ok();
        Self::load_from(path.as_deref(), card.as_deref())
    }

    /// Vblank-driven runs settle on a vblank; page-flip runs only sleep.
    pub fn settle(&self) -> Settle {
        let delay = Duration::from_millis(self.device.settle_delay_ms);
        match self.sync.strategy {
            SyncStrategy::Vblank => Settle::Vblank(delay),
            SyncStrategy::PageFlip => Settle::Delay(delay),
        }
    }

    pub fn flip_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.flip_timeout_ms)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync.event_poll_interval_ms.max(1))
    }
}
