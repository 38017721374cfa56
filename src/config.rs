use std::{collections::HashSet, net::SocketAddr, path::PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{modect::MotionDetectorConfig, person::PersonDetectorConfig};

fn default_web_base() -> String {
    "/".to_string()
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Config {
    pub prometheus_bind: Option<SocketAddr>,
    pub web_bind: SocketAddr,
    #[serde(default = "default_web_base")]
    pub web_base: String,
    pub event_dir: PathBuf,
    pub live_dir: PathBuf,
    pub devices: IndexMap<String, DeviceConfig>,
    #[serde(default)]
    pub motion: MotionDetectorConfig,
    // without a model every trigger is classified as plain motion
    pub person: Option<PersonDetectorConfig>,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    pub pushover: Option<PushoverConfig>,
}

fn default_sensitivity() -> f64 {
    0.5
}

fn default_active() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeviceConfig {
    pub token: String,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub alert_priority: Option<PushoverPriority>,
}

fn default_live_quality() -> u8 {
    75
}

fn default_event_quality() -> u8 {
    85
}

/// JPEG qualities used when persisting frames.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
pub struct SnapshotConfig {
    #[serde(default = "default_live_quality")]
    pub live_quality: u8,
    #[serde(default = "default_event_quality")]
    pub event_quality: u8,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            live_quality: default_live_quality(),
            event_quality: default_event_quality(),
        }
    }
}

fn default_pushover() -> Url {
    "https://api.pushover.net/1/messages.json".parse().unwrap()
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum PushoverPriority {
    Ignore = -3,
    Lowest = -2,
    Low = -1,
    #[default]
    Normal = 0,
    High = 1,
    Emergency = 2,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PushoverConfig {
    #[serde(default = "default_pushover")]
    pub url: Url,
    pub user_key: String,
    pub token: String,
    #[serde(default)]
    pub attach_snapshot: bool,
    #[serde(default)]
    pub priority: PushoverPriority,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("device '{0}' has an empty token")]
    EmptyToken(String),
    #[error("device '{0}' reuses the token of another device")]
    DuplicateToken(String),
    #[error("device '{0}' sensitivity {1} is outside [0, 1]")]
    Sensitivity(String, f64),
    #[error("motion blur_sigma must be positive, got {0}")]
    BlurSigma(f32),
    #[error("snapshot quality must be within 1..=100, got {0}")]
    Quality(u8),
}

impl Config {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut tokens = HashSet::new();
        for (name, device) in &self.devices {
            if device.token.is_empty() {
                return Err(ConfigError::EmptyToken(name.clone()));
            }
            if !tokens.insert(device.token.as_str()) {
                return Err(ConfigError::DuplicateToken(name.clone()));
            }
            if !(0.0..=1.0).contains(&device.sensitivity) {
                return Err(ConfigError::Sensitivity(name.clone(), device.sensitivity));
            }
        }
        if !(self.motion.blur_sigma > 0.0) {
            return Err(ConfigError::BlurSigma(self.motion.blur_sigma));
        }
        for quality in [self.snapshot.live_quality, self.snapshot.event_quality] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::Quality(quality));
            }
        }
        Ok(())
    }
}

lazy_static::lazy_static! {
    pub static ref CONFIG_PATH: PathBuf = {
        let var = std::env::var("WATCHPOST_CONFIG").unwrap_or_default();
        if var.is_empty() {
            "./config.yaml".parse().unwrap()
        } else {
            var.parse().expect("invalid config path")
        }
    };
    pub static ref CONFIG: Config = Config::load(&CONFIG_PATH).expect("failed to load config");
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r"
web_bind: 127.0.0.1:8080
event_dir: ./events
live_dir: ./live
";

    #[test]
    fn parses_defaults() {
        let config = Config::parse(&format!(
            "{BASE}devices:\n  porch:\n    token: abc\n"
        ))
        .unwrap();
        let porch = &config.devices["porch"];
        assert_eq!(porch.sensitivity, 0.5);
        assert!(porch.active);
        assert_eq!(config.web_base, "/");
        assert_eq!(config.motion.pixel_threshold, 25);
        assert_eq!(config.snapshot.live_quality, 75);
        assert_eq!(config.snapshot.event_quality, 85);
        assert!(config.person.is_none());
    }

    #[test]
    fn example_config_is_valid() {
        let config = Config::parse(include_str!("../config.example.yaml")).unwrap();
        assert_eq!(config.devices.len(), 3);
        assert!(!config.devices["attic"].active);
        assert!(config.person.is_none());
        assert!(config.pushover.is_some());
    }

    #[test]
    fn rejects_duplicate_tokens() {
        let err = Config::parse(&format!(
            "{BASE}devices:\n  a:\n    token: same\n  b:\n    token: same\n"
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateToken(name) if name == "b"));
    }

    #[test]
    fn rejects_out_of_range_sensitivity() {
        let err = Config::parse(&format!(
            "{BASE}devices:\n  a:\n    token: t\n    sensitivity: 1.5\n"
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Sensitivity(_, _)));
    }

    #[test]
    fn rejects_empty_token() {
        let err = Config::parse(&format!("{BASE}devices:\n  a:\n    token: ''\n")).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyToken(_)));
    }
}
