use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::INGRESS_PATH;

/// Target dimensions for a derived stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for FrameSize {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

/// Frame source selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Generated test pattern, ends after `frames` frames and loops
    Synthetic {
        #[serde(default = "default_synthetic_width")]
        width: u32,
        #[serde(default = "default_synthetic_height")]
        height: u32,
        #[serde(default = "default_synthetic_frames")]
        frames: u32,
    },
    /// Every png/jpg file of a directory, played in file-name order
    ImageDir { path: PathBuf },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic {
            width: default_synthetic_width(),
            height: default_synthetic_height(),
            frames: default_synthetic_frames(),
        }
    }
}

fn default_synthetic_width() -> u32 {
    1280
}

fn default_synthetic_height() -> u32 {
    720
}

fn default_synthetic_frames() -> u32 {
    300
}

fn default_capture_rate() -> f64 {
    30.0
}

fn default_ui_rate() -> f64 {
    15.0
}

fn default_queue_rate() -> f64 {
    5.0
}

fn default_jpeg_quality() -> u8 {
    95
}

fn default_queue_poll_interval_ms() -> u64 {
    100
}

fn default_source_check_interval_ms() -> u64 {
    10_000
}

fn default_terminate_retries() -> u32 {
    3
}

fn default_terminate_timeout_ms() -> u64 {
    1_000
}

fn default_listen_addr() -> String {
    "0.0.0.0:7001".to_string()
}

fn default_liveness_interval_secs() -> u64 {
    60
}

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Frames read from the source per second
    #[serde(default = "default_capture_rate")]
    pub capture_rate: f64,
    /// Frames sampled into the live view per second
    #[serde(default = "default_ui_rate")]
    pub ui_rate: f64,
    /// Frames sampled into the work queue per second
    #[serde(default = "default_queue_rate")]
    pub queue_rate: f64,
    #[serde(default)]
    pub ui_frame_size: FrameSize,
    #[serde(default)]
    pub queue_frame_size: FrameSize,
    /// JPEG quality of live view frames (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,
    /// Maximum pending processing requests (unbounded when absent)
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// How often the producer checks that the source is still open
    #[serde(default = "default_source_check_interval_ms")]
    pub source_check_interval_ms: u64,
    /// Extra termination attempts after the first one fails
    #[serde(default = "default_terminate_retries")]
    pub terminate_retries: u32,
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
    /// Address the live view hub listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Hub ingress endpoint the producer publishes to. Derived from
    /// `listen_addr` when absent.
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    #[serde(default)]
    pub source: SourceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_rate: default_capture_rate(),
            ui_rate: default_ui_rate(),
            queue_rate: default_queue_rate(),
            ui_frame_size: FrameSize::default(),
            queue_frame_size: FrameSize::default(),
            jpeg_quality: default_jpeg_quality(),
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
            queue_capacity: None,
            source_check_interval_ms: default_source_check_interval_ms(),
            terminate_retries: default_terminate_retries(),
            terminate_timeout_ms: default_terminate_timeout_ms(),
            listen_addr: default_listen_addr(),
            relay_url: None,
            liveness_interval_secs: default_liveness_interval_secs(),
            source: SourceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an all-default map
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, rate) in [
            ("capture_rate", self.capture_rate),
            ("ui_rate", self.ui_rate),
            ("queue_rate", self.queue_rate),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be a positive number, got {}",
                    name, rate
                )));
            }
        }

        for (name, size) in [
            ("ui_frame_size", self.ui_frame_size),
            ("queue_frame_size", self.queue_frame_size),
        ] {
            if size.width == 0 || size.height == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be non-zero, got {}x{}",
                    name, size.width, size.height
                )));
            }
        }

        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::ValidationError(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.jpeg_quality
            )));
        }

        if self.queue_poll_interval_ms == 0
            || self.source_check_interval_ms == 0
            || self.terminate_timeout_ms == 0
            || self.liveness_interval_secs == 0
        {
            return Err(ConfigError::ValidationError(
                "intervals and timeouts must be non-zero".to_string(),
            ));
        }

        if let Some(url) = &self.relay_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::ValidationError(format!(
                    "relay_url must be a ws:// or wss:// URL, got {}",
                    url
                )));
            }
        }

        if self.queue_capacity == Some(0) {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be at least 1 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Where the producer dials the hub ingress.
    ///
    /// Without an explicit `relay_url` this is the local hub on the port of
    /// `listen_addr`; a wildcard listen address is reached over loopback.
    pub fn relay_url(&self) -> String {
        if let Some(url) = &self.relay_url {
            return url.clone();
        }
        match self.listen_addr.parse::<SocketAddr>() {
            Ok(SocketAddr::V4(addr)) if addr.ip().is_unspecified() => {
                format!("ws://127.0.0.1:{}{}", addr.port(), INGRESS_PATH)
            }
            Ok(SocketAddr::V6(addr)) if addr.ip().is_unspecified() => {
                format!("ws://[::1]:{}{}", addr.port(), INGRESS_PATH)
            }
            Ok(addr) => format!("ws://{}{}", addr, INGRESS_PATH),
            Err(_) => format!("ws://{}{}", self.listen_addr, INGRESS_PATH),
        }
    }

    pub fn capture_interval(&self) -> Duration {
        rate_to_interval(self.capture_rate)
    }

    pub fn ui_interval(&self) -> Duration {
        rate_to_interval(self.ui_rate)
    }

    pub fn queue_interval(&self) -> Duration {
        rate_to_interval(self.queue_rate)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn source_check_interval(&self) -> Duration {
        Duration::from_millis(self.source_check_interval_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }
}

fn rate_to_interval(rate: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
