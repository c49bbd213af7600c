//! Console configuration, read from a TOML file
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::delivery::{DeliveryTimings, MotorOptions};
use crate::schedule::SequencerTimings;
use crate::serial::SerialLinkConfig;
use crate::units::MAX_DURATION;

pub const DEFAULT_CONFIG_FILE: &str = "lab-console.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn default_resend_ms() -> u64 {
    2025
}

fn default_failure_ms() -> u64 {
    11_000
}

fn default_free_poll_ms() -> u64 {
    100
}

fn default_progress_tick_ms() -> u64 {
    100
}

/// Timer periods of the delivery machines and sequencers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_resend_ms")]
    pub resend_ms: u64,
    #[serde(default = "default_failure_ms")]
    pub failure_ms: u64,
    #[serde(default = "default_free_poll_ms")]
    pub free_poll_ms: u64,
    #[serde(default = "default_progress_tick_ms")]
    pub progress_tick_ms: u64,
    /// Keep unterminated frames across reads instead of dropping them
    #[serde(default)]
    pub buffer_partial_frames: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            resend_ms: default_resend_ms(),
            failure_ms: default_failure_ms(),
            free_poll_ms: default_free_poll_ms(),
            progress_tick_ms: default_progress_tick_ms(),
            buffer_partial_frames: false,
        }
    }
}

impl TimingConfig {
    pub fn delivery(&self) -> DeliveryTimings {
        DeliveryTimings {
            resend: Duration::from_millis(self.resend_ms),
            failure: Duration::from_millis(self.failure_ms),
        }
    }

    pub fn sequencer(&self) -> SequencerTimings {
        SequencerTimings {
            free_poll: Duration::from_millis(self.free_poll_ms),
            progress_tick: Duration::from_millis(self.progress_tick_ms),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resend_ms == 0 || self.free_poll_ms == 0 || self.progress_tick_ms == 0 {
            return Err(ConfigError::Invalid("timer periods must be non-zero".into()));
        }
        let longest = u64::try_from(MAX_DURATION.as_millis()).unwrap_or(u64::MAX);
        let periods = [self.resend_ms, self.failure_ms, self.free_poll_ms, self.progress_tick_ms];
        if periods.iter().any(|&ms| ms > longest) {
            return Err(ConfigError::Invalid(format!("timer periods must not exceed {} ms", longest)));
        }
        if self.failure_ms <= self.resend_ms {
            return Err(ConfigError::Invalid(format!(
                "failure timeout ({} ms) must exceed the resend period ({} ms)",
                self.failure_ms, self.resend_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    /// Links opened at startup
    #[serde(default)]
    pub links: Vec<SerialLinkConfig>,
    /// Sent by the `options` command
    #[serde(default)]
    pub motor: MotorOptions,
}

impl ConsoleConfig {
    /// Read a config file; every field has a default
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut text = String::new();
        File::open(path.as_ref())?.read_to_string(&mut text)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: ConsoleConfig = toml::from_str(text)?;
        config.timing.validate()?;
        for link in &config.links {
            link.validate()
                .map_err(|e| ConfigError::Invalid(format!("link {}: {}", link.port, e)))?;
        }
        Ok(config)
    }

    /// Like [`read`](Self::read), but a missing file yields the defaults
    pub fn read_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::read(path.as_ref()) {
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.as_ref().display());
                Ok(Self::default())
            }
            other => other,
        }
    }
}
