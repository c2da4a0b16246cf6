//! YAML poll configuration.
//!
//! A configuration lists the buses to poll, each with its port, line settings
//! and device roster:
//!
//! ```yaml
//! mode:
//!   kind: bulk
//!   channels: 8
//! interval_ms: 1000
//! buses:
//!   - port: /dev/ttyUSB0
//!     baud: 9600
//!     timeout_ms: 500
//!     settle_ms: 50
//!     devices: ["001", "002"]
//!   - port: /dev/ttyUSB1
//!     devices: ["DS00000000001234"]
//! ```
//!
//! Every bus becomes one lane. Devices on the same bus are polled strictly in
//! the listed order; separate buses are polled in parallel.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use digisens_bus::{
    Bus, BusConfig, BusPlan, DeviceSession, Lane, PollMode, Precision, SessionConfig, Transport,
    TransportError, DEFAULT_CHANNELS,
};
use digisens_protocol::{Baudrate, DeviceAddress, DEFAULT_BAUD_RATE};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Default per-exchange timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 500;
/// Default settle delay between exchanges.
pub const DEFAULT_SETTLE_MS: u64 = 50;
/// Default pause between cycles.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// YAML syntax or shape error.
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The configuration parsed but cannot be polled.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A transport listed in the configuration could not be opened.
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: TransportError,
    },
}

/// A device id from the roster. The address mode follows from its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry(pub DeviceAddress);

impl<'de> Deserialize<'de> for DeviceEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DeviceAddress::from_str(&s)
            .map(DeviceEntry)
            .map_err(serde::de::Error::custom)
    }
}

impl Serialize for DeviceEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.0.id())
    }
}

impl fmt::Display for DeviceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// How each device is read per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollModeConfig {
    /// One `gl` per device.
    Bulk {
        #[serde(default = "default_channels")]
        channels: usize,
    },
    /// One `gw` (or `gd` with `high_precision`) per channel.
    PerChannel {
        channels: u8,
        #[serde(default)]
        high_precision: bool,
    },
}

impl Default for PollModeConfig {
    fn default() -> Self {
        PollModeConfig::Bulk {
            channels: DEFAULT_CHANNELS,
        }
    }
}

impl From<PollModeConfig> for PollMode {
    fn from(config: PollModeConfig) -> Self {
        match config {
            PollModeConfig::Bulk { channels } => PollMode::Bulk {
                expected_channels: channels,
            },
            PollModeConfig::PerChannel {
                channels,
                high_precision,
            } => PollMode::PerChannel {
                channels,
                precision: if high_precision {
                    Precision::High
                } else {
                    Precision::Standard
                },
            },
        }
    }
}

fn default_channels() -> usize {
    DEFAULT_CHANNELS
}

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_settle_ms() -> u64 {
    DEFAULT_SETTLE_MS
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

/// One physical bus and its roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusEntry {
    /// Serial port path (or a label when simulating).
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default)]
    pub strict_checksum: bool,
    /// Devices in polling order.
    pub devices: Vec<DeviceEntry>,
}

impl BusEntry {
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            settle_delay: Duration::from_millis(self.settle_ms),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            strict_checksum: self.strict_checksum,
        }
    }

    pub fn sessions(&self) -> Vec<DeviceSession> {
        let config = self.session_config();
        self.devices
            .iter()
            .map(|d| DeviceSession::new(d.0.clone(), config))
            .collect()
    }
}

/// Top-level poll configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollConfig {
    #[serde(default)]
    pub mode: PollModeConfig,
    /// Pause between cycles.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Stop after this many cycles; run until interrupted when absent.
    #[serde(default)]
    pub cycles: Option<u64>,
    pub buses: Vec<BusEntry>,
}

impl PollConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: PollConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn poll_mode(&self) -> PollMode {
        self.mode.into()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Check everything that would otherwise fail mid-poll.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buses.is_empty() {
            return Err(ConfigError::Invalid("no buses configured".into()));
        }

        match self.mode {
            PollModeConfig::Bulk { channels: 0 } | PollModeConfig::PerChannel { channels: 0, .. } => {
                return Err(ConfigError::Invalid("channel count must be at least 1".into()));
            }
            PollModeConfig::PerChannel {
                channels,
                high_precision,
            } => {
                // gd carries a one-digit channel, gw a two-digit one.
                let limit = if high_precision { 10 } else { 100 };
                if channels > limit {
                    return Err(ConfigError::Invalid(format!(
                        "per-channel reads address at most {} channels, {} configured",
                        limit, channels
                    )));
                }
            }
            PollModeConfig::Bulk { .. } => {}
        }

        let mut ports: Vec<&str> = Vec::new();
        for bus in &self.buses {
            if ports.contains(&bus.port.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "port {} listed more than once",
                    bus.port
                )));
            }
            ports.push(&bus.port);

            if bus.devices.is_empty() {
                return Err(ConfigError::Invalid(format!("{} has no devices", bus.port)));
            }
            if Baudrate::try_from(bus.baud).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{}: unsupported baud rate {}",
                    bus.port, bus.baud
                )));
            }
            if bus.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!("{}: timeout_ms must be > 0", bus.port)));
            }

            for (i, device) in bus.devices.iter().enumerate() {
                if bus.devices[..i].contains(device) {
                    return Err(ConfigError::Invalid(format!(
                        "{}: device {} listed more than once",
                        bus.port, device
                    )));
                }
            }
        }
        Ok(())
    }

    /// Open every bus with `open` and build the plan.
    ///
    /// A single bus yields a shared plan; several yield independent lanes.
    pub fn into_plan<T, F>(&self, mut open: F) -> Result<BusPlan<T>, ConfigError>
    where
        T: Transport,
        F: FnMut(&BusEntry) -> Result<T, TransportError>,
    {
        self.validate()?;

        let mut lanes = Vec::with_capacity(self.buses.len());
        for entry in &self.buses {
            let transport = open(entry).map_err(|source| ConfigError::Open {
                port: entry.port.clone(),
                source,
            })?;
            lanes.push(Lane::new(
                Bus::new(transport, entry.bus_config()),
                entry.sessions(),
            ));
        }

        if lanes.len() == 1 {
            if let Some(lane) = lanes.pop() {
                return Ok(BusPlan::Shared(lane));
            }
        }
        Ok(BusPlan::lanes(lanes))
    }
}
