//! Configuration types for the dual-transport bridge
//!
//! One immutable configuration value is constructed at startup and passed by
//! reference to every component that needs it; there is no runtime-mutable
//! "dual-mode" flag anywhere.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crossmesh_core::Transport;

use crate::error::{BridgeError, Result};

/// Maximum payload size for LoRa packets
pub const LORA_MAX_PAYLOAD: usize = 237;

/// Default baud rate for serial-attached radios
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default dedupe window for cross-transport broadcast echoes
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Default timeout for pending route-discovery requests
pub const DEFAULT_TRACEROUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Main configuration for the crossmesh bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossmeshConfig {
    /// Meshtastic transport settings
    #[serde(default = "TransportConfig::default_meshtastic")]
    pub meshtastic: TransportConfig,

    /// MeshCore transport settings
    #[serde(default = "TransportConfig::default_meshcore")]
    pub meshcore: TransportConfig,

    /// Channel key configuration
    #[serde(default)]
    pub channels: ChannelKeyConfig,

    /// Bridge behavior settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Identity cache persistence settings
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Default for CrossmeshConfig {
    fn default() -> Self {
        Self {
            meshtastic: TransportConfig::default_meshtastic(),
            meshcore: TransportConfig::default_meshcore(),
            channels: ChannelKeyConfig::default(),
            bridge: BridgeConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl CrossmeshConfig {
    /// Validate the configuration.
    ///
    /// Both transports pointed at one physical device is fatal at startup:
    /// the process refuses to start rather than race two read loops on the
    /// same serial port.
    pub fn validate(&self) -> Result<()> {
        if self.meshtastic.enabled
            && self.meshcore.enabled
            && self.meshtastic.device == self.meshcore.device
        {
            return Err(BridgeError::ConfigurationConflict {
                device: self.meshtastic.device.display().to_string(),
            });
        }

        if !self.meshtastic.enabled && !self.meshcore.enabled {
            return Err(BridgeError::InvalidConfig(
                "at least one transport must be enabled".to_string(),
            ));
        }

        let default_enabled = match self.bridge.default_reply_transport {
            Transport::Meshtastic => self.meshtastic.enabled,
            Transport::MeshCore => self.meshcore.enabled,
        };
        if !default_enabled {
            return Err(BridgeError::InvalidConfig(format!(
                "default reply transport {} is not enabled",
                self.bridge.default_reply_transport
            )));
        }

        for key in &self.channels.keys {
            key.decode()?;
        }

        Ok(())
    }
}

/// Settings for one radio transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Whether this transport is active
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Device path (e.g. /dev/ttyUSB0) or host:port for network-attached radios
    pub device: PathBuf,

    /// Baud rate for serial devices
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Channel index used when none is specified
    #[serde(default)]
    pub default_channel: u8,
}

fn default_enabled() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl TransportConfig {
    fn default_meshtastic() -> Self {
        Self {
            enabled: true,
            device: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: DEFAULT_BAUD_RATE,
            default_channel: 0,
        }
    }

    fn default_meshcore() -> Self {
        Self {
            enabled: true,
            device: PathBuf::from("/dev/ttyACM0"),
            baud_rate: DEFAULT_BAUD_RATE,
            default_channel: 0,
        }
    }
}

/// A named 32-byte channel key, hex-encoded in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedChannelKey {
    /// Human-readable channel name
    pub name: String,
    /// 64 hex characters (32 bytes)
    pub key_hex: String,
}

impl NamedChannelKey {
    /// Decode the hex key, validating its length.
    pub fn decode(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.key_hex).map_err(|e| {
            BridgeError::InvalidConfig(format!("channel key '{}': {}", self.name, e))
        })?;
        bytes.try_into().map_err(|_| {
            BridgeError::InvalidConfig(format!(
                "channel key '{}' must be 32 bytes",
                self.name
            ))
        })
    }
}

/// Locally configured channel keys
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelKeyConfig {
    /// All channel keys known to this node
    #[serde(default)]
    pub keys: Vec<NamedChannelKey>,
}

/// Bridge behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// How long a self-sent broadcast fingerprint suppresses echoes
    #[serde(with = "humantime_serde", default = "default_dedup_window")]
    pub dedup_window: Duration,

    /// Maximum fingerprints retained in the dedupe window
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Transport used for replies to nodes never seen inbound
    #[serde(default = "default_reply_transport")]
    pub default_reply_transport: Transport,

    /// Bounded handoff queue between packet ingestion and command handling
    #[serde(default = "default_worker_queue_size")]
    pub worker_queue_size: usize,

    /// Timeout for pending route-discovery requests
    #[serde(with = "humantime_serde", default = "default_traceroute_timeout")]
    pub traceroute_timeout: Duration,
}

fn default_dedup_window() -> Duration {
    DEFAULT_DEDUP_WINDOW
}

fn default_dedup_capacity() -> usize {
    512
}

fn default_reply_transport() -> Transport {
    Transport::Meshtastic
}

fn default_worker_queue_size() -> usize {
    64
}

fn default_traceroute_timeout() -> Duration {
    DEFAULT_TRACEROUTE_TIMEOUT
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dedup_window: DEFAULT_DEDUP_WINDOW,
            dedup_capacity: 512,
            default_reply_transport: Transport::Meshtastic,
            worker_queue_size: 64,
            traceroute_timeout: DEFAULT_TRACEROUTE_TIMEOUT,
        }
    }
}

/// Identity cache persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Path to the persisted identity table
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("identity-cache.json")
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
        }
    }
}

/// Builder for CrossmeshConfig
#[derive(Debug, Default)]
pub struct CrossmeshConfigBuilder {
    config: CrossmeshConfig,
}

impl CrossmeshConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Meshtastic device path
    pub fn meshtastic_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.config.meshtastic.device = device.into();
        self
    }

    /// Set the MeshCore device path
    pub fn meshcore_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.config.meshcore.device = device.into();
        self
    }

    /// Enable or disable the Meshtastic transport
    pub fn meshtastic_enabled(mut self, enabled: bool) -> Self {
        self.config.meshtastic.enabled = enabled;
        self
    }

    /// Enable or disable the MeshCore transport
    pub fn meshcore_enabled(mut self, enabled: bool) -> Self {
        self.config.meshcore.enabled = enabled;
        self
    }

    /// Set the dedupe window duration
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.config.bridge.dedup_window = window;
        self
    }

    /// Set the default reply transport
    pub fn default_reply_transport(mut self, transport: Transport) -> Self {
        self.config.bridge.default_reply_transport = transport;
        self
    }

    /// Add a channel key (hex-encoded 32 bytes)
    pub fn channel_key(mut self, name: impl Into<String>, key_hex: impl Into<String>) -> Self {
        self.config.channels.keys.push(NamedChannelKey {
            name: name.into(),
            key_hex: key_hex.into(),
        });
        self
    }

    /// Set the identity cache path
    pub fn identity_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.identity.cache_path = path.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> CrossmeshConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
