//! Error types for bridge operations
//!
//! Two rules govern error flow here. Adapter errors are caught at the
//! adapter boundary and converted to a dropped event or a scheduled
//! reconnect; they never surface inside the bridge dispatch path. Per-packet
//! decode errors are caught per packet so one malformed frame cannot halt
//! subsequent ingestion.

use crossmesh_core::{NodeId, Transport};
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    // ===== Link/Interface Errors =====
    /// Device link not found
    #[error("Device link not found: {0}")]
    LinkNotFound(String),

    /// Device link open failed
    #[error("Failed to open device link {device}: {reason}")]
    LinkOpenFailed {
        /// Device path
        device: String,
        /// Failure reason
        reason: String,
    },

    /// Link read error
    #[error("Link read error: {0}")]
    ReadError(String),

    /// Link write error
    #[error("Link write error: {0}")]
    WriteError(String),

    /// Device link disconnected
    #[error("Device link disconnected")]
    Disconnected,

    /// Connection timeout
    #[error("Connection timeout after {duration_ms}ms")]
    ConnectionTimeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Frame/Protocol Errors =====
    /// Invalid frame format
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Message too large for the LoRa payload limit
    #[error("Message too large: {size} bytes exceeds LoRa maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual message size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    // ===== Identity Errors =====
    /// No contact or registry entry for this node on the sending transport
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Identity cache persistence failure
    #[error("Identity store error: {0}")]
    IdentityStore(String),

    // ===== Configuration Errors =====
    /// Two transports pointed at one physical device. Fatal at startup.
    #[error("Configuration conflict: both transports use device {device}")]
    ConfigurationConflict {
        /// The shared device path
        device: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No adapter registered for a transport
    #[error("No adapter registered for transport {0}")]
    NoAdapter(Transport),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelError(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Check if this error is a transient transport error.
    ///
    /// Transient errors are logged at low severity; the adapter reconnects
    /// on its own schedule and the bridge performs no retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionTimeout { .. }
                | BridgeError::Disconnected
                | BridgeError::ReadError(_)
                | BridgeError::WriteError(_)
        )
    }

    /// Check if this is a per-packet decode error (bad data from device)
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidFrame(_) | BridgeError::MessageTooLarge { .. }
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            BridgeError::LinkNotFound(_) => "LINK_NOT_FOUND",
            BridgeError::LinkOpenFailed { .. } => "LINK_OPEN_FAILED",
            BridgeError::ReadError(_) => "READ_ERROR",
            BridgeError::WriteError(_) => "WRITE_ERROR",
            BridgeError::Disconnected => "DISCONNECTED",
            BridgeError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            BridgeError::InvalidFrame(_) => "INVALID_FRAME",
            BridgeError::MessageTooLarge { .. } => "MESSAGE_TOO_LARGE",
            BridgeError::UnknownNode(_) => "UNKNOWN_NODE",
            BridgeError::IdentityStore(_) => "IDENTITY_STORE",
            BridgeError::ConfigurationConflict { .. } => "CONFIGURATION_CONFLICT",
            BridgeError::InvalidConfig(_) => "INVALID_CONFIG",
            BridgeError::NoAdapter(_) => "NO_ADAPTER",
            BridgeError::ChannelClosed => "CHANNEL_CLOSED",
            BridgeError::ChannelError(_) => "CHANNEL_ERROR",
            BridgeError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::InvalidFrame(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BridgeError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BridgeError::ChannelError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = BridgeError::LinkNotFound("/dev/ttyUSB0".to_string());
        assert_eq!(err.error_code(), "LINK_NOT_FOUND");

        let err = BridgeError::ConfigurationConflict {
            device: "/dev/ttyACM0".to_string(),
        };
        assert_eq!(err.error_code(), "CONFIGURATION_CONFLICT");
    }

    #[test]
    fn test_is_retriable() {
        assert!(BridgeError::Disconnected.is_retriable());
        assert!(BridgeError::ConnectionTimeout { duration_ms: 5000 }.is_retriable());
        assert!(!BridgeError::InvalidFrame("bad header".to_string()).is_retriable());
        assert!(!BridgeError::ConfigurationConflict {
            device: "/dev/ttyACM0".to_string()
        }
        .is_retriable());
    }

    #[test]
    fn test_is_frame_error() {
        assert!(BridgeError::InvalidFrame("short".to_string()).is_frame_error());
        assert!(BridgeError::MessageTooLarge { size: 300, max: 237 }.is_frame_error());
        assert!(!BridgeError::Disconnected.is_frame_error());
    }

    #[test]
    fn test_unknown_node_display() {
        let err = BridgeError::UnknownNode(NodeId(0x143bcd7f));
        assert!(err.to_string().contains("0x143bcd7f"));
    }
}
