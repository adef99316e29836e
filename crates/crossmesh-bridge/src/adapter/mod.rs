//! Transport adapter boundary
//!
//! This module defines the seams between the bridge and the two radio
//! libraries:
//!
//! - [`meshtastic::MeshtasticAdapter`] - decoded packets, resolved numeric
//!   identities, queryable node registry
//! - [`meshcore::MeshCoreAdapter`] - raw contact events, key-fragment
//!   identity, optionally empty contact list
//!
//! Both adapters produce the one fixed boundary shape, [`RawPacketEvent`],
//! and deliver it through the one fixed callback type, [`PacketCallback`].
//! Closures with other arities do not typecheck against the adapter API,
//! which is the point.

pub mod meshcore;
pub mod meshtastic;

pub use meshcore::{ContactBook, MeshCoreAdapter, MeshCoreContact};
pub use meshtastic::{MeshtasticAdapter, NodeRegistry, RegistryEntry};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crossmesh_core::{NodeId, Transport};

use crate::error::Result;

/// The single callback interface type adapters invoke per received packet.
pub type PacketCallback = Arc<dyn Fn(RawPacketEvent) + Send + Sync>;

/// The one explicit struct crossing the adapter boundary.
///
/// Adapters normalize whatever their library hands them into this shape;
/// nothing else crosses the seam.
#[derive(Debug, Clone)]
pub struct RawPacketEvent {
    /// Transport the event arrived on
    pub transport: Transport,
    /// Sender identity when the library resolved one
    pub from_id: Option<u32>,
    /// Destination address as the library reported it
    pub to_id: u32,
    /// Raw wire port code
    pub port_code: u32,
    /// Undecoded payload bytes
    pub payload: Bytes,
    /// Channel index
    pub channel: u8,
    /// Sender public-key fragment when the library supplied one
    pub public_key_fragment: Option<Vec<u8>>,
    /// Receive timestamp
    pub rx_time: DateTime<Utc>,
}

/// Trait both radio adapters implement.
///
/// The `send_text` surface is identical on both sides so the reply sender
/// stays adapter-agnostic.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Which transport this adapter drives
    fn transport(&self) -> Transport;

    /// Adapter name (for logging)
    fn name(&self) -> &str;

    /// Connect to the radio
    async fn connect(&self) -> Result<()>;

    /// Disconnect from the radio
    async fn disconnect(&self) -> Result<()>;

    /// Check if currently connected
    fn is_connected(&self) -> bool;

    /// Register the packet callback. Replaces any previous callback.
    fn subscribe(&self, callback: PacketCallback);

    /// Transmit a text message.
    ///
    /// `destination` may be [`NodeId::BROADCAST`] for channel traffic.
    async fn send_text(&self, text: &str, destination: NodeId, channel_index: u8) -> Result<()>;
}

/// Byte-level device link underneath an adapter (serial port, TCP socket).
///
/// Reconnecting a link never clears any adapter- or bridge-level table;
/// those are keyed by node identity, not by connection object.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Open the link
    async fn connect(&mut self) -> Result<()>;

    /// Close the link
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if the link is open
    fn is_connected(&self) -> bool;

    /// Read one frame. `None` means no complete frame is available yet.
    async fn read_frame(&mut self) -> Result<Option<Bytes>>;

    /// Write one frame
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Link name (for logging)
    fn name(&self) -> &str;
}

/// A directory entry for a node known to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Display name the transport knows the node by
    pub display_name: String,
    /// Public key (full or fragment)
    pub public_key: Vec<u8>,
}

/// A transport's own node directory, queried during identity resolution.
///
/// Meshtastic backs this with its synchronous node registry; MeshCore with
/// its contact list plus asynchronous directory query. Either may come up
/// empty — a freshly paired MeshCore device has no contacts at all.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Look up a node by public-key fragment.
    async fn lookup(&self, fragment: &[u8]) -> Option<DirectoryEntry>;
}

/// Connection state for adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection lost, may reconnect
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
