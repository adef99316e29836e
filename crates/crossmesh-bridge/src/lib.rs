//! Dual-transport LoRa mesh bridge
//!
//! This crate lets one bot process sit on two incompatible LoRa mesh
//! networks at once - a Meshtastic mesh and a MeshCore mesh - receive
//! commands from either, and route each reply back over the transport the
//! sender was last heard on.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Bridge                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────┐    ┌───────────────┐   ┌─────────────┐   │
//! │  │ Meshtastic     │───►│ ingest queue  │──►│ per-packet  │   │
//! │  │ adapter        │    │ (bounded)     │   │ pipeline    │   │
//! │  └────────────────┘    └───────────────┘   │             │   │
//! │  ┌────────────────┐           ▲            │ identity    │   │
//! │  │ MeshCore       │───────────┘            │ decrypt     │   │
//! │  │ adapter        │                        │ dedupe      │   │
//! │  └────────────────┘                        │ classify    │   │
//! │          ▲                                 └──────┬──────┘   │
//! │          │            ┌───────────────┐          │           │
//! │  ┌───────┴──────┐     │ dispatch queue│◄─────────┘           │
//! │  │ ReplySender  │◄────│ CommandRouter │                      │
//! │  └──────────────┘     └───────────────┘                      │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # The two transports
//!
//! The Meshtastic side hands over decoded packets with resolved numeric
//! sender ids and keeps a queryable node registry. The MeshCore side hands
//! over raw contact events where the sender is a public-key fragment and
//! the contact list may be empty. Both are normalized into one boundary
//! shape, [`RawPacketEvent`](adapter::RawPacketEvent), before the bridge
//! sees them.
//!
//! The glue that makes cross-transport replies work: a node's canonical
//! address is the big-endian first 4 bytes of its public key, which is
//! exactly the id a Meshtastic node computes for itself. A MeshCore key
//! fragment therefore derives the same [`NodeId`] without any directory
//! round trip.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use crossmesh_bridge::{Bridge, CommandRouter, CrossmeshConfigBuilder};
//! use crossmesh_core::NodeId;
//!
//! let config = CrossmeshConfigBuilder::new()
//!     .meshtastic_device("/dev/ttyUSB0")
//!     .meshcore_device("/dev/ttyACM0")
//!     .channel_key("Primary", key_hex)
//!     .build();
//!
//! let (mut bridge, handle) = Bridge::new(config, own_id, router)?;
//! bridge.attach(meshtastic_adapter, registry, 0);
//! bridge.attach(meshcore_adapter, contacts, 0);
//!
//! let replies = bridge.reply_sender();
//! tokio::spawn(bridge.run());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod crypto;
pub mod dedupe;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod reply;

pub use adapter::{
    ConnectionState, ContactBook, DeviceLink, Directory, DirectoryEntry, MeshCoreAdapter,
    MeshCoreContact, MeshtasticAdapter, NodeRegistry, PacketCallback, RawPacketEvent,
    RegistryEntry, TransportAdapter,
};
pub use bridge::{Bridge, BridgeCommand, BridgeHandle, BridgeStats, CommandRouter, PacketClass};
pub use config::{
    BridgeConfig, ChannelKeyConfig, CrossmeshConfig, CrossmeshConfigBuilder, IdentityConfig,
    NamedChannelKey, TransportConfig,
};
pub use crypto::{looks_encrypted, ChannelCrypto};
pub use dedupe::{DedupeStats, DedupeWindow, Fingerprint};
pub use discovery::RouteDiscovery;
pub use error::{BridgeError, Result};
pub use identity::{IdentityResolver, IdentityStore};
pub use reply::{AdapterSet, ReplyRoutes, ReplySender, SendError};

pub use config::{DEFAULT_BAUD_RATE, DEFAULT_DEDUP_WINDOW, LORA_MAX_PAYLOAD};

// The core identity and packet types, re-exported so consumers rarely need
// a direct crossmesh-core dependency
pub use crossmesh_core::{
    CanonicalPacket, IdentityOrigin, IdentityRecord, NodeId, Payload, PortKind, Transport,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(LORA_MAX_PAYLOAD, 237);
        assert_eq!(DEFAULT_BAUD_RATE, 115200);
        assert_eq!(NodeId::BROADCAST, NodeId(0xFFFF_FFFF));
    }
}
