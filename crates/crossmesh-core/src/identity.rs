//! Node identity for the dual-transport mesh
//!
//! Both radio networks ultimately identify a device by its public key, but
//! only the Meshtastic side hands us a resolved numeric address. The bridge
//! therefore treats the first four bytes of the 32-byte public key,
//! interpreted big-endian, as the canonical 32-bit node identity. A MeshCore
//! contact that exposes nothing but a key fragment still resolves to the same
//! address a Meshtastic node derives for itself, which is what makes replies
//! routable across the two meshes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::packet::Transport;

/// Canonical 32-bit node identity.
///
/// Invariant: equal to the first 4 bytes of the device's 32-byte public key,
/// big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Broadcast sentinel address ("everyone").
    pub const BROADCAST: NodeId = NodeId(0xFFFF_FFFF);

    /// Minimum key-fragment length that still pins down the identity.
    pub const MIN_FRAGMENT_LEN: usize = 4;

    /// Derive a node identity from a public-key fragment.
    ///
    /// Returns `None` when the fragment is shorter than 4 bytes; any longer
    /// fragment (including the full 32-byte key) yields the same identity.
    pub fn from_key_fragment(fragment: &[u8]) -> Option<NodeId> {
        if fragment.len() < Self::MIN_FRAGMENT_LEN {
            return None;
        }
        Some(NodeId(u32::from_be_bytes([
            fragment[0],
            fragment[1],
            fragment[2],
            fragment[3],
        ])))
    }

    /// Whether this is the broadcast sentinel.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Raw u32 value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Synthesized fallback display name, `Node-<hex>`.
    pub fn synthesized_name(&self) -> String {
        format!("Node-{:08x}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId(0x{:08x})", self.0)
    }
}

/// How an identity record entered the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityOrigin {
    /// Synced from a transport's own node registry / directory.
    RegistrySynced,
    /// Derived locally from the leading bytes of a public key.
    DerivedFromKey,
    /// Entered by an operator.
    Manual,
}

/// A known device, keyed by its canonical node identity.
///
/// Records are created on first sighting, updated on every later sighting,
/// and never auto-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Canonical node identity (unique key).
    pub node_id: NodeId,
    /// Public-key fragment this identity was observed with (may be the
    /// full 32-byte key, may be as short as 4 bytes).
    #[serde(with = "hex_bytes")]
    pub public_key_fragment: Vec<u8>,
    /// Human-readable name; synthesized when the transport supplied none.
    pub display_name: String,
    /// Provenance of this record.
    pub origin: IdentityOrigin,
    /// Transport this node was last heard on.
    pub last_seen_transport: Transport,
    /// Timestamp of the most recent sighting.
    pub last_seen: DateTime<Utc>,
}

impl IdentityRecord {
    /// Create a record for a freshly sighted node.
    pub fn new(
        node_id: NodeId,
        public_key_fragment: Vec<u8>,
        display_name: Option<String>,
        origin: IdentityOrigin,
        transport: Transport,
    ) -> Self {
        Self {
            node_id,
            public_key_fragment,
            display_name: display_name.unwrap_or_else(|| node_id.synthesized_name()),
            origin,
            last_seen_transport: transport,
            last_seen: Utc::now(),
        }
    }

    /// Record a later sighting of the same node.
    pub fn touch(&mut self, transport: Transport) {
        self.last_seen_transport = transport;
        self.last_seen = Utc::now();
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
