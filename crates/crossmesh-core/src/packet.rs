//! Canonical packet model
//!
//! Every event from either radio is normalized into a [`CanonicalPacket`]
//! before anything downstream sees it. The packet carries its origin
//! transport (immutable once set) so the reply path can route back out the
//! same physical link the request arrived on.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::identity::NodeId;

/// One independent physical radio link and its packet library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Transport whose library exposes decoded packets with resolved numeric
    /// identities and a queryable node registry.
    Meshtastic,
    /// Transport whose library exposes raw contact events; sender identity
    /// may be absent and must sometimes be derived from a key fragment.
    MeshCore,
}

impl Transport {
    /// The other transport.
    pub fn other(&self) -> Transport {
        match self {
            Transport::Meshtastic => Transport::MeshCore,
            Transport::MeshCore => Transport::Meshtastic,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Meshtastic => write!(f, "meshtastic"),
            Transport::MeshCore => write!(f, "meshcore"),
        }
    }
}

/// Classification of a packet's application payload.
///
/// Raw port codes follow the Meshtastic PortNum convention; MeshCore events
/// are mapped onto the same space by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// UTF-8 text message (commands live here).
    TextMessage,
    /// Position report.
    Position,
    /// Node info / user record.
    NodeInfo,
    /// Device telemetry.
    Telemetry,
    /// Route discovery request/response.
    TraceRoute,
    /// Anything we do not classify; raw port code retained.
    Unknown(u32),
}

impl PortKind {
    /// Raw wire port code for this kind.
    pub fn code(&self) -> u32 {
        match self {
            PortKind::TextMessage => 1,
            PortKind::Position => 3,
            PortKind::NodeInfo => 4,
            PortKind::Telemetry => 67,
            PortKind::TraceRoute => 70,
            PortKind::Unknown(code) => *code,
        }
    }
}

impl From<u32> for PortKind {
    fn from(code: u32) -> Self {
        match code {
            1 => PortKind::TextMessage,
            3 => PortKind::Position,
            4 => PortKind::NodeInfo,
            67 => PortKind::Telemetry,
            70 => PortKind::TraceRoute,
            other => PortKind::Unknown(other),
        }
    }
}

/// Decoded payload of a canonical packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Printable text (decrypted where necessary).
    Text(String),
    /// Opaque bytes: undecodable, still-encrypted, or a non-text port.
    Raw(Bytes),
}

impl Payload {
    /// Text content, if this payload is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Raw(_) => None,
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Raw(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single event shape the bridge hands to the command router.
///
/// Created once per adapter callback, consumed once by the bridge.
#[derive(Debug, Clone)]
pub struct CanonicalPacket {
    /// Which radio the packet arrived on. Immutable.
    pub origin_transport: Transport,
    /// Resolved sender identity; `None` means anonymous (no key fragment at
    /// all) and the packet has no reply path.
    pub from_id: Option<NodeId>,
    /// Destination. May be the broadcast sentinel or a channel hash that is
    /// indistinguishable from a unicast address.
    pub to_id: NodeId,
    /// Payload classification.
    pub port_kind: PortKind,
    /// Decoded payload.
    pub payload: Payload,
    /// Channel index the packet was heard on.
    pub channel: u8,
    /// Whether the payload is still channel/DM-encrypted.
    pub is_encrypted: bool,
    /// When the adapter handed us the packet.
    pub received_at: DateTime<Utc>,
}

impl CanonicalPacket {
    /// Text content, if any.
    pub fn text(&self) -> Option<&str> {
        self.payload.as_text()
    }

    /// Whether the destination field carries the broadcast sentinel.
    ///
    /// Address inspection alone cannot classify a packet as public: a
    /// MeshCore contact message always carries the sentinel yet is inherently
    /// directed. Classification belongs to the bridge, not this accessor.
    pub fn is_broadcast_addressed(&self) -> bool {
        self.to_id.is_broadcast()
    }
}
