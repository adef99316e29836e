//! MeshCore transport adapter
//!
//! The MeshCore companion library is a different animal from Meshtastic: it
//! emits raw contact events, its contact list may be empty on a freshly
//! paired device, and a sender is identified by a public-key prefix rather
//! than a resolved numeric id. Contact messages also always carry the
//! broadcast sentinel in their destination field even though every one of
//! them is targeted at us; classification is the bridge's problem, not ours.
//!
//! The companion wire format is camelCase JSON. One wire struct and one
//! conversion function cross that boundary; no ad hoc maps.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crossmesh_core::{NodeId, PortKind, Transport};

use crate::adapter::{
    ConnectionState, DeviceLink, Directory, DirectoryEntry, PacketCallback, RawPacketEvent,
    TransportAdapter,
};
use crate::config::LORA_MAX_PAYLOAD;
use crate::error::{BridgeError, Result};

/// A contact known to the MeshCore device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshCoreContact {
    /// Full or partial public key
    pub public_key: Vec<u8>,
    /// Advertised name
    pub display_name: String,
}

/// The device's contact collection. May be empty on a fresh pairing.
///
/// Shared by clone; a link reconnect never clears it.
#[derive(Debug, Clone, Default)]
pub struct ContactBook {
    contacts: Arc<RwLock<Vec<MeshCoreContact>>>,
}

impl ContactBook {
    /// Create an empty contact book
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all contacts
    pub fn contacts(&self) -> Vec<MeshCoreContact> {
        self.contacts.read().clone()
    }

    /// Number of contacts
    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    /// Whether the book is empty
    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }

    /// Insert or update a contact, keyed by public key prefix
    pub fn upsert(&self, contact: MeshCoreContact) {
        let mut contacts = self.contacts.write();
        if let Some(existing) = contacts
            .iter_mut()
            .find(|c| keys_match(&c.public_key, &contact.public_key))
        {
            *existing = contact;
        } else {
            contacts.push(contact);
        }
    }

    /// Find a contact by public-key fragment
    pub fn find_by_fragment(&self, fragment: &[u8]) -> Option<MeshCoreContact> {
        if fragment.is_empty() {
            return None;
        }
        self.contacts
            .read()
            .iter()
            .find(|c| keys_match(&c.public_key, fragment))
            .cloned()
    }

    /// Find the contact whose derived node id matches
    pub fn find_by_node_id(&self, node_id: NodeId) -> Option<MeshCoreContact> {
        self.contacts
            .read()
            .iter()
            .find(|c| NodeId::from_key_fragment(&c.public_key) == Some(node_id))
            .cloned()
    }
}

/// Two key fragments refer to the same node when one is a prefix of the other.
fn keys_match(a: &[u8], b: &[u8]) -> bool {
    let n = a.len().min(b.len());
    n >= NodeId::MIN_FRAGMENT_LEN && a[..n] == b[..n]
}

#[async_trait]
impl Directory for ContactBook {
    async fn lookup(&self, fragment: &[u8]) -> Option<DirectoryEntry> {
        self.find_by_fragment(fragment).map(|c| DirectoryEntry {
            display_name: c.display_name,
            public_key: c.public_key,
        })
    }
}

/// Inbound companion events, exactly as the library frames them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum MeshCoreWireEvent {
    /// A message from a known or unknown contact. Always targeted at us,
    /// whatever its destination field claims.
    #[serde(rename_all = "camelCase")]
    ContactMessage {
        public_key_prefix: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        payload_hex: Option<String>,
        #[serde(default)]
        channel_idx: u8,
    },
    /// Group-channel traffic; payload may be ciphertext for a key we hold.
    #[serde(rename_all = "camelCase")]
    ChannelMessage {
        channel_idx: u8,
        payload_hex: String,
        #[serde(default)]
        public_key_prefix: Option<String>,
    },
    /// A node advertisement carrying the full public key.
    #[serde(rename_all = "camelCase")]
    Advert { public_key: String, name: String },
}

/// Outbound companion commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum MeshCoreWireCommand {
    #[serde(rename_all = "camelCase")]
    SendMsg {
        public_key_prefix: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    SendChannelMsg { channel_idx: u8, text: String },
}

/// Adapter for a MeshCore companion radio attached over a [`DeviceLink`].
pub struct MeshCoreAdapter<L: DeviceLink> {
    link: Mutex<L>,
    contacts: ContactBook,
    callback: RwLock<Option<PacketCallback>>,
    state: RwLock<ConnectionState>,
    name: String,
}

impl<L: DeviceLink> MeshCoreAdapter<L> {
    /// Create an adapter over the given link.
    pub fn new(link: L) -> Self {
        let name = format!("meshcore:{}", link.name());
        Self {
            link: Mutex::new(link),
            contacts: ContactBook::new(),
            callback: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            name,
        }
    }

    /// The device contact book.
    pub fn contacts(&self) -> ContactBook {
        self.contacts.clone()
    }

    /// Read and dispatch companion events until the link fails permanently.
    pub async fn pump(&self) -> Result<()> {
        loop {
            let frame = {
                let mut link = self.link.lock().await;
                link.read_frame().await
            };

            match frame {
                Ok(Some(data)) => {
                    if let Err(e) = self.handle_frame(&data) {
                        debug!(error = %e, "dropping malformed meshcore event");
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => {
                    debug!(error = %e, "meshcore link read failed");
                    self.try_reconnect().await?;
                }
            }
        }
    }

    /// Decode one companion event and hand it to the subscriber.
    fn handle_frame(&self, data: &[u8]) -> Result<()> {
        let wire: MeshCoreWireEvent = serde_json::from_slice(data)?;

        if let MeshCoreWireEvent::Advert { public_key, name } = &wire {
            let key = hex::decode(public_key)
                .map_err(|e| BridgeError::InvalidFrame(format!("advert key: {}", e)))?;
            self.contacts.upsert(MeshCoreContact {
                public_key: key,
                display_name: name.clone(),
            });
        }

        let Some(event) = wire_to_event(wire)? else {
            return Ok(());
        };

        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            cb(event);
        } else {
            trace!("no subscriber registered, event dropped");
        }
        Ok(())
    }

    async fn try_reconnect(&self) -> Result<()> {
        *self.state.write() = ConnectionState::Reconnecting;
        let mut link = self.link.lock().await;
        let _ = link.disconnect().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        link.connect().await?;
        *self.state.write() = ConnectionState::Connected;
        info!(adapter = %self.name, "reconnected");
        Ok(())
    }
}

/// Convert a wire event into the boundary shape.
///
/// The destination of a contact message is reported as the broadcast
/// sentinel by this library; the bridge's origin-ordered classification is
/// what keeps such messages directed.
fn wire_to_event(wire: MeshCoreWireEvent) -> Result<Option<RawPacketEvent>> {
    let event = match wire {
        MeshCoreWireEvent::ContactMessage {
            public_key_prefix,
            text,
            payload_hex,
            channel_idx,
        } => {
            let fragment = hex::decode(&public_key_prefix)
                .map_err(|e| BridgeError::InvalidFrame(format!("key prefix: {}", e)))?;
            let payload = match (text, payload_hex) {
                (Some(t), _) => Bytes::from(t.into_bytes()),
                (None, Some(h)) => Bytes::from(
                    hex::decode(&h)
                        .map_err(|e| BridgeError::InvalidFrame(format!("payload: {}", e)))?,
                ),
                (None, None) => Bytes::new(),
            };
            RawPacketEvent {
                transport: Transport::MeshCore,
                from_id: None,
                to_id: NodeId::BROADCAST.as_u32(),
                port_code: PortKind::TextMessage.code(),
                payload,
                channel: channel_idx,
                public_key_fragment: Some(fragment),
                rx_time: Utc::now(),
            }
        }
        MeshCoreWireEvent::ChannelMessage {
            channel_idx,
            payload_hex,
            public_key_prefix,
        } => {
            let payload = hex::decode(&payload_hex)
                .map_err(|e| BridgeError::InvalidFrame(format!("payload: {}", e)))?;
            let fragment = public_key_prefix
                .map(|p| hex::decode(&p))
                .transpose()
                .map_err(|e| BridgeError::InvalidFrame(format!("key prefix: {}", e)))?;
            RawPacketEvent {
                transport: Transport::MeshCore,
                from_id: None,
                to_id: NodeId::BROADCAST.as_u32(),
                port_code: PortKind::TextMessage.code(),
                payload: Bytes::from(payload),
                channel: channel_idx,
                public_key_fragment: fragment,
                rx_time: Utc::now(),
            }
        }
        MeshCoreWireEvent::Advert { public_key, name } => {
            let key = hex::decode(&public_key)
                .map_err(|e| BridgeError::InvalidFrame(format!("advert key: {}", e)))?;
            RawPacketEvent {
                transport: Transport::MeshCore,
                from_id: None,
                to_id: NodeId::BROADCAST.as_u32(),
                port_code: PortKind::NodeInfo.code(),
                payload: Bytes::from(name.into_bytes()),
                channel: 0,
                public_key_fragment: Some(key),
                rx_time: Utc::now(),
            }
        }
    };
    Ok(Some(event))
}

#[async_trait]
impl<L: DeviceLink> TransportAdapter for MeshCoreAdapter<L> {
    fn transport(&self) -> Transport {
        Transport::MeshCore
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        *self.state.write() = ConnectionState::Connecting;
        let mut link = self.link.lock().await;
        link.connect().await?;
        *self.state.write() = ConnectionState::Connected;
        info!(adapter = %self.name, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        link.disconnect().await?;
        *self.state.write() = ConnectionState::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionState::Connected
    }

    fn subscribe(&self, callback: PacketCallback) {
        *self.callback.write() = Some(callback);
    }

    async fn send_text(&self, text: &str, destination: NodeId, channel_index: u8) -> Result<()> {
        if text.len() > LORA_MAX_PAYLOAD {
            return Err(BridgeError::MessageTooLarge {
                size: text.len(),
                max: LORA_MAX_PAYLOAD,
            });
        }

        let command = if destination.is_broadcast() {
            MeshCoreWireCommand::SendChannelMsg {
                channel_idx: channel_index,
                text: text.to_string(),
            }
        } else {
            // A contact entry gives us a longer prefix, but the book may be
            // empty on a fresh pairing. The node id IS the first 4 key
            // bytes, so it always yields an addressable prefix on its own.
            let prefix = match self.contacts.find_by_node_id(destination) {
                Some(contact) => {
                    let prefix_len = contact.public_key.len().min(6);
                    hex::encode(&contact.public_key[..prefix_len])
                }
                None => hex::encode(destination.as_u32().to_be_bytes()),
            };
            MeshCoreWireCommand::SendMsg {
                public_key_prefix: prefix,
                text: text.to_string(),
            }
        };

        let frame = serde_json::to_vec(&command)?;
        let mut link = self.link.lock().await;
        link.write_frame(&frame)
            .await
            .map_err(|e| BridgeError::WriteError(e.to_string()))?;
        debug!(adapter = %self.name, to = %destination, "sent text");
        Ok(())
    }
}
