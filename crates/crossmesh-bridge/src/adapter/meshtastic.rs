//! Meshtastic transport adapter
//!
//! The Meshtastic library does most of the identity work for us: every
//! decoded packet carries resolved numeric node ids, and the device keeps a
//! node registry we can query synchronously. The adapter's job is reduced to
//! framing, registry upkeep from NodeInfo packets, and normalizing decoded
//! frames into [`RawPacketEvent`]s.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crossmesh_core::{NodeId, PortKind, Transport};

use crate::adapter::{
    ConnectionState, DeviceLink, Directory, DirectoryEntry, PacketCallback, RawPacketEvent,
    TransportAdapter,
};
use crate::config::LORA_MAX_PAYLOAD;
use crate::error::{BridgeError, Result};

/// Frame header: from(4) + to(4) + packet_id(4) + port(1) + channel(1)
const FRAME_HEADER_LEN: usize = 14;

/// A node known to the device's registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Long name reported by the node
    pub display_name: String,
    /// Full 32-byte public key
    pub public_key: Vec<u8>,
}

/// Synchronously queryable node registry, mirrored from the device.
///
/// Shared by clone; a link reconnect never clears it.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<u32, RegistryEntry>>>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node by id
    pub fn get(&self, node_id: u32) -> Option<RegistryEntry> {
        self.nodes.read().get(&node_id).cloned()
    }

    /// Insert or update a node
    pub fn upsert(&self, node_id: u32, entry: RegistryEntry) {
        trace!(node_id = %NodeId(node_id), name = %entry.display_name, "registry upsert");
        self.nodes.write().insert(node_id, entry);
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Find a node whose public key starts with the given fragment.
    pub fn find_by_fragment(&self, fragment: &[u8]) -> Option<(u32, RegistryEntry)> {
        if fragment.is_empty() {
            return None;
        }
        self.nodes
            .read()
            .iter()
            .find(|(_, entry)| entry.public_key.starts_with(fragment))
            .map(|(id, entry)| (*id, entry.clone()))
    }
}

#[async_trait]
impl Directory for NodeRegistry {
    async fn lookup(&self, fragment: &[u8]) -> Option<DirectoryEntry> {
        self.find_by_fragment(fragment)
            .map(|(_, entry)| DirectoryEntry {
                display_name: entry.display_name,
                public_key: entry.public_key,
            })
    }
}

/// Adapter for a Meshtastic radio attached over a [`DeviceLink`].
pub struct MeshtasticAdapter<L: DeviceLink> {
    link: Mutex<L>,
    registry: NodeRegistry,
    callback: RwLock<Option<PacketCallback>>,
    state: RwLock<ConnectionState>,
    own_id: NodeId,
    name: String,
}

impl<L: DeviceLink> MeshtasticAdapter<L> {
    /// Create an adapter over the given link.
    pub fn new(link: L, own_id: NodeId) -> Self {
        let name = format!("meshtastic:{}", link.name());
        Self {
            link: Mutex::new(link),
            registry: NodeRegistry::new(),
            callback: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            own_id,
            name,
        }
    }

    /// The device node registry.
    pub fn registry(&self) -> NodeRegistry {
        self.registry.clone()
    }

    /// Read and dispatch frames until the link fails permanently.
    ///
    /// Read errors are transient: logged low severity, followed by a
    /// reconnect on this adapter's own schedule. They never reach the
    /// bridge's dispatch path.
    pub async fn pump(&self) -> Result<()> {
        loop {
            let frame = {
                let mut link = self.link.lock().await;
                link.read_frame().await
            };

            match frame {
                Ok(Some(data)) => {
                    if let Err(e) = self.handle_frame(&data) {
                        // One malformed frame must not halt ingestion
                        debug!(error = %e, "dropping malformed meshtastic frame");
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => {
                    debug!(error = %e, "meshtastic link read failed");
                    self.try_reconnect().await?;
                }
            }
        }
    }

    /// Decode one frame and hand it to the subscriber.
    fn handle_frame(&self, data: &[u8]) -> Result<()> {
        let event = self.parse_frame(data)?;

        // NodeInfo keeps the registry fresh
        if PortKind::from(event.port_code) == PortKind::NodeInfo {
            if let (Some(from), Some((name, key))) =
                (event.from_id, parse_node_info(&event.payload))
            {
                self.registry.upsert(
                    from,
                    RegistryEntry {
                        display_name: name,
                        public_key: key,
                    },
                );
            }
        }

        let callback = self.callback.read().clone();
        if let Some(cb) = callback {
            cb(event);
        } else {
            trace!("no subscriber registered, frame dropped");
        }
        Ok(())
    }

    /// Parse a decoded radio frame into the boundary event shape.
    fn parse_frame(&self, data: &[u8]) -> Result<RawPacketEvent> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(BridgeError::InvalidFrame(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }

        let from = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let to = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        // bytes 8..12 are the packet id; dedupe here is fingerprint-based
        let port_code = data[12] as u32;
        let channel = data[13];
        let payload = Bytes::copy_from_slice(&data[FRAME_HEADER_LEN..]);

        let public_key_fragment = self.registry.get(from).map(|entry| entry.public_key);

        Ok(RawPacketEvent {
            transport: Transport::Meshtastic,
            from_id: Some(from),
            to_id: to,
            port_code,
            payload,
            channel,
            public_key_fragment,
            rx_time: Utc::now(),
        })
    }

    /// Encode an outgoing text frame.
    fn encode_text_frame(&self, text: &str, destination: NodeId, channel: u8) -> Result<Vec<u8>> {
        if text.len() > LORA_MAX_PAYLOAD {
            return Err(BridgeError::MessageTooLarge {
                size: text.len(),
                max: LORA_MAX_PAYLOAD,
            });
        }

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + text.len());
        frame.extend_from_slice(&self.own_id.as_u32().to_be_bytes());
        frame.extend_from_slice(&destination.as_u32().to_be_bytes());
        frame.extend_from_slice(&rand::random::<u32>().to_be_bytes());
        frame.extend_from_slice(&[PortKind::TextMessage.code() as u8, channel]);
        frame.extend_from_slice(text.as_bytes());
        Ok(frame.to_vec())
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

#[async_trait]
impl<L: DeviceLink> TransportAdapter for MeshtasticAdapter<L> {
    fn transport(&self) -> Transport {
        Transport::Meshtastic
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
        let frame = self.encode_text_frame(text, destination, channel_index)?;
        let mut link = self.link.lock().await;
        link.write_frame(&frame)
            .await
            .map_err(|e| BridgeError::WriteError(e.to_string()))?;
        debug!(
            adapter = %self.name,
            to = %destination,
            bytes = frame.len(),
            "sent text"
        );
        Ok(())
    }
}

/// Parse a NodeInfo payload: name_len(1) + name + 32-byte public key.
fn parse_node_info(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let name_len = *payload.first()? as usize;
    if payload.len() < 1 + name_len + 32 {
        return None;
    }
    let name = String::from_utf8(payload[1..1 + name_len].to_vec()).ok()?;
    let key = payload[1 + name_len..1 + name_len + 32].to_vec();
    Some((name, key))
}
