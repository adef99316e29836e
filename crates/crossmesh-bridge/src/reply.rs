//! Reply routing and transmission
//!
//! Every dispatched inbound packet records which transport its sender was
//! last heard on. When the bot answers, the reply goes back out over that
//! transport; a node the bridge has never heard from falls back to the
//! configured default. Replies are one-shot: a failed send is reported to
//! the caller and never retried here, because a LoRa mesh gives no
//! delivery guarantee the retry could improve on.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crossmesh_core::{NodeId, Transport};

use crate::adapter::TransportAdapter;
use crate::dedupe::{DedupeWindow, Fingerprint};
use crate::error::BridgeError;

/// Last-heard-on transport per node.
///
/// Shared by clone between the bridge (writing on every dispatch) and the
/// reply sender (reading on every send). Survives adapter reconnects; only
/// process restart clears it.
#[derive(Debug, Clone, Default)]
pub struct ReplyRoutes {
    routes: Arc<RwLock<HashMap<NodeId, Transport>>>,
}

impl ReplyRoutes {
    /// Create an empty routing table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` was heard on `transport`. Overwrites any
    /// previous route; the freshest sighting wins.
    pub fn note(&self, node: NodeId, transport: Transport) {
        self.routes.write().insert(node, transport);
    }

    /// Transport the node was last heard on, if any.
    pub fn lookup(&self, node: NodeId) -> Option<Transport> {
        self.routes.read().get(&node).copied()
    }

    /// Number of routed nodes
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// The attached transport adapters with their default channel indices.
///
/// Shared by clone between the bridge and every reply sender built from it,
/// so an adapter attached after a sender was handed out is still reachable
/// from that sender.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: Arc<RwLock<HashMap<Transport, (Arc<dyn TransportAdapter>, u8)>>>,
}

impl AdapterSet {
    /// Create an empty adapter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own transport tag.
    pub fn insert(&self, adapter: Arc<dyn TransportAdapter>, default_channel: u8) {
        self.adapters
            .write()
            .insert(adapter.transport(), (adapter, default_channel));
    }

    /// The adapter and default channel for a transport, if attached.
    pub fn get(&self, transport: Transport) -> Option<(Arc<dyn TransportAdapter>, u8)> {
        self.adapters
            .read()
            .get(&transport)
            .map(|(adapter, channel)| (Arc::clone(adapter), *channel))
    }

    /// Transports with an attached adapter.
    pub fn transports(&self) -> Vec<Transport> {
        self.adapters.read().keys().copied().collect()
    }
}

/// Why a reply did not go out. None of these are retried automatically.
#[derive(Debug, Error)]
pub enum SendError {
    /// No adapter is attached for the chosen transport
    #[error("no adapter attached for transport {0}")]
    NoInterface(Transport),

    /// The adapter accepted the message but the transmit failed
    #[error("transmit failed on {transport}: {reason}")]
    Transmit {
        /// Transport that failed
        transport: Transport,
        /// Adapter-reported reason
        reason: String,
    },

    /// The chosen transport has no way to address the destination
    #[error("destination {0} unknown on {1}")]
    UnknownDestination(NodeId, Transport),
}

/// Sends replies over whichever transport the destination was last heard on.
#[derive(Clone)]
pub struct ReplySender {
    adapters: AdapterSet,
    routes: ReplyRoutes,
    dedupe: DedupeWindow,
    default_transport: Transport,
}

impl ReplySender {
    /// Create a sender over a shared adapter set.
    pub fn new(
        adapters: AdapterSet,
        routes: ReplyRoutes,
        dedupe: DedupeWindow,
        default_transport: Transport,
    ) -> Self {
        Self {
            adapters,
            routes,
            dedupe,
            default_transport,
        }
    }

    /// Attach a transport adapter with its default channel index.
    ///
    /// Visible to every sender sharing the same [`AdapterSet`].
    pub fn attach(&self, adapter: Arc<dyn TransportAdapter>, default_channel: u8) {
        self.adapters.insert(adapter, default_channel);
    }

    /// Which transport a send to `destination` would use right now.
    pub fn transport_for(&self, destination: NodeId) -> Transport {
        self.routes
            .lookup(destination)
            .unwrap_or(self.default_transport)
    }

    /// Send `text` to `destination`, returning the transport actually used.
    ///
    /// The outcome is logged here either way, so a caller that can do
    /// nothing useful with a failure may drop it after inspection; silent
    /// non-delivery of an unroutable reply is the intended behavior.
    pub async fn send(
        &self,
        destination: NodeId,
        text: &str,
    ) -> std::result::Result<Transport, SendError> {
        let transport = self.transport_for(destination);
        let (adapter, channel) = self
            .adapters
            .get(transport)
            .ok_or(SendError::NoInterface(transport))?;

        // Record before transmit: the echo can arrive on the other
        // transport faster than the radio acknowledges the send.
        if destination.is_broadcast() {
            self.dedupe.record(Fingerprint::of(text, channel));
        }

        match adapter.send_text(text, destination, channel).await {
            Ok(()) => {
                info!(to = %destination, %transport, bytes = text.len(), "reply sent");
                Ok(transport)
            }
            Err(BridgeError::UnknownNode(node)) => {
                debug!(to = %node, %transport, "reply dropped, destination unknown");
                Err(SendError::UnknownDestination(node, transport))
            }
            Err(e) => {
                warn!(to = %destination, %transport, error = %e, "reply transmit failed");
                Err(SendError::Transmit {
                    transport,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Broadcast `text` on the given transport's default channel.
    pub async fn broadcast(
        &self,
        transport: Transport,
        text: &str,
    ) -> std::result::Result<(), SendError> {
        let (adapter, channel) = self
            .adapters
            .get(transport)
            .ok_or(SendError::NoInterface(transport))?;

        self.dedupe.record(Fingerprint::of(text, channel));

        match adapter.send_text(text, NodeId::BROADCAST, channel).await {
            Ok(()) => {
                info!(%transport, bytes = text.len(), "broadcast sent");
                Ok(())
            }
            Err(e) => {
                warn!(%transport, error = %e, "broadcast transmit failed");
                Err(SendError::Transmit {
                    transport,
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for ReplySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySender")
            .field("transports", &self.adapters.transports())
            .field("default_transport", &self.default_transport)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PacketCallback;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct RecordingAdapter {
        transport: Transport,
        sent: Arc<StdMutex<Vec<(String, NodeId, u8)>>>,
        fail_with: Option<fn(NodeId) -> BridgeError>,
    }

    impl RecordingAdapter {
        fn new(transport: Transport) -> (Arc<Self>, Arc<StdMutex<Vec<(String, NodeId, u8)>>>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            let adapter = Arc::new(Self {
                transport,
                sent: sent.clone(),
                fail_with: None,
            });
            (adapter, sent)
        }

        fn failing(transport: Transport, fail_with: fn(NodeId) -> BridgeError) -> Arc<Self> {
            Arc::new(Self {
                transport,
                sent: Arc::new(StdMutex::new(Vec::new())),
                fail_with: Some(fail_with),
            })
        }
    }

    #[async_trait]
    impl TransportAdapter for RecordingAdapter {
        fn transport(&self) -> Transport {
            self.transport
        }

        fn name(&self) -> &str {
            "recording"
        }

        async fn connect(&self) -> crate::error::Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> crate::error::Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn subscribe(&self, _callback: PacketCallback) {}

        async fn send_text(
            &self,
            text: &str,
            destination: NodeId,
            channel_index: u8,
        ) -> crate::error::Result<()> {
            if let Some(fail) = self.fail_with {
                return Err(fail(destination));
            }
            self.sent
                .lock()
                .unwrap()
                .push((text.to_string(), destination, channel_index));
            Ok(())
        }
    }

    fn sender_with(
        adapters: Vec<Arc<RecordingAdapter>>,
        default_transport: Transport,
    ) -> (ReplySender, ReplyRoutes, DedupeWindow) {
        let routes = ReplyRoutes::new();
        let dedupe = DedupeWindow::with_capacity_and_ttl(16, Duration::from_secs(30));
        let sender = ReplySender::new(
            AdapterSet::new(),
            routes.clone(),
            dedupe.clone(),
            default_transport,
        );
        for adapter in adapters {
            sender.attach(adapter, 0);
        }
        (sender, routes, dedupe)
    }

    #[tokio::test]
    async fn test_reply_follows_last_heard_transport() {
        let (mt, mt_sent) = RecordingAdapter::new(Transport::Meshtastic);
        let (mc, mc_sent) = RecordingAdapter::new(Transport::MeshCore);
        let (sender, routes, _) = sender_with(vec![mt, mc], Transport::Meshtastic);

        let node = NodeId(0x143bcd7f);
        routes.note(node, Transport::MeshCore);

        let used = sender.send(node, "pong").await.unwrap();
        assert_eq!(used, Transport::MeshCore);
        assert_eq!(mc_sent.lock().unwrap().len(), 1);
        assert!(mt_sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unseen_node_uses_default_transport() {
        let (mt, mt_sent) = RecordingAdapter::new(Transport::Meshtastic);
        let (mc, _) = RecordingAdapter::new(Transport::MeshCore);
        let (sender, _, _) = sender_with(vec![mt, mc], Transport::Meshtastic);

        let used = sender.send(NodeId(0x99999999), "hello").await.unwrap();
        assert_eq!(used, Transport::Meshtastic);
        assert_eq!(mt_sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_adapter_is_no_interface() {
        let (mt, _) = RecordingAdapter::new(Transport::Meshtastic);
        let (sender, routes, _) = sender_with(vec![mt], Transport::Meshtastic);

        let node = NodeId(0x11111111);
        routes.note(node, Transport::MeshCore);

        let err = sender.send(node, "hi").await.unwrap_err();
        assert!(matches!(err, SendError::NoInterface(Transport::MeshCore)));
    }

    #[tokio::test]
    async fn test_unknown_node_maps_to_unknown_destination() {
        let mc = RecordingAdapter::failing(Transport::MeshCore, BridgeError::UnknownNode);
        let (sender, routes, _) = sender_with(vec![mc], Transport::MeshCore);

        let node = NodeId(0x22222222);
        routes.note(node, Transport::MeshCore);

        let err = sender.send(node, "hi").await.unwrap_err();
        assert!(matches!(
            err,
            SendError::UnknownDestination(NodeId(0x22222222), Transport::MeshCore)
        ));
    }

    #[tokio::test]
    async fn test_transmit_failure_is_reported_not_retried() {
        let mc = RecordingAdapter::failing(Transport::MeshCore, |_| {
            BridgeError::WriteError("serial gone".to_string())
        });
        let sent = mc.sent.clone();
        let (sender, routes, _) = sender_with(vec![mc], Transport::MeshCore);

        let node = NodeId(0x33333333);
        routes.note(node, Transport::MeshCore);

        let err = sender.send(node, "hi").await.unwrap_err();
        assert!(matches!(err, SendError::Transmit { .. }));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_records_fingerprint_before_transmit() {
        let (mt, _) = RecordingAdapter::new(Transport::Meshtastic);
        let (sender, _, dedupe) = sender_with(vec![mt], Transport::Meshtastic);

        sender
            .broadcast(Transport::Meshtastic, "net check")
            .await
            .unwrap();

        assert!(dedupe.is_recent(&Fingerprint::of("net check", 0)));
    }

    #[tokio::test]
    async fn test_failed_broadcast_still_records_fingerprint() {
        // The fingerprint goes in before the transmit attempt, so a send
        // that half-succeeds on air still gets its echo suppressed
        let mt = RecordingAdapter::failing(Transport::Meshtastic, |_| {
            BridgeError::WriteError("timeout".to_string())
        });
        let (sender, _, dedupe) = sender_with(vec![mt], Transport::Meshtastic);

        let _ = sender.broadcast(Transport::Meshtastic, "net check").await;
        assert!(dedupe.is_recent(&Fingerprint::of("net check", 0)));
    }

    #[tokio::test]
    async fn test_adapter_attached_after_sender_creation_is_reachable() {
        let adapters = AdapterSet::new();
        let routes = ReplyRoutes::new();
        let dedupe = DedupeWindow::with_capacity_and_ttl(16, Duration::from_secs(30));
        let sender = ReplySender::new(
            adapters.clone(),
            routes,
            dedupe,
            Transport::Meshtastic,
        );

        let node = NodeId(0x143bcd7f);
        let err = sender.send(node, "hi").await.unwrap_err();
        assert!(matches!(err, SendError::NoInterface(Transport::Meshtastic)));

        // Attaching through the shared set reaches the existing sender
        let (mt, mt_sent) = RecordingAdapter::new(Transport::Meshtastic);
        adapters.insert(mt, 0);

        sender.send(node, "hi").await.unwrap();
        assert_eq!(mt_sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_routes_freshest_sighting_wins() {
        let routes = ReplyRoutes::new();
        let node = NodeId(0x44444444);

        routes.note(node, Transport::Meshtastic);
        routes.note(node, Transport::MeshCore);
        assert_eq!(routes.lookup(node), Some(Transport::MeshCore));
        assert_eq!(routes.len(), 1);
    }
}
