//! Dual-transport bridge core
//!
//! The bridge merges packet events from both radio adapters into one
//! processing loop. Per packet:
//!
//! 1. resolve the sender to a canonical [`NodeId`],
//! 2. decrypt the payload if it needs it,
//! 3. drop cross-transport duplicates of recently handled broadcasts,
//! 4. classify directed vs broadcast,
//! 5. record the sender's reply route,
//! 6. hand text commands to the [`CommandRouter`] through a bounded queue.
//!
//! Classification checks origin before the destination field: MeshCore
//! shares no broadcast address space with us, so everything arriving on it
//! is for us even though its contact messages carry the broadcast sentinel.
//! Only then does the own-id check and, last, the sentinel check apply.
//!
//! The router runs on its own worker task behind a bounded channel. A slow
//! command handler fills the queue and loses packets; it never stalls radio
//! reception.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crossmesh_core::{CanonicalPacket, NodeId, Payload, PortKind, Transport};

use crate::adapter::{Directory, PacketCallback, RawPacketEvent, TransportAdapter};
use crate::config::CrossmeshConfig;
use crate::crypto::{self, ChannelCrypto};
use crate::dedupe::{DedupeWindow, Fingerprint};
use crate::discovery::RouteDiscovery;
use crate::error::{BridgeError, Result};
use crate::identity::{IdentityResolver, IdentityStore};
use crate::reply::{AdapterSet, ReplyRoutes, ReplySender};

/// Receives dispatched command packets.
///
/// The router owns reply generation; it answers through a [`ReplySender`]
/// on its own schedule, or not at all.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    /// Handle one inbound command packet.
    async fn handle(&self, packet: CanonicalPacket);
}

/// How an inbound packet is addressed, after the origin-ordered checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// Addressed to this node
    Directed,
    /// Genuine broadcast traffic
    Broadcast,
    /// Somebody else's directed traffic, overheard
    NotForUs,
}

/// Commands accepted by a running bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Report statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Stop the event loop
    Shutdown,
}

/// Bridge counters
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    /// Events received from the Meshtastic adapter
    pub meshtastic_received: u64,
    /// Events received from the MeshCore adapter
    pub meshcore_received: u64,
    /// Packets handed to the command router
    pub dispatched: u64,
    /// Broadcast duplicates dropped inside the dedupe window
    pub echoes_dropped: u64,
    /// Payloads no configured key could decrypt
    pub decrypt_failures: u64,
    /// Overheard traffic addressed to other nodes
    pub not_for_us: u64,
    /// Packets with no dispatchable text payload
    pub non_text: u64,
    /// Route probes resolved by a response
    pub probes_resolved: u64,
    /// Events or packets dropped because a queue was full
    pub queue_drops: u64,
}

/// Handle for controlling a running bridge
#[derive(Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Fetch bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| BridgeError::ChannelClosed)?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Stop the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| BridgeError::ChannelClosed)
    }
}

/// The dual-transport bridge service.
pub struct Bridge {
    config: CrossmeshConfig,
    own_id: NodeId,
    adapters: AdapterSet,
    directories: HashMap<Transport, Arc<dyn Directory>>,
    identity: IdentityResolver,
    crypto: ChannelCrypto,
    dedupe: DedupeWindow,
    routes: ReplyRoutes,
    discovery: RouteDiscovery,
    router: Arc<dyn CommandRouter>,
    ingest_tx: mpsc::Sender<RawPacketEvent>,
    ingest_rx: mpsc::Receiver<RawPacketEvent>,
    dispatch_tx: mpsc::Sender<CanonicalPacket>,
    dispatch_rx: Option<mpsc::Receiver<CanonicalPacket>>,
    command_rx: mpsc::Receiver<BridgeCommand>,
    stats: BridgeStats,
    queue_drops: Arc<AtomicU64>,
}

impl Bridge {
    /// Create a bridge with the identity cache persisted per configuration.
    pub fn new(
        config: CrossmeshConfig,
        own_id: NodeId,
        router: Arc<dyn CommandRouter>,
    ) -> Result<(Self, BridgeHandle)> {
        let identity =
            IdentityResolver::with_store(IdentityStore::new(&config.identity.cache_path))?;
        Self::with_resolver(config, own_id, router, identity)
    }

    /// Create a bridge with an explicit identity resolver.
    pub fn with_resolver(
        config: CrossmeshConfig,
        own_id: NodeId,
        router: Arc<dyn CommandRouter>,
        identity: IdentityResolver,
    ) -> Result<(Self, BridgeHandle)> {
        config.validate()?;

        let crypto = ChannelCrypto::from_config(&config.channels)?;
        let dedupe = DedupeWindow::from_config(&config.bridge);
        let discovery = RouteDiscovery::new(config.bridge.traceroute_timeout);

        let queue = config.bridge.worker_queue_size.max(1);
        let (ingest_tx, ingest_rx) = mpsc::channel(queue);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(queue);
        let (command_tx, command_rx) = mpsc::channel(16);
        let handle = BridgeHandle { command_tx };

        let bridge = Self {
            config,
            own_id,
            adapters: AdapterSet::new(),
            directories: HashMap::new(),
            identity,
            crypto,
            dedupe,
            routes: ReplyRoutes::new(),
            discovery,
            router,
            ingest_tx,
            ingest_rx,
            dispatch_tx,
            dispatch_rx: Some(dispatch_rx),
            command_rx,
            stats: BridgeStats::default(),
            queue_drops: Arc::new(AtomicU64::new(0)),
        };

        Ok((bridge, handle))
    }

    /// Attach a transport adapter and its node directory.
    ///
    /// Subscribes the bridge's ingest callback on the adapter; packets start
    /// queueing immediately even before [`run`](Self::run) is called.
    pub fn attach(
        &mut self,
        adapter: Arc<dyn TransportAdapter>,
        directory: Arc<dyn Directory>,
        default_channel: u8,
    ) {
        adapter.subscribe(self.callback());
        let transport = adapter.transport();
        self.adapters.insert(adapter, default_channel);
        self.directories.insert(transport, directory);
        info!(%transport, "transport attached");
    }

    /// The ingest callback handed to adapters.
    ///
    /// Non-blocking by construction: a full queue drops the event rather
    /// than back-pressuring the radio read loop.
    pub fn callback(&self) -> PacketCallback {
        let tx = self.ingest_tx.clone();
        let drops = Arc::clone(&self.queue_drops);
        Arc::new(move |event| {
            if tx.try_send(event).is_err() {
                drops.fetch_add(1, Ordering::Relaxed);
                warn!("ingest queue full, inbound packet dropped");
            }
        })
    }

    /// Build a reply sender sharing this bridge's adapter set, routing table
    /// and dedupe window.
    ///
    /// The adapter set is live: a transport attached after this call is
    /// still reachable from the returned sender.
    pub fn reply_sender(&self) -> ReplySender {
        ReplySender::new(
            self.adapters.clone(),
            self.routes.clone(),
            self.dedupe.clone(),
            self.config.bridge.default_reply_transport,
        )
    }

    /// The shared reply routing table.
    pub fn routes(&self) -> ReplyRoutes {
        self.routes.clone()
    }

    /// The identity resolver.
    pub fn identity(&self) -> IdentityResolver {
        self.identity.clone()
    }

    /// The route discovery tracker.
    pub fn discovery(&self) -> RouteDiscovery {
        self.discovery.clone()
    }

    /// Run the bridge until shutdown.
    pub async fn run(mut self) -> Result<()> {
        info!(own_id = %self.own_id, "starting crossmesh bridge");

        let dispatch_rx = self.dispatch_rx.take().ok_or(BridgeError::ChannelClosed)?;
        let router = Arc::clone(&self.router);
        let worker = tokio::spawn(async move {
            let mut rx = dispatch_rx;
            while let Some(packet) = rx.recv().await {
                router.handle(packet).await;
            }
        });

        let mut housekeeping = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                Some(event) = self.ingest_rx.recv() => {
                    // One malformed packet must not halt ingestion
                    if let Err(e) = self.handle_event(event).await {
                        warn!(error = %e, "error handling inbound packet");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        BridgeCommand::GetStats(tx) => {
                            let _ = tx.send(self.snapshot_stats());
                        }
                        BridgeCommand::Shutdown => {
                            info!("bridge shutdown requested");
                            break;
                        }
                    }
                }

                _ = housekeeping.tick() => {
                    self.dedupe.expire_old_entries();
                    self.discovery.expire_old_entries();
                    trace!(
                        dispatched = self.stats.dispatched,
                        echoes = self.stats.echoes_dropped,
                        routes = self.routes.len(),
                        "bridge housekeeping"
                    );
                }
            }
        }

        drop(self.dispatch_tx);
        let _ = worker.await;

        info!("crossmesh bridge stopped");
        Ok(())
    }

    /// Process one inbound event through the per-packet pipeline.
    async fn handle_event(&mut self, event: RawPacketEvent) -> Result<()> {
        match event.transport {
            Transport::Meshtastic => self.stats.meshtastic_received += 1,
            Transport::MeshCore => self.stats.meshcore_received += 1,
        }

        let directory = self.directories.get(&event.transport).cloned();
        let from = self.identity.resolve(&event, directory.as_deref()).await;

        let Some(payload) = self.decode_payload(&event)? else {
            return Ok(());
        };
        let was_encrypted = event.is_likely_encrypted();

        // Duplicate suppression before classification: a copy of an
        // already-handled broadcast can arrive on either transport, in
        // either addressing shape.
        let fingerprint = payload
            .as_text()
            .map(|text| Fingerprint::of(text, event.channel));
        if let Some(fp) = fingerprint {
            if self.dedupe.is_recent(&fp) {
                self.stats.echoes_dropped += 1;
                return Ok(());
            }
        }

        let class = self.classify(&event);
        if class == PacketClass::NotForUs {
            self.stats.not_for_us += 1;
            trace!(to = %NodeId(event.to_id), "overheard packet, not for us");
            return Ok(());
        }

        // Every dispatched packet refreshes the sender's reply route,
        // broadcasts included
        if let Some(from) = from {
            self.routes.note(from, event.transport);
        }

        let port_kind = PortKind::from(event.port_code);

        if port_kind == PortKind::TraceRoute {
            if let Some(from) = from {
                if let Some(rtt) = self.discovery.complete(from) {
                    self.stats.probes_resolved += 1;
                    info!(node = %from, ?rtt, "route probe resolved");
                }
            }
            return Ok(());
        }

        if port_kind != PortKind::TextMessage || payload.as_text().is_none() {
            self.stats.non_text += 1;
            trace!(?port_kind, "no dispatchable text payload");
            return Ok(());
        }

        // The MeshCore sentinel lie stops here: a directed packet is
        // re-addressed to our own id so downstream code can trust to_id
        let to_id = match class {
            PacketClass::Directed => self.own_id,
            _ => NodeId(event.to_id),
        };

        let packet = CanonicalPacket {
            origin_transport: event.transport,
            from_id: from,
            to_id,
            port_kind,
            payload,
            channel: event.channel,
            is_encrypted: was_encrypted,
            received_at: event.rx_time,
        };

        debug!(
            from = ?packet.from_id,
            origin = %packet.origin_transport,
            ?class,
            "dispatching command packet"
        );

        if self.dispatch_tx.try_send(packet).is_err() {
            self.queue_drops.fetch_add(1, Ordering::Relaxed);
            warn!("dispatch queue full, command dropped");
            return Ok(());
        }
        self.stats.dispatched += 1;

        // A dispatched broadcast may be relayed onto the other mesh by a
        // dual-homed node; remembering it here keeps that copy from being
        // answered a second time
        if class == PacketClass::Broadcast {
            if let Some(fp) = fingerprint {
                self.dedupe.record(fp);
            }
        }
        Ok(())
    }

    /// Decrypt the payload if it looks encrypted, and decode to the
    /// canonical payload shape. `None` means the packet carried ciphertext
    /// none of our keys open.
    fn decode_payload(&mut self, event: &RawPacketEvent) -> Result<Option<Payload>> {
        let bytes: Vec<u8> = if event.is_likely_encrypted() {
            match self.crypto.try_decrypt(&event.payload, event.channel) {
                Some(plaintext) => plaintext,
                None => {
                    self.stats.decrypt_failures += 1;
                    let to = NodeId(event.to_id);
                    // Public-looking traffic we cannot read deserves a
                    // visible warning; somebody else's DM does not
                    if PortKind::from(event.port_code) == PortKind::TextMessage
                        && to.is_broadcast()
                    {
                        warn!(
                            channel = event.channel,
                            keys = self.crypto.key_count(),
                            "no configured key decrypts broadcast text traffic"
                        );
                    } else {
                        debug!(channel = event.channel, "ciphertext not for our keys");
                    }
                    return Ok(None);
                }
            }
        } else {
            event.payload.to_vec()
        };

        let payload = match String::from_utf8(bytes) {
            Ok(text) => Payload::Text(text),
            Err(e) => Payload::Raw(Bytes::from(e.into_bytes())),
        };
        Ok(Some(payload))
    }

    /// Classify addressing, origin first.
    fn classify(&self, event: &RawPacketEvent) -> PacketClass {
        // A MeshCore radio only ever hands us traffic meant for us; its
        // destination field carries the sentinel regardless
        if event.transport == Transport::MeshCore {
            return PacketClass::Directed;
        }
        let to = NodeId(event.to_id);
        if to == self.own_id {
            PacketClass::Directed
        } else if to.is_broadcast() {
            PacketClass::Broadcast
        } else {
            PacketClass::NotForUs
        }
    }

    fn snapshot_stats(&self) -> BridgeStats {
        let mut stats = self.stats.clone();
        stats.queue_drops += self.queue_drops.load(Ordering::Relaxed);
        stats
    }
}

impl RawPacketEvent {
    /// Whether the payload needs a decryption attempt before dispatch.
    fn is_likely_encrypted(&self) -> bool {
        crypto::looks_encrypted(&self.payload)
    }
}
