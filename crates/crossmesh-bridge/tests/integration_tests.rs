//! End-to-end tests for the dual-transport bridge
//!
//! These run the real adapters, the real bridge loop and the real reply
//! sender over fake device links, covering:
//! - command reception over MeshCore and the reply routed back over MeshCore
//! - replying to a sender the contact book has never heard an advert from
//! - MeshCore always-directed classification despite the sentinel address
//! - reply routing following the sender's last-heard transport
//! - cross-transport suppression of broadcast duplicates, ours and relayed
//! - channel decryption on the inbound path

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crossmesh_bridge::{
    Bridge, BridgeHandle, CanonicalPacket, ChannelCrypto, CommandRouter, CrossmeshConfigBuilder,
    DeviceLink, IdentityResolver, MeshCoreAdapter, MeshtasticAdapter, NodeId, PortKind,
    ReplySender, Result, Transport, TransportAdapter,
};

const OWN_ID: NodeId = NodeId(0x0A0B0C0D);
const KEY_PRIMARY: &str =
    "1111111111111111111111111111111111111111111111111111111111111111";

// ============================================================================
// Fake device links and a command router
// ============================================================================

/// A device link whose queues are shared with the test body.
#[derive(Clone)]
struct SharedLink {
    label: &'static str,
    connected: Arc<AtomicBool>,
    incoming: Arc<StdMutex<VecDeque<Vec<u8>>>>,
    outgoing: Arc<StdMutex<Vec<Vec<u8>>>>,
}

impl SharedLink {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            connected: Arc::new(AtomicBool::new(false)),
            incoming: Arc::new(StdMutex::new(VecDeque::new())),
            outgoing: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn inject(&self, frame: Vec<u8>) {
        self.incoming.lock().unwrap().push_back(frame);
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.outgoing.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceLink for SharedLink {
    async fn connect(&mut self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        Ok(self.incoming.lock().unwrap().pop_front().map(Bytes::from))
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.outgoing.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        self.label
    }
}

/// Router that records everything and answers `/echo <text>` with `<text>`.
struct EchoRouter {
    sender: StdMutex<Option<ReplySender>>,
    seen: StdMutex<Vec<CanonicalPacket>>,
}

impl EchoRouter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sender: StdMutex::new(None),
            seen: StdMutex::new(Vec::new()),
        })
    }

    fn set_sender(&self, sender: ReplySender) {
        *self.sender.lock().unwrap() = Some(sender);
    }

    fn seen(&self) -> Vec<CanonicalPacket> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRouter for EchoRouter {
    async fn handle(&self, packet: CanonicalPacket) {
        self.seen.lock().unwrap().push(packet.clone());

        let Some(text) = packet.text() else { return };
        let Some(reply) = text.strip_prefix("/echo ") else {
            return;
        };
        let Some(from) = packet.from_id else { return };

        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(from, reply).await;
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    handle: BridgeHandle,
    replies: ReplySender,
    mt_link: SharedLink,
    mc_link: SharedLink,
    router: Arc<EchoRouter>,
}

async fn start_harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("crossmesh_bridge=debug")
        .try_init();

    let config = CrossmeshConfigBuilder::new()
        .meshtastic_device("/dev/ttyUSB9")
        .meshcore_device("/dev/ttyACM9")
        .channel_key("Primary", KEY_PRIMARY)
        .build();

    let router = EchoRouter::new();
    let (mut bridge, handle) = Bridge::with_resolver(
        config,
        OWN_ID,
        router.clone(),
        IdentityResolver::in_memory(),
    )
    .unwrap();

    let mt_link = SharedLink::new("mt-fake");
    let mc_link = SharedLink::new("mc-fake");

    let mt_adapter = Arc::new(MeshtasticAdapter::new(mt_link.clone(), OWN_ID));
    let mc_adapter = Arc::new(MeshCoreAdapter::new(mc_link.clone()));
    mt_adapter.connect().await.unwrap();
    mc_adapter.connect().await.unwrap();

    bridge.attach(
        mt_adapter.clone(),
        Arc::new(mt_adapter.registry()),
        0,
    );
    bridge.attach(
        mc_adapter.clone(),
        Arc::new(mc_adapter.contacts()),
        0,
    );

    let replies = bridge.reply_sender();
    router.set_sender(replies.clone());

    {
        let adapter = mt_adapter.clone();
        tokio::spawn(async move { adapter.pump().await });
    }
    {
        let adapter = mc_adapter.clone();
        tokio::spawn(async move { adapter.pump().await });
    }
    tokio::spawn(bridge.run());

    Harness {
        handle,
        replies,
        mt_link,
        mc_link,
        router,
    }
}

/// Poll until `check` passes or two seconds elapse.
async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn carol_key() -> Vec<u8> {
    let mut key = vec![0x14, 0x3b, 0xcd, 0x7f, 0x1b, 0x1f];
    key.resize(32, 0xAB);
    key
}

fn advert_frame(key: &[u8], name: &str) -> Vec<u8> {
    format!(
        r#"{{"type":"advert","publicKey":"{}","name":"{}"}}"#,
        hex::encode(key),
        name
    )
    .into_bytes()
}

fn contact_message_frame(prefix: &[u8], text: &str) -> Vec<u8> {
    format!(
        r#"{{"type":"contactMessage","publicKeyPrefix":"{}","text":"{}"}}"#,
        hex::encode(prefix),
        text
    )
    .into_bytes()
}

fn channel_message_frame(channel: u8, payload: &[u8], prefix: Option<&[u8]>) -> Vec<u8> {
    match prefix {
        Some(prefix) => format!(
            r#"{{"type":"channelMessage","channelIdx":{},"payloadHex":"{}","publicKeyPrefix":"{}"}}"#,
            channel,
            hex::encode(payload),
            hex::encode(prefix)
        ),
        None => format!(
            r#"{{"type":"channelMessage","channelIdx":{},"payloadHex":"{}"}}"#,
            channel,
            hex::encode(payload)
        ),
    }
    .into_bytes()
}

fn meshtastic_text_frame(from: u32, to: u32, channel: u8, text: &str) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&from.to_be_bytes());
    frame.extend_from_slice(&to.to_be_bytes());
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.push(PortKind::TextMessage.code() as u8);
    frame.push(channel);
    frame.extend_from_slice(text.as_bytes());
    frame
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_echo_command_over_meshcore_replies_over_meshcore() {
    let h = start_harness().await;
    let key = carol_key();

    // Carol advertises, then sends a command. Her message arrives with the
    // broadcast sentinel in its destination field, as MeshCore contact
    // messages always do.
    h.mc_link.inject(advert_frame(&key, "carol"));
    h.mc_link.inject(contact_message_frame(&key[..6], "/echo hi"));

    assert!(wait_for(|| !h.mc_link.sent().is_empty()).await);

    let sent = h.mc_link.sent();
    let frame: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
    assert_eq!(frame["type"], "sendMsg");
    assert!(frame["publicKeyPrefix"]
        .as_str()
        .unwrap()
        .starts_with("143bcd7f"));
    assert_eq!(frame["text"], "hi");

    // Nothing leaked onto the other mesh
    assert!(h.mt_link.sent().is_empty());

    // And the command itself was classified directed at us
    let seen = h.router.seen();
    let command = seen.iter().find(|p| p.text() == Some("/echo hi")).unwrap();
    assert_eq!(command.from_id, Some(NodeId(0x143bcd7f)));
    assert_eq!(command.to_id, OWN_ID);
    assert_eq!(command.origin_transport, Transport::MeshCore);
}

#[tokio::test]
async fn test_echo_reply_works_without_a_prior_advert() {
    let h = start_harness().await;
    let key = carol_key();

    // Fresh pairing: the contact book is empty and stays empty. The sender
    // is known only by the key prefix on her own message.
    h.mc_link
        .inject(contact_message_frame(&key[..6], "/echo hi"));

    assert!(wait_for(|| !h.mc_link.sent().is_empty()).await);

    let sent = h.mc_link.sent();
    let frame: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
    assert_eq!(frame["type"], "sendMsg");
    // Without a contact entry the prefix is the node id itself
    assert_eq!(frame["publicKeyPrefix"], "143bcd7f");
    assert_eq!(frame["text"], "hi");
}

#[tokio::test]
async fn test_relayed_broadcast_is_not_answered_twice() {
    let h = start_harness().await;

    // A third node broadcasts a command on Meshtastic; we answer it
    h.mt_link.inject(meshtastic_text_frame(
        0x5555AA01,
        NodeId::BROADCAST.as_u32(),
        0,
        "/echo test",
    ));
    assert!(wait_for(|| h.mt_link.sent().len() == 1).await);

    // A dual-homed node relays the same text into MeshCore
    h.mc_link
        .inject(channel_message_frame(0, b"/echo test", None));

    let mut dropped = false;
    for _ in 0..100 {
        if h.handle.stats().await.unwrap().echoes_dropped == 1 {
            dropped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dropped);

    // Only the first copy reached the router; no second reply went out
    assert_eq!(h.router.seen().len(), 1);
    assert!(h.mc_link.sent().is_empty());
    assert_eq!(h.mt_link.sent().len(), 1);
}

#[tokio::test]
async fn test_meshcore_channel_traffic_is_still_for_us() {
    let h = start_harness().await;

    h.mc_link
        .inject(channel_message_frame(0, b"plain channel chatter", None));

    assert!(
        wait_for(|| h
            .router
            .seen()
            .iter()
            .any(|p| p.text() == Some("plain channel chatter")))
        .await
    );

    let seen = h.router.seen();
    let packet = seen
        .iter()
        .find(|p| p.text() == Some("plain channel chatter"))
        .unwrap();
    assert!(!packet.is_broadcast_addressed());
    assert_eq!(packet.to_id, OWN_ID);
}

#[tokio::test]
async fn test_reply_follows_the_senders_latest_transport() {
    let h = start_harness().await;
    let key = carol_key();
    let carol = NodeId(0x143bcd7f);

    // Heard on MeshCore first
    h.mc_link.inject(advert_frame(&key, "carol"));
    h.mc_link.inject(contact_message_frame(&key[..6], "/ping"));
    assert!(wait_for(|| h.router.seen().iter().any(|p| p.text() == Some("/ping"))).await);

    h.replies.send(carol, "pong").await.unwrap();
    assert_eq!(h.mc_link.sent().len(), 1);
    assert!(h.mt_link.sent().is_empty());

    // The same node shows up on Meshtastic; the route flips
    h.mt_link.inject(meshtastic_text_frame(
        carol.as_u32(),
        NodeId::BROADCAST.as_u32(),
        0,
        "hello from the other mesh",
    ));
    assert!(
        wait_for(|| h
            .router
            .seen()
            .iter()
            .any(|p| p.origin_transport == Transport::Meshtastic))
        .await
    );

    let used = h.replies.send(carol, "pong again").await.unwrap();
    assert_eq!(used, Transport::Meshtastic);
    assert_eq!(h.mt_link.sent().len(), 1);
    assert_eq!(h.mc_link.sent().len(), 1);
}

#[tokio::test]
async fn test_own_broadcast_echo_is_suppressed_across_transports() {
    let h = start_harness().await;

    // Broadcast on Meshtastic; a dual-homed node relays it into MeshCore
    h.replies
        .broadcast(Transport::Meshtastic, "net check")
        .await
        .unwrap();
    assert_eq!(h.mt_link.sent().len(), 1);

    h.mc_link
        .inject(channel_message_frame(0, b"net check", None));

    let mut dropped = false;
    for _ in 0..100 {
        if h.handle.stats().await.unwrap().echoes_dropped == 1 {
            dropped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(dropped);

    // The echo never reached the router, so nothing was re-sent
    assert!(h.router.seen().is_empty());
    assert_eq!(h.mt_link.sent().len(), 1);
}

#[tokio::test]
async fn test_encrypted_channel_command_is_decrypted_and_answered() {
    let h = start_harness().await;
    let key = carol_key();

    let crypto = ChannelCrypto::from_config(
        &CrossmeshConfigBuilder::new()
            .channel_key("Primary", KEY_PRIMARY)
            .build()
            .channels,
    )
    .unwrap();
    let ciphertext = crypto.encrypt("Primary", b"/echo secret", 0).unwrap();

    h.mc_link.inject(advert_frame(&key, "carol"));
    h.mc_link
        .inject(channel_message_frame(0, &ciphertext, Some(&key[..6])));

    assert!(wait_for(|| !h.mc_link.sent().is_empty()).await);

    let sent = h.mc_link.sent();
    let frame: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
    assert_eq!(frame["text"], "secret");

    let seen = h.router.seen();
    let command = seen
        .iter()
        .find(|p| p.text() == Some("/echo secret"))
        .unwrap();
    assert!(command.is_encrypted);
}

#[tokio::test]
async fn test_foreign_ciphertext_is_dropped_without_error() {
    let h = start_harness().await;

    // Ciphertext under a key we do not hold
    let foreign = ChannelCrypto::from_config(
        &CrossmeshConfigBuilder::new()
            .channel_key("Other", "22".repeat(32))
            .build()
            .channels,
    )
    .unwrap();
    let ciphertext = foreign.encrypt("Other", b"/echo nope", 0).unwrap();

    h.mc_link.inject(channel_message_frame(0, &ciphertext, None));

    let mut failed = false;
    for _ in 0..100 {
        if h.handle.stats().await.unwrap().decrypt_failures == 1 {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(failed);

    assert!(h.router.seen().is_empty());
    assert!(h.mc_link.sent().is_empty());
}

#[tokio::test]
async fn test_node_id_derivation_is_the_big_endian_key_prefix() {
    for key_byte in [0x00u8, 0x42, 0xFF] {
        let mut key = vec![0x14, 0x3b, 0xcd, key_byte];
        key.resize(32, 0x77);

        let expected = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        assert_eq!(NodeId::from_key_fragment(&key), Some(NodeId(expected)));
        // A short fragment derives the same id as the full key
        assert_eq!(NodeId::from_key_fragment(&key[..4]), Some(NodeId(expected)));
        assert_eq!(NodeId::from_key_fragment(&key[..6]), Some(NodeId(expected)));
    }
}
