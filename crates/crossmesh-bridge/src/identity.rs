//! Identity resolution across the two transports
//!
//! Meshtastic events arrive with a resolved numeric sender id; MeshCore
//! events arrive with at best a public-key fragment and sometimes an empty
//! contact directory behind them. The resolver turns either into the
//! canonical [`NodeId`], trying in order:
//!
//! 1. an identity already on the event,
//! 2. the local cache (by key fragment),
//! 3. the transport's own directory,
//! 4. derivation from the fragment's first 4 bytes.
//!
//! Step 4 is why "unknown sender" is rare here: every MeshCore message
//! carries the sender's key, and the key alone determines the same address
//! a Meshtastic node computes for itself. Derivation never fails given a
//! fragment of at least 4 bytes. No fragment at all means the message is
//! anonymous and has no reply path.
//!
//! Resolutions at steps 3 and 4 update the cache synchronously, so later
//! lookups are O(1). New or changed records are written through to disk so
//! identities survive a process restart; a sighting that adds nothing only
//! updates timestamps in memory.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crossmesh_core::{IdentityOrigin, IdentityRecord, NodeId, Transport};

use crate::adapter::{Directory, RawPacketEvent};
use crate::error::{BridgeError, Result};

/// Persisted identity table: a JSON file keyed by node id.
///
/// Any format that survives a restart would do; JSON keeps the table
/// inspectable with a text editor when a radio misbehaves in the field.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    /// Create a store backed by the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load all records. A missing file is an empty table, not an error.
    pub fn load(&self) -> Result<HashMap<NodeId, IdentityRecord>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(BridgeError::IdentityStore(e.to_string())),
        };
        let records: Vec<IdentityRecord> =
            serde_json::from_slice(&data).map_err(|e| BridgeError::IdentityStore(e.to_string()))?;
        Ok(records.into_iter().map(|r| (r.node_id, r)).collect())
    }

    /// Persist all records, replacing the file atomically.
    pub fn save(&self, records: &HashMap<NodeId, IdentityRecord>) -> Result<()> {
        let mut list: Vec<&IdentityRecord> = records.values().collect();
        list.sort_by_key(|r| r.node_id);
        let data = serde_json::to_vec_pretty(&list)
            .map_err(|e| BridgeError::IdentityStore(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &data).map_err(|e| BridgeError::IdentityStore(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| BridgeError::IdentityStore(e.to_string()))?;
        Ok(())
    }
}

/// Resolves and remembers node identities.
///
/// Interior mutability (Arc + RwLock) so both adapter threads can resolve
/// concurrently; critical sections are short.
#[derive(Clone)]
pub struct IdentityResolver {
    cache: Arc<RwLock<HashMap<NodeId, IdentityRecord>>>,
    store: Option<IdentityStore>,
}

impl IdentityResolver {
    /// Create a resolver with no persistence (tests, ephemeral runs).
    pub fn in_memory() -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            store: None,
        }
    }

    /// Create a resolver backed by a persisted store, loading what survives
    /// from previous runs.
    pub fn with_store(store: IdentityStore) -> Result<Self> {
        let cache = store.load()?;
        debug!(records = cache.len(), "loaded identity cache");
        Ok(Self {
            cache: Arc::new(RwLock::new(cache)),
            store: Some(store),
        })
    }

    /// Resolve the sender of an event to a canonical node id.
    ///
    /// `directory` is the event's origin transport's own directory, when the
    /// adapter exposes one. Returns `None` only when the event carries no
    /// identity and no usable key fragment; the caller treats such a message
    /// as anonymous/broadcast-only.
    pub async fn resolve(
        &self,
        event: &RawPacketEvent,
        directory: Option<&dyn Directory>,
    ) -> Option<NodeId> {
        // 1. Identity already present on the event
        if let Some(id) = event.from_id {
            let node_id = NodeId(id);
            self.touch(node_id, event);
            return Some(node_id);
        }

        let fragment = event.public_key_fragment.as_deref()?;

        // 2. Local cache by key fragment
        if let Some(node_id) = self.cached_by_fragment(fragment) {
            self.touch(node_id, event);
            return Some(node_id);
        }

        // 3. Transport's own directory
        if let Some(dir) = directory {
            if let Some(entry) = dir.lookup(fragment).await {
                if let Some(node_id) = NodeId::from_key_fragment(&entry.public_key) {
                    self.remember(
                        node_id,
                        entry.public_key,
                        Some(entry.display_name),
                        IdentityOrigin::RegistrySynced,
                        event.transport,
                    );
                    return Some(node_id);
                }
            }
        }

        // 4. Fallback derivation from the fragment itself
        if let Some(node_id) = NodeId::from_key_fragment(fragment) {
            self.remember(
                node_id,
                fragment.to_vec(),
                None,
                IdentityOrigin::DerivedFromKey,
                event.transport,
            );
            return Some(node_id);
        }

        // 5. Fragment too short; anonymous
        trace!(len = fragment.len(), "key fragment too short to derive identity");
        None
    }

    /// Look up a cached identity by key fragment.
    fn cached_by_fragment(&self, fragment: &[u8]) -> Option<NodeId> {
        let node_id = NodeId::from_key_fragment(fragment)?;
        let cache = self.cache.read();
        let record = cache.get(&node_id)?;
        // Confirm the fragments agree beyond the 4 derived bytes
        let n = record.public_key_fragment.len().min(fragment.len());
        if record.public_key_fragment[..n] == fragment[..n] {
            Some(node_id)
        } else {
            None
        }
    }

    /// Record a sighting of an already-resolved node.
    ///
    /// Writes through to disk only when the sighting adds information; a
    /// node chattering on its usual transport must not rewrite the table
    /// once per packet.
    fn touch(&self, node_id: NodeId, event: &RawPacketEvent) {
        let mut cache = self.cache.write();
        let changed = match cache.get_mut(&node_id) {
            Some(record) => {
                let transport_changed = record.last_seen_transport != event.transport;
                record.touch(event.transport);
                // A longer fragment refines the stored one
                let mut refined = false;
                if let Some(fragment) = event.public_key_fragment.as_deref() {
                    if fragment.len() > record.public_key_fragment.len()
                        && fragment.starts_with(&record.public_key_fragment)
                    {
                        record.public_key_fragment = fragment.to_vec();
                        refined = true;
                    }
                }
                transport_changed || refined
            }
            None => {
                let fragment = event
                    .public_key_fragment
                    .clone()
                    .unwrap_or_else(|| node_id.as_u32().to_be_bytes().to_vec());
                cache.insert(
                    node_id,
                    IdentityRecord::new(
                        node_id,
                        fragment,
                        None,
                        IdentityOrigin::RegistrySynced,
                        event.transport,
                    ),
                );
                true
            }
        };
        drop(cache);
        if changed {
            self.persist();
        }
    }

    /// Insert or update a record, writing the table through when the record
    /// content changed.
    fn remember(
        &self,
        node_id: NodeId,
        fragment: Vec<u8>,
        display_name: Option<String>,
        origin: IdentityOrigin,
        transport: Transport,
    ) {
        let mut cache = self.cache.write();
        let changed = match cache.get_mut(&node_id) {
            Some(record) => {
                let mut modified = record.last_seen_transport != transport;
                record.touch(transport);
                if fragment.len() > record.public_key_fragment.len() {
                    record.public_key_fragment = fragment;
                    modified = true;
                }
                if let Some(name) = display_name {
                    if record.display_name != name {
                        record.display_name = name;
                        modified = true;
                    }
                }
                modified
            }
            None => {
                debug!(node = %node_id, ?origin, "learned new identity");
                cache.insert(
                    node_id,
                    IdentityRecord::new(node_id, fragment, display_name, origin, transport),
                );
                true
            }
        };
        drop(cache);
        if changed {
            self.persist();
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let cache = self.cache.read();
            if let Err(e) = store.save(&cache) {
                warn!(error = %e, "failed to persist identity cache");
            }
        }
    }

    /// Fetch a record by node id.
    pub fn get(&self, node_id: NodeId) -> Option<IdentityRecord> {
        self.cache.read().get(&node_id).cloned()
    }

    /// Number of known identities.
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    /// Whether no identities are known.
    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}
