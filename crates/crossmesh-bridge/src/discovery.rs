//! Traceroute-style route discovery
//!
//! The bridge can probe for a path to a node it has no reply route for.
//! Each probe gets a pending entry; the entry resolves when the response
//! packet comes back or expires after the configured timeout. Expiry is the
//! common case on a sparse mesh and is not an error.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crossmesh_core::NodeId;

/// Pending route probes, keyed by target node.
///
/// Shared by clone. One in-flight probe per target; a second request for
/// the same target while one is pending is coalesced into it.
#[derive(Debug, Clone)]
pub struct RouteDiscovery {
    pending: Arc<RwLock<HashMap<NodeId, Instant>>>,
    timeout: Duration,
}

impl RouteDiscovery {
    /// Create a tracker with the given probe timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            timeout,
        }
    }

    /// Register a probe toward `target`.
    ///
    /// Returns false when a live probe for the target is already pending,
    /// in which case the caller should not send another one.
    pub fn begin(&self, target: NodeId) -> bool {
        let mut pending = self.pending.write();
        match pending.get(&target) {
            Some(started) if started.elapsed() <= self.timeout => false,
            _ => {
                pending.insert(target, Instant::now());
                true
            }
        }
    }

    /// Resolve the probe for `target`, returning its round-trip time.
    ///
    /// Returns None for a response nobody asked for, or one that arrived
    /// after its probe already expired.
    pub fn complete(&self, target: NodeId) -> Option<Duration> {
        let started = self.pending.write().remove(&target)?;
        let elapsed = started.elapsed();
        if elapsed > self.timeout {
            debug!(node = %target, ?elapsed, "route probe response arrived late");
            return None;
        }
        Some(elapsed)
    }

    /// Whether a live probe toward `target` is pending.
    pub fn is_pending(&self, target: NodeId) -> bool {
        self.pending
            .read()
            .get(&target)
            .is_some_and(|started| started.elapsed() <= self.timeout)
    }

    /// Drop expired probes, returning the targets that timed out.
    pub fn expire_old_entries(&self) -> Vec<NodeId> {
        let mut pending = self.pending.write();
        let expired: Vec<NodeId> = pending
            .iter()
            .filter(|(_, started)| started.elapsed() > self.timeout)
            .map(|(node, _)| *node)
            .collect();
        for node in &expired {
            pending.remove(node);
            debug!(node = %node, "route probe timed out");
        }
        expired
    }

    /// Number of probes currently tracked (expired ones included until the
    /// next sweep).
    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    /// Whether no probes are tracked.
    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }
}
