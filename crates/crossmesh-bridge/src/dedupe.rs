//! Broadcast echo suppression
//!
//! A broadcast the bot sends on one mesh can be heard by a node that
//! straddles both meshes and re-transmitted onto the other, where our second
//! radio picks it up as an apparently new inbound message. Without
//! suppression the bot would answer its own announcement.
//!
//! The window remembers fingerprints of recently dispatched self-originated
//! broadcasts. A fingerprint is a hash of the normalized text and the
//! channel; entries expire after a fixed window of tens of seconds. The
//! sender records the fingerprint immediately upon dispatch, before the
//! radio confirms transmission, so the inbound check can never race the
//! send.

use lru::LruCache;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::BridgeConfig;

/// Fingerprint of a broadcast: hash(normalized text, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Compute the fingerprint for a broadcast text on a channel.
    ///
    /// Normalization is a whitespace trim only; two messages differing in
    /// content are different messages.
    pub fn of(text: &str, channel: u8) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.trim().as_bytes());
        hasher.update([0x00, channel]);
        let digest = hasher.finalize();
        Fingerprint(u64::from_be_bytes(digest[..8].try_into().unwrap()))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Window statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct DedupeStats {
    /// Total inbound checks
    pub total_checks: u64,
    /// Inbound events dropped as echoes
    pub echoes_dropped: u64,
    /// Fingerprints recorded at dispatch
    pub recorded: u64,
}

/// Short-lived set of self-originated broadcast fingerprints.
///
/// LRU-bounded with TTL expiry; clones share the underlying window so the
/// bridge (checking inbound) and the reply sender (recording outbound) see
/// the same state.
#[derive(Debug)]
pub struct DedupeWindow {
    window: Arc<RwLock<LruCache<Fingerprint, Instant>>>,
    ttl: Duration,
    stats: Arc<RwLock<DedupeStats>>,
}

impl DedupeWindow {
    /// Create from bridge configuration.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::with_capacity_and_ttl(config.dedup_capacity, config.dedup_window)
    }

    /// Create with explicit capacity and TTL.
    pub fn with_capacity_and_ttl(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            window: Arc::new(RwLock::new(LruCache::new(cap))),
            ttl,
            stats: Arc::new(RwLock::new(DedupeStats::default())),
        }
    }

    /// Record a dispatched self-originated broadcast.
    pub fn record(&self, fingerprint: Fingerprint) {
        trace!(%fingerprint, "recording broadcast fingerprint");
        self.window.write().put(fingerprint, Instant::now());
        self.stats.write().recorded += 1;
    }

    /// Check whether an inbound fingerprint is a recent echo.
    ///
    /// Expired entries are treated (and cleaned up) as absent.
    pub fn is_recent(&self, fingerprint: &Fingerprint) -> bool {
        self.stats.write().total_checks += 1;

        let mut window = self.window.write();
        match window.get(fingerprint) {
            Some(recorded_at) if recorded_at.elapsed() <= self.ttl => {
                debug!(%fingerprint, "dropping cross-transport broadcast echo");
                self.stats.write().echoes_dropped += 1;
                true
            }
            Some(_) => {
                window.pop(fingerprint);
                false
            }
            None => false,
        }
    }

    /// Drop all entries older than the TTL.
    pub fn expire_old_entries(&self) -> usize {
        let mut window = self.window.write();
        let expired: Vec<Fingerprint> = window
            .iter()
            .filter(|(_, recorded_at)| recorded_at.elapsed() > self.ttl)
            .map(|(fp, _)| *fp)
            .collect();
        for fp in &expired {
            window.pop(fp);
        }
        expired.len()
    }

    /// Number of live entries (including not-yet-expired ones).
    pub fn len(&self) -> usize {
        self.window.read().len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Window statistics.
    pub fn stats(&self) -> DedupeStats {
        self.stats.read().clone()
    }

    /// The configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Clone for DedupeWindow {
    fn clone(&self) -> Self {
        // Clones share the same underlying window
        Self {
            window: Arc::clone(&self.window),
            ttl: self.ttl,
            stats: Arc::clone(&self.stats),
        }
    }
}

impl Default for DedupeWindow {
    fn default() -> Self {
        Self::from_config(&BridgeConfig::default())
    }
}
