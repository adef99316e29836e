//! Crossmesh Core - Canonical types for the dual-transport mesh bridge
//!
//! This crate provides the shared data model used by every bridge component:
//! the canonical 32-bit node identity derived from device public keys, the
//! normalized packet shape both radio adapters produce, and the identity
//! records the bridge persists across restarts.
//!
//! # Modules
//!
//! - [`identity`] - Node identity, key-fragment derivation, identity records
//! - [`packet`] - Transport tags, port classification, canonical packets
//! - [`error`] - Core error types
//!
//! # Example
//!
//! ```rust
//! use crossmesh_core::{NodeId, Transport};
//!
//! // Any >=4-byte public-key fragment pins down the canonical identity
//! let fragment = [0x14, 0x3b, 0xcd, 0x7f, 0x1b, 0x1f];
//! let id = NodeId::from_key_fragment(&fragment).unwrap();
//! assert_eq!(id.as_u32(), 0x143bcd7f);
//! println!("resolved {} on {}", id, Transport::MeshCore);
//! ```

pub mod error;
pub mod identity;
pub mod packet;

// Re-exports for convenience
pub use error::{CoreError, Result};
pub use identity::{IdentityOrigin, IdentityRecord, NodeId};
pub use packet::{CanonicalPacket, Payload, PortKind, Transport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
