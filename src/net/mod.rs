//! P2P overlay networking layer

pub mod broadcast;
pub mod connection;
pub mod node;
pub mod peerlist;
pub mod rate_limit;
pub mod router;
pub mod rta;
pub mod transport;
pub mod types;
pub mod wire;

// Re-exports
pub use broadcast::BroadcastEngine;
pub use connection::{Blocklist, ConnectionMap, FailCache, HostFailScore};
pub use node::{NodeServer, NodeStats, NullPayloadHandler, PayloadHandler};
pub use peerlist::{FilePeerlistStore, Peerlist, PeerlistStore, Tier};
pub use rate_limit::{SharedLimiter, TokenBucket};
pub use rta::{RtaRegistry, SupernodeItem};
pub use transport::{ConnState, Connection, Direction};
pub use types::*;
pub use wire::{Frame, FrameHeader, WireCodec};
