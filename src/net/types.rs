//! Wire payloads, peerlist entries, and protocol constants.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every on-wire collection has an explicit
//!    cap enforced at deserialization time. A peer cannot exhaust memory
//!    by sending a large peerlist or an oversized frame.
//!
//! 2. **Address book quality** — only peers that answered a reverse ping
//!    are promoted to the anchor/white tiers, so the gossip we hand out
//!    consists of addresses that were reachable at least once.

use crate::types::{now, PeerAddress, PeerId};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Magic prefix of every frame. Prevents cross-talk with other protocols
/// sharing a port.
pub const NETWORK_MAGIC: u64 = 0x0101_0101_0101_2101;

/// Wire format version carried in each frame header.
pub const WIRE_VERSION: u32 = 1;

/// Default TCP port for the overlay.
pub const DEFAULT_P2P_PORT: u16 = 28680;

/// Default TCP port for the admin RPC.
pub const DEFAULT_RPC_PORT: u16 = 28681;

// =============================================================================
// COMMAND IDS
// =============================================================================
// One pool starting at 1000; ids are stable wire contract.

pub const CMD_HANDSHAKE: u32 = 1001;
pub const CMD_TIMED_SYNC: u32 = 1002;
pub const CMD_PING: u32 = 1003;
pub const CMD_STAT_INFO: u32 = 1004;
pub const CMD_NETWORK_STATE: u32 = 1005;
pub const CMD_PEER_ID: u32 = 1006;
pub const CMD_SUPPORT_FLAGS: u32 = 1007;
pub const CMD_BROADCAST: u32 = 1008;

/// Status string echoed in a ping response.
pub const PING_OK_STATUS: &str = "OK";

// =============================================================================
// RETURN CODES
// =============================================================================

pub const RC_OK: i32 = 0;
pub const RC_FAILURE: i32 = -1;
/// Responder's network_id differs; sent before the connection is closed.
pub const RC_UNSUPPORTED: i32 = -2;

// =============================================================================
// LIMITS AND TIMERS
// =============================================================================

/// Hard cap on a single frame body. Checked before the body is read.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Maximum peerlist entries in a handshake or timed-sync response.
/// One more is a protocol violation.
pub const PEERLIST_SLICE: usize = 250;

/// Deadline for a handshake or timed-sync exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a one-shot reverse ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for a gray-list probe handshake.
pub const GRAY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Outbound-maintenance tick.
pub const CONNECT_TICK: Duration = Duration::from_secs(1);

/// Timed-sync period per established outbound connection.
pub const TIMED_SYNC_PERIOD: Duration = Duration::from_secs(60);

/// Gray-list housekeeping period.
pub const GRAY_HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(60);

/// Peerlist persistence period.
pub const PEERLIST_STORE_PERIOD: Duration = Duration::from_secs(1800);

/// Cooldown before reconnecting to an address that failed.
pub const FAIL_COOLDOWN: u64 = 5 * 60;

/// White-tier demotion threshold: consecutive failures before an address
/// falls back to gray.
pub const N_FAIL_DROP: u32 = 3;

/// Host-fail-score threshold; reaching it blocklists the host.
pub const FAIL_SCORE_LIMIT: u64 = 5;

/// Blocklist duration applied when the fail score limit is reached.
pub const IP_BLOCKTIME: u64 = 24 * 60 * 60;

/// Maximum hops a broadcast travels. At the limit it is still delivered
/// locally but not relayed.
pub const HOP_LIMIT: u32 = 4;

/// Broadcast dedup retention, seconds.
pub const BROADCAST_DEDUP_TTL: u64 = 30;

/// Dedup sweep period.
pub const DEDUP_SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Hard cap on dedup entries; oldest purged first.
pub const DEDUP_CAP: usize = 10_000;

/// Per-request deadline for HTTP posts to local supernodes.
pub const SUPERNODE_HTTP_TIMEOUT: Duration = Duration::from_secs(3);

/// Handlers should complete within this; exceeding it is logged and
/// counts against the connection's slow-handler budget.
pub const HANDLER_SOFT_LIMIT: Duration = Duration::from_millis(200);

/// Deadline for draining connections at shutdown.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Peerlist tier caps.
pub const WHITE_CAP: usize = 1000;
pub const GRAY_CAP: usize = 5000;
pub const ANCHOR_CAP: usize = 100;

/// Freshness bias exponent for peer sampling: index = floor(rand^K * len).
/// K > 1 favors recently seen entries while keeping every entry reachable.
pub const SAMPLE_BIAS_K: f64 = 2.0;

// =============================================================================
// SUPPORT FLAGS
// =============================================================================

/// Capability bitfield exchanged once per connection.
pub const SUPPORT_FLAG_RTA: u32 = 1 << 0;

// =============================================================================
// PEERLIST ENTRY
// =============================================================================

/// One address-book entry, as stored and as gossiped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerlistEntry {
    pub adr: PeerAddress,
    /// Peer's self-assigned id; zero when unknown.
    pub id: PeerId,
    /// Seconds since epoch, in the clock of whoever reports it.
    pub last_seen: u64,
    pub rpc_port: Option<u16>,
    /// Opaque to this layer; carried for the application.
    pub pruning_seed: u32,
}

impl PeerlistEntry {
    pub fn new(adr: PeerAddress, id: PeerId) -> Self {
        Self { adr, id, last_seen: now(), rpc_port: None, pruning_seed: 0 }
    }
}

// =============================================================================
// COMMAND PAYLOADS
// =============================================================================

/// Identity block exchanged in handshakes and pings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicNodeData {
    pub network_id: [u8; 16],
    pub peer_id: PeerId,
    /// Listening port the peer claims; zero when hidden.
    pub my_port: u16,
    pub rpc_port: Option<u16>,
    pub local_time: u64,
    pub support_flags: u32,
}

pub type PeerlistSlice = BoundedVec<PeerlistEntry, PEERLIST_SLICE>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub node_data: BasicNodeData,
    /// Application payload summary; opaque to this layer.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub node_data: BasicNodeData,
    pub payload: Vec<u8>,
    pub local_peerlist: PeerlistSlice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedSyncRequest {
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedSyncResponse {
    pub local_time: u64,
    pub payload: Vec<u8>,
    pub local_peerlist: PeerlistSlice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportFlagsResponse {
    pub support_flags: u32,
}

/// Application broadcast as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Originator's address in display form; half of the dedup key.
    pub sender_address: String,
    /// Opaque 32-byte message id; the other half of the dedup key.
    pub message_hash: [u8; 32],
    pub hop: u32,
    pub timestamp: u64,
    /// When present, resolved against the RTA redirection registry.
    pub receiver_id: Option<String>,
    pub data: Vec<u8>,
}

#[cfg(feature = "debug-commands")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatInfoResponse {
    pub peer_id: PeerId,
    pub out_connections: usize,
    pub in_connections: usize,
    pub white_size: usize,
    pub gray_size: usize,
    pub anchor_size: usize,
    pub broadcast_bytes_in: u64,
    pub broadcast_bytes_out: u64,
}

#[cfg(feature = "debug-commands")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStateResponse {
    pub local_peerlist_white: Vec<PeerlistEntry>,
    pub local_peerlist_gray: Vec<PeerlistEntry>,
    pub connections: Vec<(String, PeerId)>,
}

#[cfg(feature = "debug-commands")]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdResponse {
    pub my_id: PeerId,
}

// =============================================================================
// BOUNDED COLLECTIONS
// =============================================================================

/// Vec whose length cap is enforced during deserialization, so an
/// oversized peerlist is rejected before it is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedVec<T, const N: usize>(Vec<T>);

impl<T, const N: usize> BoundedVec<T, N> {
    pub fn new(v: Vec<T>) -> Option<Self> {
        if v.len() <= N {
            Some(Self(v))
        } else {
            None
        }
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }
}

impl<T, const N: usize> Default for BoundedVec<T, N> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T, const N: usize> std::ops::Deref for BoundedVec<T, N> {
    type Target = [T];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Serialize, const N: usize> Serialize for BoundedVec<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for BoundedVec<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundedVecVisitor<T, const N: usize>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>, const N: usize> de::Visitor<'de> for BoundedVecVisitor<T, N> {
            type Value = BoundedVec<T, N>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a sequence with at most {} elements", N)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut v = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(N));
                while let Some(item) = seq.next_element()? {
                    if v.len() >= N {
                        return Err(de::Error::invalid_length(v.len() + 1, &self));
                    }
                    v.push(item);
                }
                Ok(BoundedVec(v))
            }
        }

        deserializer.deserialize_seq(BoundedVecVisitor(PhantomData))
    }
}
