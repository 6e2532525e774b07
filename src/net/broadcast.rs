//! Broadcast deduplication, hop limiting, and traffic accounting.
//!
//! Every observed broadcast is keyed by `(sender_address, message_hash)`.
//! A key is retained for `BROADCAST_DEDUP_TTL` so re-deliveries and relay
//! echoes are dropped silently; a background sweep purges aged keys in
//! bulk. The cache is hard-capped; the oldest entries go first.

use crate::net::types::{BROADCAST_DEDUP_TTL, DEDUP_CAP, HOP_LIMIT};
use crate::types::now;
use sha3::{Digest, Sha3_256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

pub type DedupKey = (String, [u8; 32]);

/// Time-indexed set of seen broadcast keys. Insertion times are
/// monotonic, so the queue front is always the oldest entry and both the
/// TTL purge and the cap purge pop from the front.
#[derive(Debug, Default)]
struct DedupCache {
    keys: HashSet<DedupKey>,
    order: VecDeque<(u64, DedupKey)>,
}

impl DedupCache {
    /// Insert at time `at`; false when the key is already present.
    fn insert(&mut self, key: DedupKey, at: u64) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        while self.keys.len() >= DEDUP_CAP {
            if let Some((_, old)) = self.order.pop_front() {
                self.keys.remove(&old);
            } else {
                break;
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back((at, key));
        true
    }

    fn purge_older_than(&mut self, cutoff: u64) {
        while let Some((t, _)) = self.order.front() {
            if *t >= cutoff {
                break;
            }
            let (_, key) = self.order.pop_front().unwrap();
            self.keys.remove(&key);
        }
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Dedup state plus the byte/message counters the admin surface exposes.
#[derive(Debug)]
pub struct BroadcastEngine {
    dedup: Mutex<DedupCache>,
    /// Hashes of admin-initiated broadcasts, so a busy supernode posting
    /// the same payload twice does not flood the overlay twice.
    local_requests: Mutex<HashMap<[u8; 32], u64>>,
    hop_limit: u32,

    broadcast_bytes_in: AtomicU64,
    broadcast_bytes_out: AtomicU64,
    msgs_in: AtomicU64,
    msgs_relayed: AtomicU64,
    rta_msgs_p2p: AtomicU64,
    rta_msgs_local: AtomicU64,
}

impl Default for BroadcastEngine {
    fn default() -> Self {
        Self::with_hop_limit(HOP_LIMIT)
    }
}

impl BroadcastEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hop_limit(hop_limit: u32) -> Self {
        Self {
            dedup: Mutex::new(DedupCache::default()),
            local_requests: Mutex::new(HashMap::new()),
            hop_limit,
            broadcast_bytes_in: AtomicU64::new(0),
            broadcast_bytes_out: AtomicU64::new(0),
            msgs_in: AtomicU64::new(0),
            msgs_relayed: AtomicU64::new(0),
            rta_msgs_p2p: AtomicU64::new(0),
            rta_msgs_local: AtomicU64::new(0),
        }
    }

    /// Opaque 32-byte id of a payload.
    pub fn message_hash(data: &[u8]) -> [u8; 32] {
        let digest = Sha3_256::digest(data);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&digest);
        hash
    }

    /// First sighting of this `(sender, hash)` pair? Inserts on success;
    /// duplicates are the caller's cue to drop silently.
    pub fn first_sighting(&self, sender: &str, hash: [u8; 32]) -> bool {
        self.dedup
            .lock()
            .unwrap()
            .insert((sender.to_string(), hash), now())
    }

    /// Whether a message at this hop count is still relayed onward. At the
    /// limit the message is delivered locally only.
    pub fn should_relay(&self, hop: u32) -> bool {
        hop < self.hop_limit
    }

    /// Drop dedup entries older than the TTL. Runs on a timer.
    pub fn sweep(&self) {
        let cutoff = now().saturating_sub(BROADCAST_DEDUP_TTL);
        let mut dedup = self.dedup.lock().unwrap();
        let before = dedup.len();
        dedup.purge_older_than(cutoff);
        let after = dedup.len();
        if after < before {
            debug!(purged = before - after, retained = after, "swept broadcast dedup cache");
        }

        let req_cutoff = now().saturating_sub(BROADCAST_DEDUP_TTL);
        self.local_requests
            .lock()
            .unwrap()
            .retain(|_, t| *t >= req_cutoff);
    }

    /// Admin-initiated broadcast dedup; false when this payload was
    /// already submitted recently.
    pub fn register_local_request(&self, hash: [u8; 32]) -> bool {
        let mut requests = self.local_requests.lock().unwrap();
        if requests.contains_key(&hash) {
            return false;
        }
        requests.insert(hash, now());
        true
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.lock().unwrap().len()
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    pub fn note_received(&self, bytes: usize, has_receiver: bool) {
        self.broadcast_bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.msgs_in.fetch_add(1, Ordering::Relaxed);
        if has_receiver {
            self.rta_msgs_p2p.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn note_relayed(&self, bytes: usize, fanout: usize) {
        self.broadcast_bytes_out
            .fetch_add((bytes * fanout) as u64, Ordering::Relaxed);
        self.msgs_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_local_posts(&self, posts: usize) {
        self.rta_msgs_local.fetch_add(posts as u64, Ordering::Relaxed);
    }

    pub fn broadcast_bytes_in(&self) -> u64 {
        self.broadcast_bytes_in.load(Ordering::Relaxed)
    }

    pub fn broadcast_bytes_out(&self) -> u64 {
        self.broadcast_bytes_out.load(Ordering::Relaxed)
    }

    pub fn msgs_in(&self) -> u64 {
        self.msgs_in.load(Ordering::Relaxed)
    }

    pub fn msgs_relayed(&self) -> u64 {
        self.msgs_relayed.load(Ordering::Relaxed)
    }

    pub fn rta_msgs_p2p(&self) -> u64 {
        self.rta_msgs_p2p.load(Ordering::Relaxed)
    }

    pub fn rta_msgs_local(&self) -> u64 {
        self.rta_msgs_local.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> [u8; 32] {
        let mut h = [0u8; 32];
        h[0] = n;
        h
    }

    #[test]
    fn duplicate_sightings_are_rejected() {
        let engine = BroadcastEngine::new();
        assert!(engine.first_sighting("1.1.1.1:1", hash(1)));
        assert!(!engine.first_sighting("1.1.1.1:1", hash(1)));
        // Same hash from a different sender is a distinct key.
        assert!(engine.first_sighting("2.2.2.2:1", hash(1)));
    }

    #[test]
    fn hop_limit_boundary() {
        let engine = BroadcastEngine::with_hop_limit(4);
        assert!(engine.should_relay(0));
        assert!(engine.should_relay(3));
        assert!(!engine.should_relay(4));
        assert!(!engine.should_relay(5));
    }

    #[test]
    fn cache_cap_purges_oldest_first() {
        let mut cache = DedupCache::default();
        for i in 0..DEDUP_CAP + 1 {
            let key = (format!("sender-{i}"), hash(0));
            assert!(cache.insert(key, i as u64));
        }
        assert_eq!(cache.len(), DEDUP_CAP);
        // The first key was evicted, so it inserts again.
        assert!(cache.insert(("sender-0".to_string(), hash(0)), DEDUP_CAP as u64 + 1));
    }

    #[test]
    fn ttl_purge_removes_only_aged_entries() {
        let mut cache = DedupCache::default();
        cache.insert(("a".to_string(), hash(1)), 100);
        cache.insert(("b".to_string(), hash(2)), 200);
        cache.purge_older_than(150);
        assert_eq!(cache.len(), 1);
        assert!(!cache.insert(("b".to_string(), hash(2)), 201));
        assert!(cache.insert(("a".to_string(), hash(1)), 201));
    }

    #[test]
    fn message_hash_is_stable_and_input_sensitive() {
        let a = BroadcastEngine::message_hash(b"payload");
        let b = BroadcastEngine::message_hash(b"payload");
        let c = BroadcastEngine::message_hash(b"payload!");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn local_request_cache_dedups_admin_broadcasts() {
        let engine = BroadcastEngine::new();
        assert!(engine.register_local_request(hash(7)));
        assert!(!engine.register_local_request(hash(7)));
    }
}
