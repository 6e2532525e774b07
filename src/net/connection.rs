//! Blocklist, fail cache, host fail scores, and the connection map.
//!
//! Each cache has its own mutex and none is ever held across I/O. The
//! connection map is sharded by connection-id hash; the shard lock is held
//! only for insert/erase/lookup.

use crate::net::transport::{ConnState, Connection, Direction};
use crate::net::types::{FAIL_COOLDOWN, FAIL_SCORE_LIMIT};
use crate::types::{now, ConnId, PeerAddress};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

// =============================================================================
// BLOCKLIST
// =============================================================================

/// Host → unblock deadline. Blocking is manual (admin API) or triggered by
/// the host fail score; entries expire lazily.
#[derive(Debug, Default)]
pub struct Blocklist {
    hosts: Mutex<HashMap<String, u64>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, host: &str, seconds: u64) {
        let until = now().saturating_add(seconds);
        info!(host, until, "blocking host");
        self.hosts.lock().unwrap().insert(host.to_string(), until);
    }

    pub fn unblock(&self, host: &str) -> bool {
        self.hosts.lock().unwrap().remove(host).is_some()
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        let mut hosts = self.hosts.lock().unwrap();
        match hosts.get(host) {
            Some(&until) if now() < until => true,
            Some(_) => {
                hosts.remove(host);
                false
            }
            None => false,
        }
    }

    /// Current entries, expired ones removed.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let t = now();
        let mut hosts = self.hosts.lock().unwrap();
        hosts.retain(|_, until| *until > t);
        hosts.iter().map(|(h, u)| (h.clone(), *u)).collect()
    }
}

// =============================================================================
// FAIL CACHE
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct FailInfo {
    count: u32,
    last_fail: u64,
}

/// Address → failure bookkeeping. A failed address is avoided until the
/// cooldown elapses.
#[derive(Debug, Default)]
pub struct FailCache {
    addrs: Mutex<HashMap<PeerAddress, FailInfo>>,
}

impl FailCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fail(&self, adr: PeerAddress) {
        let mut addrs = self.addrs.lock().unwrap();
        let info = addrs.entry(adr).or_default();
        info.count += 1;
        info.last_fail = now();
        debug!(%adr, count = info.count, "cached connection failure");
    }

    /// Still inside the cooldown window?
    pub fn is_cooling(&self, adr: &PeerAddress) -> bool {
        let addrs = self.addrs.lock().unwrap();
        addrs
            .get(adr)
            .map(|info| now() < info.last_fail.saturating_add(FAIL_COOLDOWN))
            .unwrap_or(false)
    }

    pub fn clear(&self, adr: &PeerAddress) {
        self.addrs.lock().unwrap().remove(adr);
    }
}

// =============================================================================
// HOST FAIL SCORE
// =============================================================================

/// Per-host protocol-violation score. Reaching `FAIL_SCORE_LIMIT` means
/// the host should be blocklisted; the caller applies the block so the
/// lock order (score cache after blocklist) never inverts.
#[derive(Debug, Default)]
pub struct HostFailScore {
    scores: Mutex<HashMap<String, u64>>,
}

impl HostFailScore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the score; true when the host crossed the limit.
    pub fn bump(&self, host: &str) -> bool {
        let mut scores = self.scores.lock().unwrap();
        let score = scores.entry(host.to_string()).or_insert(0);
        *score += 1;
        debug!(host, score = *score, "host fail score raised");
        *score >= FAIL_SCORE_LIMIT
    }

    pub fn reset(&self, host: &str) {
        self.scores.lock().unwrap().remove(host);
    }
}

// =============================================================================
// CONNECTION MAP
// =============================================================================

const SHARD_COUNT: usize = 16;

/// All live connection records, sharded by connection-id hash.
pub struct ConnectionMap {
    shards: Vec<Mutex<HashMap<ConnId, Arc<Connection>>>>,
}

impl Default for ConnectionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: ConnId) -> &Mutex<HashMap<ConnId, Arc<Connection>>> {
        &self.shards[(id as usize) % SHARD_COUNT]
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.shard(conn.id).lock().unwrap().insert(conn.id, conn);
    }

    pub fn remove(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.shard(id).lock().unwrap().remove(&id)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.shard(id).lock().unwrap().get(&id).cloned()
    }

    /// Snapshot of every record; lock held per shard only while cloning
    /// the Arc handles.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.lock().unwrap().values().cloned());
        }
        out
    }

    pub fn established(&self) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.is_established())
            .collect()
    }

    /// Live (non-closed) connections in the given direction. Used against
    /// the out/in targets, so half-open attempts count too.
    pub fn count_active(&self, direction: Direction) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| c.direction == direction && c.state() != ConnState::Closed)
            .count()
    }

    pub fn count_established(&self, direction: Direction) -> usize {
        self.established()
            .iter()
            .filter(|c| c.direction == direction)
            .count()
    }

    pub fn total(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    /// Any live connection to this address?
    pub fn is_addr_connected(&self, adr: &PeerAddress) -> bool {
        self.snapshot()
            .iter()
            .any(|c| c.addr == *adr && c.state() != ConnState::Closed)
    }

    // -------------------------------------------------------------------------
    // Relay operations
    // -------------------------------------------------------------------------

    /// Best-effort notify to each listed connection id. Absent ids are
    /// skipped silently; returns the count actually sent.
    pub fn relay_to_list(&self, command: u32, body: &Bytes, ids: &[ConnId]) -> usize {
        let mut sent = 0;
        for &id in ids {
            if let Some(conn) = self.get(id) {
                if conn.is_established() && conn.notify(command, body.clone()).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Notify every established connection except the origin.
    pub fn relay_to_all_except(&self, command: u32, body: &Bytes, origin: ConnId) -> usize {
        let mut sent = 0;
        for conn in self.established() {
            if conn.id == origin {
                continue;
            }
            if conn.notify(command, body.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::{WriterMsg, WRITE_QUEUE_DEPTH};
    use tokio::sync::mpsc;

    fn conn(addr: &str, dir: Direction) -> (Arc<Connection>, mpsc::Receiver<WriterMsg>) {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        (Arc::new(Connection::new(addr.parse().unwrap(), dir, tx)), rx)
    }

    #[test]
    fn blocklist_expires_after_deadline() {
        let bl = Blocklist::new();
        bl.block("1.2.3.4", 0);
        // Zero-second block is already past its deadline.
        assert!(!bl.is_blocked("1.2.3.4"));

        bl.block("1.2.3.4", 60);
        assert!(bl.is_blocked("1.2.3.4"));
        assert!(bl.unblock("1.2.3.4"));
        assert!(!bl.is_blocked("1.2.3.4"));
    }

    #[test]
    fn fail_cache_cooldown_active_after_failure() {
        let fc = FailCache::new();
        let adr: PeerAddress = "1.2.3.4:1000".parse().unwrap();
        assert!(!fc.is_cooling(&adr));
        fc.record_fail(adr);
        assert!(fc.is_cooling(&adr));
        fc.clear(&adr);
        assert!(!fc.is_cooling(&adr));
    }

    #[test]
    fn host_fail_score_trips_at_limit() {
        let hs = HostFailScore::new();
        for _ in 0..FAIL_SCORE_LIMIT - 1 {
            assert!(!hs.bump("9.9.9.9"));
        }
        assert!(hs.bump("9.9.9.9"));
    }

    #[tokio::test]
    async fn relay_skips_absent_and_non_established() {
        let map = ConnectionMap::new();
        let (a, _rx_a) = conn("10.0.0.1:1", Direction::Outbound);
        let (b, _rx_b) = conn("10.0.0.2:1", Direction::Outbound);
        a.set_state(ConnState::Established);
        // b stays in Opening.
        map.insert(a.clone());
        map.insert(b.clone());

        let body = Bytes::from_static(b"x");
        let ids = [a.id, b.id, 0xdead_beef];
        assert_eq!(map.relay_to_list(1008, &body, &ids), 1);
    }

    #[tokio::test]
    async fn relay_to_all_excludes_origin() {
        let map = ConnectionMap::new();
        let mut keep = Vec::new();
        for i in 0..3 {
            let (c, rx) = conn(&format!("10.0.1.{i}:1"), Direction::Inbound);
            c.set_state(ConnState::Established);
            map.insert(c.clone());
            keep.push((c, rx));
        }
        let origin = keep[0].0.id;
        assert_eq!(map.relay_to_all_except(1008, &Bytes::new(), origin), 2);
    }
}
