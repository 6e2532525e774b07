//! Three-tier address book: anchor / white / gray.
//!
//! - *Anchor*: peers we completed a handshake with recently; persisted for
//!   fast reconnect after restart.
//! - *White*: peers we successfully connected to at some point.
//! - *Gray*: addresses learned by gossip, not yet verified.
//!
//! An address lives in exactly one tier at a time. Promotion gray→white
//! happens on successful contact, white→anchor on a completed handshake,
//! demotion white→gray on sustained failure. All tiers are capped: white
//! evicts least-recently-seen, gray evicts uniformly at random, anchor
//! evicts its oldest entry.

use crate::error::{NetError, Result};
use crate::net::types::{
    PeerlistEntry, ANCHOR_CAP, GRAY_CAP, N_FAIL_DROP, SAMPLE_BIAS_K, WHITE_CAP,
};
use crate::types::{now, PeerAddress, PeerId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Anchor,
    White,
    Gray,
}

/// Current persistence version. Version 0 additionally carried the node's
/// own peer id; it is read and dropped for compatibility.
const STORE_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct StoredPeerlistV1 {
    anchor: Vec<PeerlistEntry>,
    white: Vec<PeerlistEntry>,
    gray: Vec<PeerlistEntry>,
}

#[derive(Serialize, Deserialize)]
struct StoredPeerlistV0 {
    peer_id: PeerId,
    anchor: Vec<PeerlistEntry>,
    white: Vec<PeerlistEntry>,
    gray: Vec<PeerlistEntry>,
}

#[derive(Debug, Default)]
pub struct Peerlist {
    anchor: Vec<PeerlistEntry>,
    white: Vec<PeerlistEntry>,
    gray: Vec<PeerlistEntry>,
    index: HashMap<PeerAddress, Tier>,
    fail_counts: HashMap<PeerAddress, u32>,
}

impl Peerlist {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Serialize to the versioned blob. Entry order is preserved, so
    /// persist → load → persist is byte-identical.
    pub fn persist(&self) -> Result<Vec<u8>> {
        let stored = StoredPeerlistV1 {
            anchor: self.anchor.clone(),
            white: self.white.clone(),
            gray: self.gray.clone(),
        };
        let mut blob = vec![STORE_VERSION];
        let body = bincode::serialize(&stored)
            .map_err(|e| NetError::Persistence(e.to_string()))?;
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    pub fn load(blob: &[u8]) -> Result<Self> {
        let (version, body) = blob
            .split_first()
            .ok_or_else(|| NetError::Persistence("empty peerlist blob".into()))?;

        let (anchor, white, gray) = match version {
            0 => {
                let stored: StoredPeerlistV0 = bincode::deserialize(body)
                    .map_err(|e| NetError::Persistence(e.to_string()))?;
                // v0 stored the node's own peer id; dropped since v1.
                (stored.anchor, stored.white, stored.gray)
            }
            1 => {
                let stored: StoredPeerlistV1 = bincode::deserialize(body)
                    .map_err(|e| NetError::Persistence(e.to_string()))?;
                (stored.anchor, stored.white, stored.gray)
            }
            v => {
                return Err(NetError::Persistence(format!("unknown peerlist version {v}")));
            }
        };

        let mut list = Self::new();
        for e in anchor {
            if !list.index.contains_key(&e.adr) {
                list.index.insert(e.adr, Tier::Anchor);
                list.anchor.push(e);
            }
        }
        for e in white {
            if !list.index.contains_key(&e.adr) {
                list.index.insert(e.adr, Tier::White);
                list.white.push(e);
            }
        }
        for e in gray {
            if !list.index.contains_key(&e.adr) {
                list.index.insert(e.adr, Tier::Gray);
                list.gray.push(e);
            }
        }
        Ok(list)
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Record a successful contact. Unknown addresses enter white; gray
    /// entries are promoted to white.
    pub fn record_seen(&mut self, adr: PeerAddress, id: PeerId, last_seen: u64) {
        self.fail_counts.remove(&adr);
        match self.index.get(&adr).copied() {
            Some(Tier::Gray) => {
                let mut entry = self.take_from(Tier::Gray, adr)
                    .unwrap_or_else(|| PeerlistEntry::new(adr, id));
                entry.last_seen = entry.last_seen.max(last_seen);
                if id != 0 {
                    entry.id = id;
                }
                self.insert_white(entry);
            }
            Some(tier) => {
                if let Some(entry) = self.entry_mut(tier, adr) {
                    entry.last_seen = entry.last_seen.max(last_seen);
                    if id != 0 {
                        entry.id = id;
                    }
                }
            }
            None => {
                let mut entry = PeerlistEntry::new(adr, id);
                entry.last_seen = last_seen;
                self.insert_white(entry);
            }
        }
    }

    /// Move an address into the anchor tier after a completed handshake.
    pub fn promote_anchor(&mut self, adr: PeerAddress, id: PeerId) {
        let mut entry = match self.index.get(&adr).copied() {
            Some(tier) => self.take_from(tier, adr).unwrap_or_else(|| PeerlistEntry::new(adr, id)),
            None => PeerlistEntry::new(adr, id),
        };
        entry.last_seen = now();
        if id != 0 {
            entry.id = id;
        }
        self.insert_anchor(entry);
    }

    /// Record a failed contact. After `N_FAIL_DROP` consecutive failures
    /// an anchor/white entry is demoted to gray.
    pub fn mark_fail(&mut self, adr: PeerAddress) {
        let count = self.fail_counts.entry(adr).or_insert(0);
        *count += 1;
        if *count < N_FAIL_DROP {
            return;
        }
        self.fail_counts.remove(&adr);
        match self.index.get(&adr).copied() {
            Some(tier @ (Tier::Anchor | Tier::White)) => {
                if let Some(entry) = self.take_from(tier, adr) {
                    debug!(%adr, "demoting peer to gray after repeated failures");
                    self.insert_gray(entry);
                }
            }
            _ => {}
        }
    }

    /// Merge a gossiped peerlist. The sender's clock skew is corrected via
    /// `delta = local_time - sender_time`; future timestamps are clamped
    /// to local time. Unknown addresses enter gray.
    pub fn merge_gossip(&mut self, list: &[PeerlistEntry], sender_time: u64) -> usize {
        if list.is_empty() {
            return 0;
        }
        let local_time = now();
        let delta = local_time as i64 - sender_time as i64;
        let mut added = 0;

        for remote in list {
            let adjusted = (remote.last_seen as i64 + delta).max(0) as u64;
            let last_seen = adjusted.min(local_time);

            match self.index.get(&remote.adr).copied() {
                Some(tier) => {
                    if let Some(entry) = self.entry_mut(tier, remote.adr) {
                        entry.last_seen = entry.last_seen.max(last_seen);
                        if remote.id != 0 {
                            entry.id = remote.id;
                        }
                        if remote.rpc_port.is_some() {
                            entry.rpc_port = remote.rpc_port;
                        }
                    }
                }
                None => {
                    let mut entry = remote.clone();
                    entry.last_seen = last_seen;
                    self.insert_gray(entry);
                    added += 1;
                }
            }
        }
        added
    }

    pub fn remove(&mut self, adr: PeerAddress) {
        if let Some(tier) = self.index.get(&adr).copied() {
            self.take_from(tier, adr);
        }
        self.fail_counts.remove(&adr);
    }

    // -------------------------------------------------------------------------
    // Sampling
    // -------------------------------------------------------------------------

    pub fn sample_white(&self, exclude: &HashSet<PeerAddress>) -> Option<PeerlistEntry> {
        Self::sample_biased(&self.white, exclude)
    }

    pub fn sample_gray(&self, exclude: &HashSet<PeerAddress>) -> Option<PeerlistEntry> {
        Self::sample_biased(&self.gray, exclude)
    }

    pub fn sample_anchor(&self, exclude: &HashSet<PeerAddress>) -> Option<PeerlistEntry> {
        Self::sample_biased(&self.anchor, exclude)
    }

    /// Uniformly random gray entry, for housekeeping probes.
    pub fn random_gray(&self, exclude: &HashSet<PeerAddress>) -> Option<PeerlistEntry> {
        let candidates: Vec<&PeerlistEntry> =
            self.gray.iter().filter(|e| !exclude.contains(&e.adr)).collect();
        if candidates.is_empty() {
            return None;
        }
        let mut rng = ChaCha20Rng::from_entropy();
        Some(candidates[rng.gen_range(0..candidates.len())].clone())
    }

    /// Random slice of the verified peers (anchor and white tiers) for
    /// handshake / timed-sync replies.
    pub fn white_slice(&self, max: usize) -> Vec<PeerlistEntry> {
        let mut rng = ChaCha20Rng::from_entropy();
        let mut result: Vec<PeerlistEntry> =
            self.anchor.iter().chain(self.white.iter()).cloned().collect();
        for i in (1..result.len()).rev() {
            let j = rng.gen_range(0..=i);
            result.swap(i, j);
        }
        result.truncate(max);
        result
    }

    /// Freshness-biased pick: entries sorted by last_seen descending, then
    /// `index = floor(rand^K * len)` with K > 1. Fresh entries are favored
    /// but any entry remains reachable.
    fn sample_biased(
        tier: &[PeerlistEntry],
        exclude: &HashSet<PeerAddress>,
    ) -> Option<PeerlistEntry> {
        let mut candidates: Vec<&PeerlistEntry> =
            tier.iter().filter(|e| !exclude.contains(&e.adr)).collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

        let mut rng = ChaCha20Rng::from_entropy();
        let r: f64 = rng.gen_range(0.0..1.0);
        let idx = ((r.powf(SAMPLE_BIAS_K) * candidates.len() as f64) as usize)
            .min(candidates.len() - 1);
        Some(candidates[idx].clone())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn tier_of(&self, adr: &PeerAddress) -> Option<Tier> {
        self.index.get(adr).copied()
    }

    pub fn contains(&self, adr: &PeerAddress) -> bool {
        self.index.contains_key(adr)
    }

    pub fn white_len(&self) -> usize {
        self.white.len()
    }

    pub fn gray_len(&self) -> usize {
        self.gray.len()
    }

    pub fn anchor_len(&self) -> usize {
        self.anchor.len()
    }

    pub fn anchor_entries(&self) -> &[PeerlistEntry] {
        &self.anchor
    }

    #[cfg(feature = "debug-commands")]
    pub fn white_entries(&self) -> &[PeerlistEntry] {
        &self.white
    }

    #[cfg(feature = "debug-commands")]
    pub fn gray_entries(&self) -> &[PeerlistEntry] {
        &self.gray
    }

    // -------------------------------------------------------------------------
    // Tier plumbing. The index is updated before any vec mutation so an
    // address can never be referenced by two tiers.
    // -------------------------------------------------------------------------

    fn entry_mut(&mut self, tier: Tier, adr: PeerAddress) -> Option<&mut PeerlistEntry> {
        let vec = match tier {
            Tier::Anchor => &mut self.anchor,
            Tier::White => &mut self.white,
            Tier::Gray => &mut self.gray,
        };
        vec.iter_mut().find(|e| e.adr == adr)
    }

    fn take_from(&mut self, tier: Tier, adr: PeerAddress) -> Option<PeerlistEntry> {
        self.index.remove(&adr);
        let vec = match tier {
            Tier::Anchor => &mut self.anchor,
            Tier::White => &mut self.white,
            Tier::Gray => &mut self.gray,
        };
        let pos = vec.iter().position(|e| e.adr == adr)?;
        Some(vec.remove(pos))
    }

    fn insert_white(&mut self, entry: PeerlistEntry) {
        self.remove(entry.adr);
        if self.white.len() >= WHITE_CAP {
            // Evict least recently seen.
            if let Some(pos) = self
                .white
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(i, _)| i)
            {
                let evicted = self.white.remove(pos);
                self.index.remove(&evicted.adr);
            }
        }
        self.index.insert(entry.adr, Tier::White);
        self.white.push(entry);
    }

    fn insert_gray(&mut self, entry: PeerlistEntry) {
        self.remove(entry.adr);
        if self.gray.len() >= GRAY_CAP {
            let mut rng = ChaCha20Rng::from_entropy();
            let pos = rng.gen_range(0..self.gray.len());
            let evicted = self.gray.remove(pos);
            self.index.remove(&evicted.adr);
        }
        self.index.insert(entry.adr, Tier::Gray);
        self.gray.push(entry);
    }

    fn insert_anchor(&mut self, entry: PeerlistEntry) {
        self.remove(entry.adr);
        if self.anchor.len() >= ANCHOR_CAP {
            let evicted = self.anchor.remove(0);
            self.index.remove(&evicted.adr);
        }
        self.index.insert(entry.adr, Tier::Anchor);
        self.anchor.push(entry);
    }
}

// =============================================================================
// PERSISTENCE STORE
// =============================================================================

/// Where the opaque peerlist blob lives. The node only ever hands a blob
/// over; the format behind this trait is its own concern.
pub trait PeerlistStore: Send + Sync + 'static {
    fn save(&self, blob: &[u8]) -> Result<()>;
    fn load(&self) -> Result<Option<Vec<u8>>>;
}

/// Blob in a single file under the data directory.
#[derive(Debug)]
pub struct FilePeerlistStore {
    path: std::path::PathBuf,
}

impl FilePeerlistStore {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            path: data_dir.join("peerlist.bin"),
        }
    }
}

impl PeerlistStore for FilePeerlistStore {
    fn save(&self, blob: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| NetError::Persistence(e.to_string()))?;
        }
        std::fs::write(&self.path, blob).map_err(|e| NetError::Persistence(e.to_string()))
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        std::fs::read(&self.path)
            .map(Some)
            .map_err(|e| NetError::Persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn adr(a: u8, b: u8) -> PeerAddress {
        PeerAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, a, b)), 28680)
    }

    #[test]
    fn record_seen_inserts_into_white() {
        let mut pl = Peerlist::new();
        pl.record_seen(adr(0, 1), 42, now());
        assert_eq!(pl.tier_of(&adr(0, 1)), Some(Tier::White));
        assert_eq!(pl.white_len(), 1);
    }

    #[test]
    fn gossip_then_contact_promotes_gray_to_white() {
        let mut pl = Peerlist::new();
        let t = now();
        pl.merge_gossip(&[PeerlistEntry::new(adr(0, 2), 7)], t);
        assert_eq!(pl.tier_of(&adr(0, 2)), Some(Tier::Gray));

        pl.record_seen(adr(0, 2), 7, t);
        assert_eq!(pl.tier_of(&adr(0, 2)), Some(Tier::White));
        assert_eq!(pl.gray_len(), 0);
    }

    #[test]
    fn address_lives_in_exactly_one_tier() {
        let mut pl = Peerlist::new();
        let a = adr(1, 1);
        pl.merge_gossip(&[PeerlistEntry::new(a, 1)], now());
        pl.record_seen(a, 1, now());
        pl.promote_anchor(a, 1);

        let present = [
            pl.anchor.iter().any(|e| e.adr == a),
            pl.white.iter().any(|e| e.adr == a),
            pl.gray.iter().any(|e| e.adr == a),
        ];
        assert_eq!(present.iter().filter(|p| **p).count(), 1);
        assert_eq!(pl.tier_of(&a), Some(Tier::Anchor));
    }

    #[test]
    fn repeated_failures_demote_white_to_gray() {
        let mut pl = Peerlist::new();
        let a = adr(2, 1);
        pl.record_seen(a, 1, now());
        for _ in 0..N_FAIL_DROP {
            pl.mark_fail(a);
        }
        assert_eq!(pl.tier_of(&a), Some(Tier::Gray));
    }

    #[test]
    fn success_resets_fail_count() {
        let mut pl = Peerlist::new();
        let a = adr(2, 2);
        pl.record_seen(a, 1, now());
        pl.mark_fail(a);
        pl.mark_fail(a);
        pl.record_seen(a, 1, now());
        pl.mark_fail(a);
        // Two failures after the reset are below the threshold.
        pl.mark_fail(a);
        assert_eq!(pl.tier_of(&a), Some(Tier::White));
    }

    #[test]
    fn merge_gossip_empty_is_noop() {
        let mut pl = Peerlist::new();
        pl.record_seen(adr(3, 1), 1, now());
        let before = pl.persist().unwrap();
        assert_eq!(pl.merge_gossip(&[], 12345), 0);
        assert_eq!(pl.persist().unwrap(), before);
    }

    #[test]
    fn merge_gossip_clamps_future_timestamps() {
        let mut pl = Peerlist::new();
        let local = now();
        let mut remote = PeerlistEntry::new(adr(3, 2), 9);
        // Sender claims to have seen this peer an hour into our future.
        remote.last_seen = local + 3600;
        pl.merge_gossip(&[remote], local);

        let stored = pl.gray.iter().find(|e| e.adr == adr(3, 2)).unwrap();
        assert!(stored.last_seen <= now());
    }

    #[test]
    fn merge_gossip_fixes_sender_clock_skew() {
        let mut pl = Peerlist::new();
        let local = now();
        // Sender's clock runs 1000 s ahead; its entry was seen "500 s ago".
        let sender_time = local + 1000;
        let mut remote = PeerlistEntry::new(adr(3, 3), 9);
        remote.last_seen = sender_time - 500;
        pl.merge_gossip(&[remote], sender_time);

        let stored = pl.gray.iter().find(|e| e.adr == adr(3, 3)).unwrap();
        let age = now().saturating_sub(stored.last_seen);
        assert!((498..=503).contains(&age), "age after skew fix: {age}");
    }

    #[test]
    fn gray_cap_is_enforced() {
        let mut pl = Peerlist::new();
        let t = now();
        let entries: Vec<PeerlistEntry> = (0..(GRAY_CAP + 50))
            .map(|i| {
                let ip = IpAddr::V4(Ipv4Addr::new(
                    11,
                    (i >> 16) as u8,
                    (i >> 8) as u8,
                    i as u8,
                ));
                PeerlistEntry::new(PeerAddress::new(ip, 28680), i as u64 + 1)
            })
            .collect();
        pl.merge_gossip(&entries, t);
        assert_eq!(pl.gray_len(), GRAY_CAP);
    }

    #[test]
    fn white_evicts_least_recently_seen() {
        let mut pl = Peerlist::new();
        let t = now();
        for i in 0..WHITE_CAP {
            let ip = IpAddr::V4(Ipv4Addr::new(12, (i >> 16) as u8, (i >> 8) as u8, i as u8));
            pl.record_seen(PeerAddress::new(ip, 28680), i as u64 + 1, t + i as u64);
        }
        let oldest = PeerAddress::new(IpAddr::V4(Ipv4Addr::new(12, 0, 0, 0)), 28680);
        assert!(pl.contains(&oldest));

        pl.record_seen(adr(9, 9), 999, t + WHITE_CAP as u64 + 1);
        assert_eq!(pl.white_len(), WHITE_CAP);
        assert!(!pl.contains(&oldest));
        assert!(pl.contains(&adr(9, 9)));
    }

    #[test]
    fn persist_load_persist_is_byte_identical() {
        let mut pl = Peerlist::new();
        let t = now();
        for i in 0..20u8 {
            pl.record_seen(adr(4, i), i as u64 + 1, t + i as u64);
        }
        pl.promote_anchor(adr(4, 3), 4);
        pl.merge_gossip(&[PeerlistEntry::new(adr(5, 1), 77)], t);

        let first = pl.persist().unwrap();
        let reloaded = Peerlist::load(&first).unwrap();
        let second = reloaded.persist().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn version_zero_blob_is_tolerated() {
        let stored = StoredPeerlistV0 {
            peer_id: 0xdead_beef,
            anchor: vec![],
            white: vec![PeerlistEntry::new(adr(6, 1), 3)],
            gray: vec![PeerlistEntry::new(adr(6, 2), 0)],
        };
        let mut blob = vec![0u8];
        blob.extend_from_slice(&bincode::serialize(&stored).unwrap());

        let pl = Peerlist::load(&blob).unwrap();
        assert_eq!(pl.white_len(), 1);
        assert_eq!(pl.gray_len(), 1);

        // Re-persisting writes the current version, without the peer id.
        let reblob = pl.persist().unwrap();
        assert_eq!(reblob[0], STORE_VERSION);
    }

    #[test]
    fn unknown_version_is_persistence_error() {
        assert!(matches!(
            Peerlist::load(&[9u8, 0, 0]),
            Err(NetError::Persistence(_))
        ));
    }

    #[test]
    fn sampling_honors_exclusions() {
        let mut pl = Peerlist::new();
        pl.record_seen(adr(7, 1), 1, now());
        pl.record_seen(adr(7, 2), 2, now());

        let mut exclude = HashSet::new();
        exclude.insert(adr(7, 1));
        for _ in 0..50 {
            let picked = pl.sample_white(&exclude).unwrap();
            assert_eq!(picked.adr, adr(7, 2));
        }
        exclude.insert(adr(7, 2));
        assert!(pl.sample_white(&exclude).is_none());
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("rtanode_plstore_{}", std::process::id()));
        let store = FilePeerlistStore::new(&dir);
        assert!(store.load().unwrap().is_none());

        let mut pl = Peerlist::new();
        pl.record_seen(adr(10, 1), 5, now());
        let blob = pl.persist().unwrap();
        store.save(&blob).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, blob);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn white_slice_is_bounded() {
        let mut pl = Peerlist::new();
        for i in 0..40u8 {
            pl.record_seen(adr(8, i), i as u64 + 1, now());
        }
        assert_eq!(pl.white_slice(10).len(), 10);
        assert_eq!(pl.white_slice(100).len(), 40);
    }
}
