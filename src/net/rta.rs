//! RTA redirection registry.
//!
//! Local "supernode" service daemons register themselves over the admin
//! RPC and receive forwarded broadcast messages addressed to them. The
//! registry maps opaque recipient ids to one or more locally registered
//! supernodes, with expiry on both the supernode items and the redirect
//! records. Expiry is enforced lazily on the lookup path; no separate
//! reaper runs.
//!
//! Invariant: every redirect record points at a present, unexpired
//! supernode item. A record whose target was evicted is removed, and a
//! recipient id with no records left is removed.
//!
//! The registry mutex is never held across an HTTP call: items resolved
//! under the lock are cheap clones (the HTTP client is internally
//! reference-counted) that survive concurrent eviction.

use crate::error::{NetError, Result};
use crate::net::types::{BroadcastMessage, SUPERNODE_HTTP_TIMEOUT};
use reqwest::{Client, Url};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One registered local supernode. Clones share the HTTP client.
#[derive(Debug, Clone)]
pub struct SupernodeItem {
    pub id: String,
    /// Base URL posts go to; the JSON-RPC method name is appended.
    base_url: String,
    /// Redirection URI for the UDHT protocol, relayed as registered.
    pub redirect_uri: String,
    pub redirect_timeout_ms: u64,
    expiry: Instant,
    client: Client,
}

impl SupernodeItem {
    fn is_expired(&self, at: Instant) -> bool {
        self.expiry <= at
    }
}

#[derive(Debug)]
struct RedirectRecord {
    supernode_id: String,
    expiry: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    local_sns: HashMap<String, SupernodeItem>,
    /// recipient id → redirect records, in registration order.
    redirects: HashMap<String, Vec<RedirectRecord>>,
}

#[derive(Debug, Default)]
pub struct RtaRegistry {
    inner: Mutex<Inner>,
}

impl RtaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a local supernode item. A previous HTTP client for
    /// the same id is dropped (disconnected); the expiry advances.
    pub fn register_supernode(
        &self,
        id: &str,
        url: &str,
        redirect_uri: &str,
        redirect_timeout_ms: u64,
    ) -> Result<()> {
        if id.is_empty() {
            return Err(NetError::Config("empty supernode id".into()));
        }
        let parsed = Url::parse(url)
            .map_err(|e| NetError::Config(format!("supernode url {url:?}: {e}")))?;
        if parsed.host_str().is_none() {
            return Err(NetError::Config(format!("supernode url {url:?} has no host")));
        }
        let client = Client::builder()
            .timeout(SUPERNODE_HTTP_TIMEOUT)
            .build()
            .map_err(|e| NetError::Config(format!("http client: {e}")))?;

        debug!(id, url, "registering supernode");
        let item = SupernodeItem {
            id: id.to_string(),
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            redirect_uri: redirect_uri.to_string(),
            redirect_timeout_ms,
            expiry: Instant::now() + Duration::from_millis(redirect_timeout_ms),
            client,
        };
        self.inner.lock().unwrap().local_sns.insert(id.to_string(), item);
        Ok(())
    }

    /// Append or refresh a redirect record for `recipient_id` pointing at
    /// the local supernode `supernode_id`. Also refreshes the supernode
    /// item's own expiry.
    pub fn add_route(&self, recipient_id: &str, supernode_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let expiry = {
            let item = inner
                .local_sns
                .get_mut(supernode_id)
                .ok_or_else(|| NetError::UnknownSupernode(supernode_id.to_string()))?;
            let expiry = Instant::now() + Duration::from_millis(item.redirect_timeout_ms);
            item.expiry = expiry;
            expiry
        };

        let records = inner.redirects.entry(recipient_id.to_string()).or_default();
        match records.iter_mut().find(|r| r.supernode_id == supernode_id) {
            Some(record) => record.expiry = expiry,
            None => records.push(RedirectRecord {
                supernode_id: supernode_id.to_string(),
                expiry,
            }),
        }
        Ok(())
    }

    /// Resolve a recipient id to its live supernode items. Expired items
    /// and orphaned redirect records found along the way are removed.
    pub fn lookup(&self, recipient_id: &str) -> Vec<SupernodeItem> {
        let at = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let Some(records) = inner.redirects.remove(recipient_id) else {
            return Vec::new();
        };

        let mut resolved = Vec::new();
        let mut kept = Vec::new();
        let mut dead_sns = Vec::new();
        for record in records {
            match inner.local_sns.get(&record.supernode_id) {
                Some(item) if item.is_expired(at) => dead_sns.push(record.supernode_id),
                Some(item) if record.expiry > at => {
                    resolved.push(item.clone());
                    kept.push(record);
                }
                // Expired record with a live target, or orphaned record.
                _ => {}
            }
        }
        if !kept.is_empty() {
            inner.redirects.insert(recipient_id.to_string(), kept);
        }
        for id in dead_sns {
            remove_supernode_locked(&mut inner, &id);
        }
        resolved
    }

    /// Returns the id if the supernode exists and has not expired; an
    /// expired item is fully cleaned up together with every redirect
    /// record referencing it.
    pub fn check_supernode_id(&self, id: &str) -> Option<String> {
        if id.is_empty() {
            warn!("empty supernode id passed");
            return None;
        }
        let at = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let item = inner.local_sns.get(id)?;
        if item.is_expired(at) {
            remove_supernode_locked(&mut inner, id);
            return None;
        }
        Some(id.to_string())
    }

    /// Every live supernode item; expired ones are evicted on the way.
    pub fn all_supernodes(&self) -> Vec<SupernodeItem> {
        let at = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let dead: Vec<String> = inner
            .local_sns
            .values()
            .filter(|item| item.is_expired(at))
            .map(|item| item.id.clone())
            .collect();
        for id in &dead {
            remove_supernode_locked(&mut inner, id);
        }
        inner.local_sns.values().cloned().collect()
    }

    pub fn supernode_count(&self) -> usize {
        self.inner.lock().unwrap().local_sns.len()
    }

    // -------------------------------------------------------------------------
    // Forwarding
    // -------------------------------------------------------------------------

    /// POST a broadcast to its local recipients: the resolved supernodes
    /// when a receiver id is present, every registered supernode
    /// otherwise. Returns the number of successful posts. Iteration order
    /// over supernodes is unspecified.
    pub async fn post_broadcast(&self, msg: &BroadcastMessage) -> usize {
        let targets = match msg.receiver_id.as_deref() {
            Some(recipient) => self.lookup(recipient),
            None => self.all_supernodes(),
        };
        if targets.is_empty() {
            return 0;
        }

        let params = BroadcastParams {
            sender_address: &msg.sender_address,
            message_hash: hex::encode(msg.message_hash),
            hop: msg.hop,
            timestamp: msg.timestamp,
            receiver_id: msg.receiver_id.as_deref(),
            data: hex::encode(&msg.data),
        };

        let posts = targets.iter().map(|item| post_json_rpc(item, "broadcast", &params));
        futures::future::join_all(posts)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    #[cfg(test)]
    fn route_len(&self, recipient_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .redirects
            .get(recipient_id)
            .map(|r| r.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn has_recipient(&self, recipient_id: &str) -> bool {
        self.inner.lock().unwrap().redirects.contains_key(recipient_id)
    }
}

fn remove_supernode_locked(inner: &mut Inner, id: &str) {
    debug!(id, "evicting expired supernode and its redirect records");
    inner.local_sns.remove(id);
    inner.redirects.retain(|_, records| {
        records.retain(|r| r.supernode_id != id);
        !records.is_empty()
    });
}

/// The body is wrapped in a JSON-RPC 2.0 envelope; the original transport
/// did this on every post and supernodes expect it.
#[derive(Debug, Serialize)]
struct BroadcastParams<'a> {
    sender_address: &'a str,
    message_hash: String,
    hop: u32,
    timestamp: u64,
    receiver_id: Option<&'a str>,
    data: String,
}

async fn post_json_rpc(item: &SupernodeItem, method: &str, params: &BroadcastParams<'_>) -> bool {
    let envelope = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 0,
        "method": method,
        "params": params,
    });
    let url = format!("{}/{}", item.base_url, method);
    match item.client.post(&url).json(&envelope).send().await {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            warn!(id = %item.id, %url, status = %resp.status(), "supernode rejected post");
            false
        }
        Err(e) => {
            warn!(id = %item.id, %url, "supernode post failed: {e}");
            false
        }
    }
}
