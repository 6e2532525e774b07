//! The overlay node: accepts inbound connections, keeps the outbound
//! count at its target, drives handshakes and timed syncs, and owns the
//! shutdown sequence.
//!
//! Four timers drive maintenance:
//!
//! | timer | period | action |
//! |---|---|---|
//! | connect   | 1 s    | bring outbound count up to target |
//! | sync      | 60 s   | timed-sync every established outbound |
//! | gray      | 60 s   | probe one random gray entry |
//! | store     | 1800 s | persist the peerlist |
//!
//! Lock order: connection map → peer table → RTA registry → fail/block
//! caches. No lock is held across socket I/O or HTTP.

use crate::config::NetConfig;
use crate::error::{NetError, Result};
use crate::net::broadcast::BroadcastEngine;
use crate::net::connection::{Blocklist, ConnectionMap, FailCache, HostFailScore};
use crate::net::peerlist::{Peerlist, PeerlistStore};
use crate::net::rate_limit::SharedLimiter;
use crate::net::router;
use crate::net::rta::RtaRegistry;
use crate::net::transport::{ConnState, Connection, Direction, WriterMsg, WRITE_QUEUE_DEPTH};
use crate::net::types::{
    BasicNodeData, BroadcastMessage, BoundedVec, HandshakeRequest, HandshakeResponse,
    CMD_BROADCAST, CMD_HANDSHAKE, CONNECT_TICK, DEDUP_SWEEP_PERIOD, DRAIN_DEADLINE,
    GRAY_HOUSEKEEPING_PERIOD, GRAY_PROBE_TIMEOUT, HANDSHAKE_TIMEOUT, IP_BLOCKTIME,
    PEERLIST_SLICE, PEERLIST_STORE_PERIOD, PING_TIMEOUT, RC_OK, RC_UNSUPPORTED,
    SUPPORT_FLAG_RTA, TIMED_SYNC_PERIOD,
};
use crate::net::wire::{Frame, WireCodec};
use crate::types::{now, ConnId, PeerAddress, PeerId};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

/// Application hook. The node treats the payload as an opaque blob; block
/// and transaction logic lives behind this trait.
pub trait PayloadHandler: Send + Sync + 'static {
    /// Summary blob attached to our handshakes and timed syncs.
    fn current_payload(&self) -> Vec<u8> {
        Vec::new()
    }

    /// A peer's payload summary arrived with a handshake or timed sync.
    fn on_peer_payload(&self, _peer: &PeerAddress, _payload: &[u8]) {}

    /// A broadcast was accepted for local delivery.
    fn on_broadcast(&self, _msg: &BroadcastMessage) {}
}

/// Default handler for nodes running as pure relays.
pub struct NullPayloadHandler;

impl PayloadHandler for NullPayloadHandler {}

/// Point-in-time node statistics for the admin surface.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub peer_id: PeerId,
    pub out_connections: usize,
    pub in_connections: usize,
    pub white_size: usize,
    pub gray_size: usize,
    pub anchor_size: usize,
    pub broadcast_bytes_in: u64,
    pub broadcast_bytes_out: u64,
    pub rta_msgs_p2p: u64,
    pub rta_msgs_local: u64,
}

/// Cloneable handle to the running node.
#[derive(Clone)]
pub struct NodeServer {
    inner: Arc<NodeInner>,
}

pub struct NodeInner {
    pub(crate) config: NetConfig,
    pub(crate) peer_id: PeerId,
    pub(crate) peerlist: Mutex<Peerlist>,
    pub(crate) conns: ConnectionMap,
    pub(crate) blocklist: Blocklist,
    pub(crate) fail_cache: FailCache,
    pub(crate) host_fails: HostFailScore,
    pub(crate) rta: RtaRegistry,
    pub(crate) broadcast: BroadcastEngine,
    pub(crate) payload: Arc<dyn PayloadHandler>,
    store: Arc<dyn PeerlistStore>,
    limiter_up: SharedLimiter,
    limiter_down: SharedLimiter,
    is_closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    listen_port: AtomicU16,
}

impl NodeServer {
    /// Build a node. A broken peerlist blob is tolerated: the node starts
    /// with a fresh table.
    pub async fn new(
        config: NetConfig,
        payload: Arc<dyn PayloadHandler>,
        store: Arc<dyn PeerlistStore>,
    ) -> Result<Self> {
        let peerlist = match store.load() {
            Ok(Some(blob)) => match Peerlist::load(&blob) {
                Ok(list) => {
                    info!(
                        white = list.white_len(),
                        gray = list.gray_len(),
                        anchor = list.anchor_len(),
                        "loaded peerlist"
                    );
                    list
                }
                Err(e) => {
                    warn!("peerlist blob unreadable, starting fresh: {e}");
                    Peerlist::new()
                }
            },
            Ok(None) => Peerlist::new(),
            Err(e) => {
                warn!("peerlist store unreadable, starting fresh: {e}");
                Peerlist::new()
            }
        };

        // Non-zero random self-identifier; used for self-connection
        // detection.
        let peer_id = loop {
            let id: PeerId = rand::random();
            if id != 0 {
                break id;
            }
        };

        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(NodeInner {
            limiter_up: SharedLimiter::new(config.limit_rate_up_kb),
            limiter_down: SharedLimiter::new(config.limit_rate_down_kb),
            listen_port: AtomicU16::new(config.bind_port),
            config,
            peer_id,
            peerlist: Mutex::new(peerlist),
            conns: ConnectionMap::new(),
            blocklist: Blocklist::new(),
            fail_cache: FailCache::new(),
            host_fails: HostFailScore::new(),
            rta: RtaRegistry::new(),
            broadcast: BroadcastEngine::new(),
            payload,
            store,
            is_closing: AtomicBool::new(false),
            shutdown_tx,
        });

        // Addresses given on the command line enter the white list.
        {
            let mut pl = inner.peerlist.lock().await;
            for adr in &inner.config.peers {
                pl.record_seen(*adr, 0, now());
            }
        }

        Ok(Self { inner })
    }

    /// Bind the listener and start the maintenance timers. A bind failure
    /// is fatal and maps to the bind/listen exit code in main.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        info!(peer_id = format_args!("{:016x}", inner.peer_id), "starting p2p node");

        if inner.config.offline {
            info!("offline mode: no listener, no outbound connections");
            inner.clone().spawn_store_timer();
            inner.clone().spawn_sweep_timer();
            return Ok(());
        }

        let bind = (inner.config.bind_ip, inner.config.bind_port);
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        inner.listen_port.store(local.port(), Ordering::Relaxed);
        info!(%local, "p2p listener bound");

        inner.clone().spawn_accept_loop(listener);
        inner.clone().spawn_connect_timer();
        inner.clone().spawn_sync_timer();
        inner.clone().spawn_gray_timer();
        inner.clone().spawn_store_timer();
        inner.clone().spawn_sweep_timer();
        Ok(())
    }

    /// Graceful shutdown: stop accepting, drain established connections
    /// up to the deadline, persist the peerlist once more.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.is_closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down p2p node");
        let _ = inner.shutdown_tx.send(true);

        for conn in inner.conns.snapshot() {
            conn.set_state(ConnState::Draining);
            conn.begin_close();
        }
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while inner.conns.total() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }

        inner.persist_peerlist().await;
        info!("p2p node stopped");
    }

    // -------------------------------------------------------------------------
    // Admin / application surface
    // -------------------------------------------------------------------------

    pub fn rta(&self) -> &RtaRegistry {
        &self.inner.rta
    }

    pub fn engine(&self) -> &BroadcastEngine {
        &self.inner.broadcast
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Actual bound port (differs from the configured one when 0 was
    /// requested).
    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port.load(Ordering::Relaxed)
    }

    /// Originate a broadcast from this node: deliver to local supernodes
    /// and fan out to the overlay with hop 1. Repeated submissions of the
    /// same payload within the request-cache window are dropped. Returns
    /// the number of local posts.
    pub async fn broadcast(
        &self,
        sender_address: Option<String>,
        receiver_id: Option<String>,
        data: Vec<u8>,
    ) -> Result<usize> {
        let inner = &self.inner;
        let hash = BroadcastEngine::message_hash(&data);
        if !inner.broadcast.register_local_request(hash) {
            debug!("duplicate local broadcast suppressed");
            return Ok(0);
        }

        let sender = sender_address.unwrap_or_else(|| {
            format!("{}:{}", inner.config.bind_ip, self.listen_port())
        });
        let msg = BroadcastMessage {
            sender_address: sender,
            message_hash: hash,
            hop: 0,
            timestamp: now(),
            receiver_id,
            data,
        };

        // Remember our own message so network echoes are dropped.
        inner.broadcast.first_sighting(&msg.sender_address, hash);

        let posts = inner.rta.post_broadcast(&msg).await;
        inner.broadcast.note_local_posts(posts);
        inner.payload.on_broadcast(&msg);

        if inner.broadcast.should_relay(msg.hop) {
            let mut relayed = msg;
            relayed.hop += 1;
            let body = Bytes::from(postcard::to_allocvec(&relayed)?);
            let mut sent = 0;
            for conn in inner.conns.established() {
                if conn.notify(CMD_BROADCAST, body.clone()).is_ok() {
                    sent += 1;
                }
            }
            inner.broadcast.note_relayed(body.len(), sent);
        }
        Ok(posts)
    }

    /// Manual blocklisting. Live connections to the host are dropped.
    pub fn block_host(&self, host: &str, seconds: u64) {
        self.inner.blocklist.block(host, seconds);
        for conn in self.inner.conns.snapshot() {
            if conn.addr.host() == host {
                conn.begin_close();
            }
        }
    }

    pub fn unblock_host(&self, host: &str) -> bool {
        self.inner.blocklist.unblock(host)
    }

    pub fn blocked_hosts(&self) -> Vec<(String, u64)> {
        self.inner.blocklist.snapshot()
    }

    pub fn connection_counts(&self) -> (usize, usize) {
        (
            self.inner.conns.count_established(Direction::Outbound),
            self.inner.conns.count_established(Direction::Inbound),
        )
    }

    pub async fn stats(&self) -> NodeStats {
        let (white, gray, anchor) = {
            let pl = self.inner.peerlist.lock().await;
            (pl.white_len(), pl.gray_len(), pl.anchor_len())
        };
        NodeStats {
            peer_id: self.inner.peer_id,
            out_connections: self.inner.conns.count_established(Direction::Outbound),
            in_connections: self.inner.conns.count_established(Direction::Inbound),
            white_size: white,
            gray_size: gray,
            anchor_size: anchor,
            broadcast_bytes_in: self.inner.broadcast.broadcast_bytes_in(),
            broadcast_bytes_out: self.inner.broadcast.broadcast_bytes_out(),
            rta_msgs_p2p: self.inner.broadcast.rta_msgs_p2p(),
            rta_msgs_local: self.inner.broadcast.rta_msgs_local(),
        }
    }

    /// Tier of an address, for tests and the debug commands.
    pub async fn peer_tier(&self, adr: &PeerAddress) -> Option<crate::net::peerlist::Tier> {
        self.inner.peerlist.lock().await.tier_of(adr)
    }
}

impl NodeInner {
    pub(crate) fn is_closing(&self) -> bool {
        self.is_closing.load(Ordering::Relaxed)
    }

    pub(crate) fn local_node_data(&self) -> BasicNodeData {
        let my_port = if self.config.hide_my_port {
            0
        } else if self.config.external_port != 0 {
            self.config.external_port
        } else {
            self.listen_port.load(Ordering::Relaxed)
        };
        BasicNodeData {
            network_id: self.config.network_id,
            peer_id: self.peer_id,
            my_port,
            rpc_port: self.config.rpc_port,
            local_time: now(),
            support_flags: SUPPORT_FLAG_RTA,
        }
    }

    pub(crate) async fn white_slice_for_reply(&self) -> BoundedVec<crate::net::types::PeerlistEntry, PEERLIST_SLICE> {
        let slice = self.peerlist.lock().await.white_slice(PEERLIST_SLICE);
        BoundedVec::new(slice).unwrap_or_default()
    }

    async fn persist_peerlist(&self) {
        let blob = { self.peerlist.lock().await.persist() };
        match blob {
            Ok(blob) => {
                if let Err(e) = self.store.save(&blob) {
                    warn!("peerlist persist failed: {e}");
                }
            }
            Err(e) => warn!("peerlist serialize failed: {e}"),
        }
    }

    // -------------------------------------------------------------------------
    // Connection plumbing
    // -------------------------------------------------------------------------

    /// Wire a socket up with a writer task and a read loop, and register
    /// the connection record.
    fn spawn_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        adr: PeerAddress,
        direction: Direction,
    ) -> Arc<Connection> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut framed_read = FramedRead::new(read_half, WireCodec);
        let mut framed_write = FramedWrite::new(write_half, WireCodec);

        let (tx, mut rx) = mpsc::channel::<WriterMsg>(WRITE_QUEUE_DEPTH);
        let conn = Arc::new(Connection::new(adr, direction, tx));
        self.conns.insert(conn.clone());
        if self.config.save_graph {
            info!(target: "graph", conn = format_args!("{:032x}", conn.id), %adr, ?direction, "open");
        }

        // Writer: frames leave in queue order; Shutdown drains what was
        // queued before it, then flushes and closes the write side.
        let node = self.clone();
        let conn_w = conn.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    WriterMsg::Frame(frame) => {
                        node.limiter_up.throttle(frame.wire_len()).await;
                        if let Err(e) = framed_write.send(frame).await {
                            debug!(addr = %conn_w.addr, "write failed: {e}");
                            break;
                        }
                        conn_w.touch();
                    }
                    WriterMsg::Shutdown => break,
                }
            }
            let mut write_half = framed_write.into_inner();
            let _ = write_half.shutdown().await;
        });

        // Reader: frames are handled in arrival order on this connection.
        let node = self.clone();
        let conn_r = conn.clone();
        tokio::spawn(async move {
            let mut clean = false;
            let mut violation = false;
            loop {
                tokio::select! {
                    _ = conn_r.wait_close() => {
                        clean = true;
                        break;
                    }
                    frame = framed_read.next() => match frame {
                        None => {
                            // Remote closed after we were established: a
                            // normal close, not a failure.
                            clean = conn_r.state() == ConnState::Established
                                || conn_r.state() == ConnState::Draining;
                            break;
                        }
                        Some(Ok(frame)) => {
                            conn_r.touch();
                            node.limiter_down.throttle(frame.wire_len()).await;
                            if frame.header.is_response() {
                                conn_r.complete_invoke(
                                    frame.header.ticket(),
                                    frame.header.return_code,
                                    frame.body,
                                );
                                continue;
                            }
                            match router::dispatch(&node, &conn_r, frame).await {
                                Ok(()) => {}
                                Err(NetError::Protocol(msg)) => {
                                    warn!(addr = %conn_r.addr, "protocol violation: {msg}");
                                    violation = true;
                                    break;
                                }
                                Err(NetError::NetworkMismatch | NetError::SelfConnection) => {
                                    // Close silently, no demotion.
                                    clean = true;
                                    break;
                                }
                                Err(e) => {
                                    debug!(addr = %conn_r.addr, "handler failed: {e}");
                                    break;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            if matches!(e, NetError::Protocol(_)) {
                                warn!(addr = %conn_r.addr, "bad frame: {e}");
                                violation = true;
                            } else {
                                debug!(addr = %conn_r.addr, "read failed: {e}");
                            }
                            break;
                        }
                    },
                }
            }
            node.finish_connection(&conn_r, clean, violation).await;
        });

        conn
    }

    /// Terminal bookkeeping for a connection. Transport failures demote
    /// the address and start its cooldown; protocol violations raise the
    /// host fail score and blocklist past the limit.
    async fn finish_connection(&self, conn: &Arc<Connection>, clean: bool, violation: bool) {
        conn.begin_close();
        conn.set_state(ConnState::Closed);
        conn.fail_pending();
        self.conns.remove(conn.id);
        if self.config.save_graph {
            info!(target: "graph", conn = format_args!("{:032x}", conn.id), addr = %conn.addr, "close");
        }

        if violation && self.host_fails.bump(&conn.addr.host()) {
            self.blocklist.block(&conn.addr.host(), IP_BLOCKTIME);
        }

        if !clean {
            self.fail_cache.record_fail(conn.addr);
            let mut pl = self.peerlist.lock().await;
            if pl.contains(&conn.addr) {
                pl.mark_fail(conn.addr);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    fn is_own_address(&self, adr: &PeerAddress) -> bool {
        let listen = self.listen_port.load(Ordering::Relaxed);
        let port_match =
            adr.port == listen || (self.config.external_port != 0 && adr.port == self.config.external_port);
        port_match && (adr.ip.is_loopback() || adr.ip == self.config.bind_ip)
    }

    /// Candidate filter shared by every acquisition path. `explicit`
    /// candidates (priority/exclusive/seed) bypass the local-IP filter.
    fn candidate_usable(&self, adr: &PeerAddress, explicit: bool) -> bool {
        if self.conns.is_addr_connected(adr) {
            return false;
        }
        if self.blocklist.is_blocked(&adr.host()) {
            return false;
        }
        if self.fail_cache.is_cooling(adr) {
            return false;
        }
        if self.is_own_address(adr) {
            return false;
        }
        if !explicit && !self.config.allow_local_ip && adr.is_local() {
            return false;
        }
        true
    }

    /// Open a socket and run the initiator side of the handshake. With
    /// `probe` the connection is used only to verify liveness and take a
    /// peerlist, then closed.
    pub(crate) async fn try_connect_and_handshake(
        self: &Arc<Self>,
        adr: PeerAddress,
        explicit: bool,
        probe: bool,
    ) -> Result<()> {
        if !self.candidate_usable(&adr, explicit) {
            return Err(NetError::Blocked);
        }
        let connect_deadline = if probe { GRAY_PROBE_TIMEOUT } else { HANDSHAKE_TIMEOUT };
        let stream = match timeout(connect_deadline, TcpStream::connect(adr.socket_addr())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail_cache.record_fail(adr);
                let mut pl = self.peerlist.lock().await;
                if pl.contains(&adr) {
                    pl.mark_fail(adr);
                }
                return Err(e.into());
            }
            Err(_) => {
                self.fail_cache.record_fail(adr);
                return Err(NetError::Timeout);
            }
        };
        self.apply_tos_flag(&stream);

        let conn = self.spawn_connection(stream, adr, Direction::Outbound);
        conn.set_state(ConnState::Handshaking);

        let result = self.handshake_with_peer(&conn, probe).await;
        match &result {
            Ok(()) if probe => conn.begin_close(),
            Ok(()) => debug!(%adr, "outbound connection established"),
            // Mismatched network or self-connection: close silently.
            Err(NetError::NetworkMismatch | NetError::SelfConnection) => conn.begin_close(),
            Err(_) => {
                conn.begin_close();
                self.fail_cache.record_fail(adr);
                let mut pl = self.peerlist.lock().await;
                if pl.contains(&adr) {
                    pl.mark_fail(adr);
                }
            }
        }
        result
    }

    async fn handshake_with_peer(self: &Arc<Self>, conn: &Arc<Connection>, probe: bool) -> Result<()> {
        let req = HandshakeRequest {
            node_data: self.local_node_data(),
            payload: self.payload.current_payload(),
        };
        let body = Bytes::from(postcard::to_allocvec(&req)?);
        let deadline = if probe { GRAY_PROBE_TIMEOUT } else { HANDSHAKE_TIMEOUT };
        let (code, resp_body) = conn.invoke(CMD_HANDSHAKE, body, deadline).await?;

        if code == RC_UNSUPPORTED {
            return Err(NetError::NetworkMismatch);
        }
        if code != RC_OK {
            return Err(NetError::Protocol(format!("handshake refused with code {code}")));
        }

        // An overlong peerlist fails the bounded decode: Protocol error.
        let resp: HandshakeResponse = postcard::from_bytes(&resp_body)?;
        if resp.node_data.network_id != self.config.network_id {
            return Err(NetError::NetworkMismatch);
        }
        if resp.node_data.peer_id == self.peer_id {
            return Err(NetError::SelfConnection);
        }

        {
            let mut pl = self.peerlist.lock().await;
            pl.merge_gossip(&resp.local_peerlist, resp.node_data.local_time);
            pl.record_seen(conn.addr, resp.node_data.peer_id, now());
            if !probe {
                pl.promote_anchor(conn.addr, resp.node_data.peer_id);
            }
        }
        self.fail_cache.clear(&conn.addr);
        self.host_fails.reset(&conn.addr.host());

        conn.set_peer_id(resp.node_data.peer_id);
        self.payload.on_peer_payload(&conn.addr, &resp.payload);

        if !probe {
            conn.set_state(ConnState::Established);
            let conn = conn.clone();
            tokio::spawn(async move {
                if let Err(e) = router::fetch_support_flags(&conn).await {
                    debug!(addr = %conn.addr, "support flags exchange failed: {e}");
                }
            });
        }
        Ok(())
    }

    /// One-shot liveness check on a fresh short connection. True when the
    /// peer answers a ping with the expected peer id within the deadline.
    pub(crate) async fn reverse_ping(&self, adr: PeerAddress, expect_id: PeerId) -> bool {
        let attempt = async {
            let stream = TcpStream::connect(adr.socket_addr()).await?;
            let (read_half, write_half) = stream.into_split();
            let mut reader = FramedRead::new(read_half, WireCodec);
            let mut writer = FramedWrite::new(write_half, WireCodec);

            writer
                .send(Frame::request(crate::net::types::CMD_PING, 1, Bytes::new()))
                .await?;
            while let Some(frame) = reader.next().await {
                let frame = frame?;
                if !frame.header.is_response() {
                    continue;
                }
                let resp: crate::net::types::PingResponse = postcard::from_bytes(&frame.body)?;
                let ok = resp.status == crate::net::types::PING_OK_STATUS
                    && resp.peer_id == expect_id;
                return Ok::<bool, NetError>(ok);
            }
            Ok(false)
        };
        match timeout(PING_TIMEOUT, attempt).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                debug!(%adr, "reverse ping failed: {e}");
                false
            }
            Err(_) => {
                debug!(%adr, "reverse ping timed out");
                false
            }
        }
    }

    fn apply_tos_flag(&self, stream: &TcpStream) {
        #[cfg(unix)]
        if let Some(tos) = self.config.tos_flag {
            let sock = socket2::SockRef::from(stream);
            if let Err(e) = sock.set_tos(tos) {
                warn!("failed to set TOS flag {tos}: {e}");
            }
        }
        #[cfg(not(unix))]
        let _ = stream;
    }

    // -------------------------------------------------------------------------
    // Maintenance timers
    // -------------------------------------------------------------------------

    fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, sockaddr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("accept failed: {e}");
                                continue;
                            }
                        };
                        let adr = PeerAddress::from(sockaddr);
                        if self.is_closing() {
                            drop(stream);
                            continue;
                        }
                        if self.blocklist.is_blocked(&adr.host()) {
                            debug!(%adr, "refusing blocked host");
                            drop(stream);
                            continue;
                        }
                        let at_capacity =
                            self.conns.count_active(Direction::Inbound) >= self.config.in_peers;
                        if at_capacity && !self.is_priority_host(&adr) {
                            debug!(%adr, "refusing inbound: at capacity");
                            drop(stream);
                            continue;
                        }
                        let conn = self.spawn_connection(stream, adr, Direction::Inbound);
                        conn.set_state(ConnState::Handshaking);
                    }
                }
            }
        });
    }

    fn is_priority_host(&self, adr: &PeerAddress) -> bool {
        self.config
            .priority_peers
            .iter()
            .chain(self.config.exclusive_peers.iter())
            .any(|p| p.ip == adr.ip)
    }

    fn spawn_connect_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(CONNECT_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => self.connections_maker().await,
                }
            }
        });
    }

    /// Bring the outbound count up to target, trying candidates in order:
    /// exclusive/priority, anchor, white, seeds (bootstrap only), gray.
    /// Nothing is dialed while at or above target.
    async fn connections_maker(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }

        let target = self.config.out_peers;
        let current = self.conns.count_active(Direction::Outbound);
        if current >= target {
            self.evict_over_limit(target);
            return;
        }
        let mut missing = target - current;

        // Exclusive mode pins the node to exactly those peers.
        if !self.config.exclusive_peers.is_empty() {
            for adr in self.config.exclusive_peers.clone() {
                if missing == 0 {
                    break;
                }
                if self.candidate_usable(&adr, true)
                    && self.try_connect_and_handshake(adr, true, false).await.is_ok()
                {
                    missing -= 1;
                }
            }
            return;
        }

        for adr in self.config.priority_peers.clone() {
            if missing == 0 {
                return;
            }
            if self.candidate_usable(&adr, true)
                && self.try_connect_and_handshake(adr, true, false).await.is_ok()
            {
                missing -= 1;
            }
        }

        let connected: HashSet<PeerAddress> = self
            .conns
            .snapshot()
            .iter()
            .filter(|c| c.state() != ConnState::Closed)
            .map(|c| c.addr)
            .collect();

        // Anchor, then white.
        for anchored in [true, false] {
            let mut attempts = 0;
            while missing > 0 && attempts < target {
                let candidate = {
                    let pl = self.peerlist.lock().await;
                    if anchored {
                        pl.sample_anchor(&connected)
                    } else {
                        pl.sample_white(&connected)
                    }
                };
                let Some(entry) = candidate else { break };
                attempts += 1;
                if !self.candidate_usable(&entry.adr, false) {
                    continue;
                }
                if self.try_connect_and_handshake(entry.adr, false, false).await.is_ok() {
                    missing -= 1;
                }
            }
        }

        // Seed nodes only on bootstrap: zero outbound connections.
        if missing > 0 && self.conns.count_active(Direction::Outbound) == 0 {
            if self.connect_to_seed().await {
                missing = missing.saturating_sub(1);
            }
        }

        // Gray fills whatever is left.
        let mut attempts = 0;
        while missing > 0 && attempts < target {
            let candidate = {
                let pl = self.peerlist.lock().await;
                pl.sample_gray(&connected)
            };
            let Some(entry) = candidate else { break };
            attempts += 1;
            if !self.candidate_usable(&entry.adr, false) {
                continue;
            }
            if self.try_connect_and_handshake(entry.adr, false, false).await.is_ok() {
                missing -= 1;
            }
        }
    }

    async fn connect_to_seed(self: &Arc<Self>) -> bool {
        for seed in self.config.seed_nodes.clone() {
            // A DNS lookup of a seed hostname may suspend; that is fine
            // here, no lock is held.
            let resolved = match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addrs) => addrs.collect::<Vec<_>>(),
                Err(e) => {
                    warn!(%seed, "seed resolution failed: {e}");
                    continue;
                }
            };
            for sockaddr in resolved {
                let adr = PeerAddress::from(sockaddr);
                if !self.candidate_usable(&adr, true) {
                    continue;
                }
                if self.try_connect_and_handshake(adr, true, false).await.is_ok() {
                    return true;
                }
            }
        }
        false
    }

    /// Over the outbound target: drop the worst connections, preferring
    /// slow handlers, then the oldest idle.
    fn evict_over_limit(&self, target: usize) {
        let mut outbound: Vec<_> = self
            .conns
            .established()
            .into_iter()
            .filter(|c| c.direction == Direction::Outbound)
            .collect();
        if outbound.len() <= target {
            return;
        }
        outbound.sort_by_key(|c| (c.slow_handler_count(), c.idle_secs()));
        outbound.reverse();
        for conn in outbound.iter().take(outbound.len() - target) {
            info!(addr = %conn.addr, idle = conn.idle_secs(), "evicting connection over limit");
            conn.set_state(ConnState::Draining);
            conn.begin_close();
        }
    }

    fn spawn_sync_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(TIMED_SYNC_PERIOD);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of `interval` fires immediately; syncing
            // right after start is pointless.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        for conn in self.conns.established() {
                            if conn.direction != Direction::Outbound || conn.in_timed_sync() {
                                continue;
                            }
                            let node = self.clone();
                            tokio::spawn(async move {
                                router::do_timed_sync(&node, &conn).await;
                            });
                        }
                    }
                }
            }
        });
    }

    fn spawn_gray_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(GRAY_HOUSEKEEPING_PERIOD);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => self.gray_housekeeping().await,
                }
            }
        });
    }

    /// Probe one random gray entry per tick; unreachable entries leave
    /// the table, reachable ones are promoted by the probe handshake.
    async fn gray_housekeeping(self: &Arc<Self>) {
        if self.is_closing() {
            return;
        }
        let connected: HashSet<PeerAddress> = self
            .conns
            .snapshot()
            .iter()
            .map(|c| c.addr)
            .collect();
        let candidate = {
            let pl = self.peerlist.lock().await;
            pl.random_gray(&connected)
        };
        let Some(entry) = candidate else { return };
        if !self.candidate_usable(&entry.adr, false) {
            return;
        }
        if self.try_connect_and_handshake(entry.adr, false, true).await.is_err() {
            debug!(adr = %entry.adr, "gray probe failed, dropping entry");
            self.peerlist.lock().await.remove(entry.adr);
        }
    }

    fn spawn_store_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(PEERLIST_STORE_PERIOD);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => self.persist_peerlist().await,
                }
            }
        });
    }

    fn spawn_sweep_timer(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(DEDUP_SWEEP_PERIOD);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => self.broadcast.sweep(),
                }
            }
        });
    }

    // -------------------------------------------------------------------------
    // Broadcast path (wire side)
    // -------------------------------------------------------------------------

    /// Handle a broadcast notify from the overlay per the dedup → deliver
    /// → relay sequence. HTTP delivery runs detached so the connection's
    /// read loop is not held up.
    pub(crate) async fn handle_broadcast_from_wire(
        self: &Arc<Self>,
        origin: ConnId,
        msg: BroadcastMessage,
        wire_len: usize,
    ) {
        if !self.broadcast.first_sighting(&msg.sender_address, msg.message_hash) {
            return;
        }
        self.broadcast.note_received(wire_len, msg.receiver_id.is_some());

        let node = self.clone();
        let local = msg.clone();
        tokio::spawn(async move {
            let posts = node.rta.post_broadcast(&local).await;
            node.broadcast.note_local_posts(posts);
            node.payload.on_broadcast(&local);
        });

        if self.broadcast.should_relay(msg.hop) {
            let mut relayed = msg;
            relayed.hop += 1;
            match postcard::to_allocvec(&relayed) {
                Ok(body) => {
                    let body = Bytes::from(body);
                    let sent = self.conns.relay_to_all_except(CMD_BROADCAST, &body, origin);
                    self.broadcast.note_relayed(body.len(), sent);
                }
                Err(e) => warn!("broadcast re-encode failed: {e}"),
            }
        }
    }
}
