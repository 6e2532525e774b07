//! Per-connection state and the invoke/notify plumbing.
//!
//! Each TCP stream gets a writer task fed by an mpsc channel — all frames
//! leave in the order they were queued, which is the per-connection write
//! ordering guarantee. Requests register a oneshot under a connection-local
//! ticket; the read loop completes it when the matching response arrives.
//! Concurrent invokes on one connection each await their own ticket.

use crate::error::{NetError, Result};
use crate::net::wire::Frame;
use crate::types::{now, ConnId, PeerAddress, PeerId};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Connection lifecycle. On `Closed` the record is removed from the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Opening,
    Handshaking,
    Established,
    Draining,
    Closed,
}

/// Message for the writer task. `Shutdown` is enqueued behind any pending
/// frames, so the queue drains before the socket is flushed and closed.
#[derive(Debug)]
pub enum WriterMsg {
    Frame(Frame),
    Shutdown,
}

/// Depth of the per-connection write queue.
pub const WRITE_QUEUE_DEPTH: usize = 64;

pub struct Connection {
    pub id: ConnId,
    pub addr: PeerAddress,
    pub direction: Direction,
    pub created_at: u64,

    state: Mutex<ConnState>,
    /// Zero until the handshake completes.
    peer_id: AtomicU64,
    support_flags: AtomicU32,
    in_timed_sync: AtomicBool,
    last_activity: AtomicU64,
    slow_handlers: AtomicU32,

    next_ticket: AtomicU16,
    pending: Mutex<HashMap<u16, oneshot::Sender<(i32, Bytes)>>>,
    writer: mpsc::Sender<WriterMsg>,

    closing: AtomicBool,
    close_notify: Notify,
}

impl Connection {
    pub fn new(
        addr: PeerAddress,
        direction: Direction,
        writer: mpsc::Sender<WriterMsg>,
    ) -> Self {
        Self {
            id: rand::random::<u128>(),
            addr,
            direction,
            created_at: now(),
            state: Mutex::new(ConnState::Opening),
            peer_id: AtomicU64::new(0),
            support_flags: AtomicU32::new(0),
            in_timed_sync: AtomicBool::new(false),
            last_activity: AtomicU64::new(now()),
            slow_handlers: AtomicU32::new(0),
            next_ticket: AtomicU16::new(1),
            pending: Mutex::new(HashMap::new()),
            writer,
            closing: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: ConnState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnState::Established
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id.load(Ordering::Relaxed)
    }

    pub fn set_peer_id(&self, id: PeerId) {
        self.peer_id.store(id, Ordering::Relaxed);
    }

    pub fn support_flags(&self) -> u32 {
        self.support_flags.load(Ordering::Relaxed)
    }

    pub fn set_support_flags(&self, flags: u32) {
        self.support_flags.store(flags, Ordering::Relaxed);
    }

    pub fn in_timed_sync(&self) -> bool {
        self.in_timed_sync.load(Ordering::Relaxed)
    }

    pub fn set_in_timed_sync(&self, v: bool) {
        self.in_timed_sync.store(v, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity.store(now(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Bump the slow-handler budget; returns the new count.
    pub fn note_slow_handler(&self) -> u32 {
        self.slow_handlers.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn slow_handler_count(&self) -> u32 {
        self.slow_handlers.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Send a request and wait for the matching response on this
    /// connection.
    pub async fn invoke(&self, command: u32, body: Bytes, deadline: Duration) -> Result<(i32, Bytes)> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(NetError::Transport("connection closed".into()));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(ticket, tx);

        let frame = Frame::request(command, ticket, body);
        if self.writer.send(WriterMsg::Frame(frame)).await.is_err() {
            self.pending.lock().unwrap().remove(&ticket);
            return Err(NetError::Transport("connection closed".into()));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(NetError::Transport("connection closed".into())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&ticket);
                Err(NetError::Timeout)
            }
        }
    }

    /// Fire-and-forget notify. Fails only if the send buffer rejects the
    /// frame.
    pub fn notify(&self, command: u32, body: Bytes) -> Result<()> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(NetError::Transport("connection closed".into()));
        }
        self.writer
            .try_send(WriterMsg::Frame(Frame::notify(command, body)))
            .map_err(|_| NetError::Transport("send buffer rejected frame".into()))
    }

    pub async fn send_response(
        &self,
        command: u32,
        ticket: u16,
        return_code: i32,
        body: Bytes,
    ) -> Result<()> {
        let frame = Frame::response(command, ticket, return_code, body);
        self.writer
            .send(WriterMsg::Frame(frame))
            .await
            .map_err(|_| NetError::Transport("connection closed".into()))
    }

    // -------------------------------------------------------------------------
    // Read-loop hooks
    // -------------------------------------------------------------------------

    /// Route an incoming response frame to its waiting invoke. Unmatched
    /// tickets are dropped silently (the invoke may have timed out).
    pub fn complete_invoke(&self, ticket: u16, return_code: i32, body: Bytes) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&ticket) {
            let _ = tx.send((return_code, body));
        }
    }

    /// Drop all pending invokes; their awaiters observe a closed
    /// connection.
    pub fn fail_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    // -------------------------------------------------------------------------
    // Closing
    // -------------------------------------------------------------------------

    /// Ask the connection to drain and close: queued frames are written
    /// out, then the writer shuts the socket down and the read loop stops.
    /// Idempotent.
    pub fn begin_close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.writer.try_send(WriterMsg::Shutdown);
        self.close_notify.notify_waiters();
        self.close_notify.notify_one();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Resolves when `begin_close` has been called.
    pub async fn wait_close(&self) {
        if self.closing.load(Ordering::Relaxed) {
            return;
        }
        self.close_notify.notified().await;
    }

    /// Seconds since the last frame in either direction.
    pub fn idle_secs(&self) -> u64 {
        now().saturating_sub(self.last_activity())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &format_args!("{:032x}", self.id))
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> (Connection, mpsc::Receiver<WriterMsg>) {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let addr: PeerAddress = "127.0.0.1:28680".parse().unwrap();
        (Connection::new(addr, Direction::Outbound, tx), rx)
    }

    #[tokio::test]
    async fn invoke_completes_via_ticket() {
        let (conn, mut rx) = test_conn();

        let fut = conn.invoke(1003, Bytes::new(), Duration::from_secs(1));
        tokio::pin!(fut);

        // Pull the request off the write queue to learn its ticket.
        let ticket = tokio::select! {
            msg = rx.recv() => match msg.unwrap() {
                WriterMsg::Frame(f) => f.header.ticket(),
                WriterMsg::Shutdown => panic!("unexpected shutdown"),
            },
            _ = &mut fut => panic!("invoke resolved before response"),
        };

        conn.complete_invoke(ticket, 0, Bytes::from_static(b"pong"));
        let (code, body) = fut.await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(&body[..], b"pong");
    }

    #[tokio::test]
    async fn invoke_times_out_without_response() {
        let (conn, _rx) = test_conn();
        let err = conn
            .invoke(1003, Bytes::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout));
    }

    #[tokio::test]
    async fn concurrent_invokes_get_their_own_responses() {
        let (conn, mut rx) = test_conn();

        let a = conn.invoke(1001, Bytes::new(), Duration::from_secs(1));
        let b = conn.invoke(1002, Bytes::new(), Duration::from_secs(1));
        tokio::pin!(a);
        tokio::pin!(b);

        let mut tickets = Vec::new();
        while tickets.len() < 2 {
            tokio::select! {
                msg = rx.recv() => {
                    if let WriterMsg::Frame(f) = msg.unwrap() {
                        tickets.push((f.header.command, f.header.ticket()));
                    }
                }
                _ = &mut a => panic!("a resolved early"),
                _ = &mut b => panic!("b resolved early"),
            }
        }

        // Answer in reverse order; each invoke still sees its own reply.
        for (cmd, ticket) in tickets.iter().rev() {
            conn.complete_invoke(*ticket, *cmd as i32, Bytes::new());
        }
        assert_eq!(a.await.unwrap().0, 1001);
        assert_eq!(b.await.unwrap().0, 1002);
    }

    #[tokio::test]
    async fn notify_fails_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let addr: PeerAddress = "127.0.0.1:28680".parse().unwrap();
        let conn = Connection::new(addr, Direction::Outbound, tx);

        assert!(conn.notify(1008, Bytes::new()).is_ok());
        assert!(conn.notify(1008, Bytes::new()).is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let (conn, mut rx) = test_conn();
        conn.begin_close();
        conn.begin_close();
        conn.wait_close().await;
        assert!(matches!(rx.recv().await, Some(WriterMsg::Shutdown)));
        assert!(conn.notify(1008, Bytes::new()).is_err());
    }
}
