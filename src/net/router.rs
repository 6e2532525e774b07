//! Command dispatch for incoming request and notify frames.
//!
//! Unknown commands are ignored. A body that fails to decode is a
//! protocol violation; the read loop raises the per-host fail score and
//! past the threshold the host is blocklisted. This module is the sole
//! writer of per-connection `support_flags` and `in_timed_sync`.

use crate::error::{NetError, Result};
use crate::net::node::NodeInner;
use crate::net::transport::{ConnState, Connection};
use crate::net::types::{
    BroadcastMessage, HandshakeRequest, PingResponse, SupportFlagsResponse, TimedSyncRequest,
    TimedSyncResponse, CMD_BROADCAST, CMD_HANDSHAKE, CMD_PING, CMD_SUPPORT_FLAGS, CMD_TIMED_SYNC,
    HANDLER_SOFT_LIMIT, HANDSHAKE_TIMEOUT, PING_OK_STATUS, RC_FAILURE, RC_OK, RC_UNSUPPORTED,
};
use crate::net::wire::Frame;
use crate::types::now;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[cfg(feature = "debug-commands")]
use crate::net::transport::Direction;
#[cfg(feature = "debug-commands")]
use crate::net::types::{
    NetworkStateResponse, PeerIdResponse, StatInfoResponse, CMD_NETWORK_STATE, CMD_PEER_ID,
    CMD_STAT_INFO,
};

/// Dispatch one incoming frame. Handlers are cooperative: exceeding the
/// soft limit does not fail the call, but is logged and counted against
/// the connection's slow-handler budget.
pub async fn dispatch(node: &Arc<NodeInner>, conn: &Arc<Connection>, frame: Frame) -> Result<()> {
    let command = frame.header.command;
    let started = Instant::now();
    let result = route(node, conn, frame).await;
    let elapsed = started.elapsed();
    if elapsed > HANDLER_SOFT_LIMIT {
        let budget = conn.note_slow_handler();
        warn!(command, ?elapsed, budget, "handler exceeded soft limit");
    }
    result
}

async fn route(node: &Arc<NodeInner>, conn: &Arc<Connection>, frame: Frame) -> Result<()> {
    let ticket = frame.header.ticket();
    match frame.header.command {
        CMD_HANDSHAKE => {
            let req: HandshakeRequest = postcard::from_bytes(&frame.body)?;
            handle_handshake(node, conn, ticket, req).await
        }
        CMD_TIMED_SYNC => {
            require_established(conn)?;
            let _req: TimedSyncRequest = postcard::from_bytes(&frame.body)?;
            conn.set_in_timed_sync(true);
            let result = respond_timed_sync(node, conn, ticket).await;
            conn.set_in_timed_sync(false);
            result
        }
        CMD_PING => {
            let resp = PingResponse {
                status: PING_OK_STATUS.to_string(),
                peer_id: node.peer_id,
            };
            let body = Bytes::from(postcard::to_allocvec(&resp)?);
            conn.send_response(CMD_PING, ticket, RC_OK, body).await
        }
        CMD_SUPPORT_FLAGS => {
            let resp = SupportFlagsResponse {
                support_flags: node.local_node_data().support_flags,
            };
            let body = Bytes::from(postcard::to_allocvec(&resp)?);
            conn.send_response(CMD_SUPPORT_FLAGS, ticket, RC_OK, body).await
        }
        CMD_BROADCAST => {
            require_established(conn)?;
            let wire_len = frame.wire_len();
            let msg: BroadcastMessage = postcard::from_bytes(&frame.body)?;
            node.handle_broadcast_from_wire(conn.id, msg, wire_len).await;
            Ok(())
        }
        #[cfg(feature = "debug-commands")]
        CMD_STAT_INFO => {
            let resp = stat_info(node).await;
            let body = Bytes::from(postcard::to_allocvec(&resp)?);
            conn.send_response(CMD_STAT_INFO, ticket, RC_OK, body).await
        }
        #[cfg(feature = "debug-commands")]
        CMD_NETWORK_STATE => {
            let resp = network_state(node).await;
            let body = Bytes::from(postcard::to_allocvec(&resp)?);
            conn.send_response(CMD_NETWORK_STATE, ticket, RC_OK, body).await
        }
        #[cfg(feature = "debug-commands")]
        CMD_PEER_ID => {
            let resp = PeerIdResponse { my_id: node.peer_id };
            let body = Bytes::from(postcard::to_allocvec(&resp)?);
            conn.send_response(CMD_PEER_ID, ticket, RC_OK, body).await
        }
        unknown => {
            debug!(command = unknown, "ignoring unknown command");
            Ok(())
        }
    }
}

fn require_established(conn: &Connection) -> Result<()> {
    if conn.is_established() {
        Ok(())
    } else {
        Err(NetError::Protocol("command before handshake".into()))
    }
}

/// Responder side of the handshake. Network-id mismatches are answered
/// with `RC_UNSUPPORTED` and the connection closes; a self-connection is
/// refused and closes silently.
async fn handle_handshake(
    node: &Arc<NodeInner>,
    conn: &Arc<Connection>,
    ticket: u16,
    req: HandshakeRequest,
) -> Result<()> {
    if req.node_data.network_id != node.local_node_data().network_id {
        conn.send_response(CMD_HANDSHAKE, ticket, RC_UNSUPPORTED, Bytes::new()).await?;
        return Err(NetError::NetworkMismatch);
    }
    if req.node_data.peer_id == node.peer_id {
        conn.send_response(CMD_HANDSHAKE, ticket, RC_FAILURE, Bytes::new()).await?;
        return Err(NetError::SelfConnection);
    }
    if conn.is_established() {
        return Err(NetError::Protocol("repeated handshake".into()));
    }

    conn.set_peer_id(req.node_data.peer_id);
    node.payload.on_peer_payload(&conn.addr, &req.payload);

    let resp = crate::net::types::HandshakeResponse {
        node_data: node.local_node_data(),
        payload: node.payload.current_payload(),
        local_peerlist: node.white_slice_for_reply().await,
    };
    let body = Bytes::from(postcard::to_allocvec(&resp)?);
    conn.send_response(CMD_HANDSHAKE, ticket, RC_OK, body).await?;
    conn.set_state(ConnState::Established);
    debug!(addr = %conn.addr, peer_id = req.node_data.peer_id, "inbound handshake complete");

    // The peer claims a listening port: verify reachability with a
    // reverse ping on a fresh short connection before gossiping it.
    if req.node_data.my_port != 0 {
        let claimed = crate::types::PeerAddress::new(conn.addr.ip, req.node_data.my_port);
        let peer_id = req.node_data.peer_id;
        let node = node.clone();
        tokio::spawn(async move {
            if node.reverse_ping(claimed, peer_id).await {
                let mut pl = node.peerlist.lock().await;
                pl.record_seen(claimed, peer_id, now());
                pl.promote_anchor(claimed, peer_id);
                debug!(%claimed, "reverse ping verified, peer anchored");
            } else {
                debug!(%claimed, "reverse ping failed, not advertising peer");
            }
        });
    }
    Ok(())
}

async fn respond_timed_sync(node: &Arc<NodeInner>, conn: &Arc<Connection>, ticket: u16) -> Result<()> {
    let resp = TimedSyncResponse {
        local_time: now(),
        payload: node.payload.current_payload(),
        local_peerlist: node.white_slice_for_reply().await,
    };
    let body = Bytes::from(postcard::to_allocvec(&resp)?);
    conn.send_response(CMD_TIMED_SYNC, ticket, RC_OK, body).await
}

/// Initiator side of the periodic timed sync. A peer that does not answer
/// in time, or answers garbage, is dropped.
pub async fn do_timed_sync(node: &Arc<NodeInner>, conn: &Arc<Connection>) {
    let req = TimedSyncRequest {
        payload: node.payload.current_payload(),
    };
    let body = match postcard::to_allocvec(&req) {
        Ok(body) => Bytes::from(body),
        Err(e) => {
            warn!("timed sync encode failed: {e}");
            return;
        }
    };

    conn.set_in_timed_sync(true);
    let result = conn.invoke(CMD_TIMED_SYNC, body, HANDSHAKE_TIMEOUT).await;
    conn.set_in_timed_sync(false);

    let resp = match result {
        Ok((RC_OK, body)) => match postcard::from_bytes::<TimedSyncResponse>(&body) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(addr = %conn.addr, "timed sync response malformed: {e}");
                conn.begin_close();
                return;
            }
        },
        Ok((code, _)) => {
            debug!(addr = %conn.addr, code, "timed sync refused, dropping peer");
            conn.begin_close();
            return;
        }
        Err(e) => {
            debug!(addr = %conn.addr, "timed sync failed, dropping peer: {e}");
            conn.begin_close();
            return;
        }
    };

    {
        let mut pl = node.peerlist.lock().await;
        pl.merge_gossip(&resp.local_peerlist, resp.local_time);
        pl.record_seen(conn.addr, conn.peer_id(), now());
    }
    node.payload.on_peer_payload(&conn.addr, &resp.payload);
}

/// One-time capability exchange after a connection is established.
pub async fn fetch_support_flags(conn: &Arc<Connection>) -> Result<()> {
    let (code, body) = conn
        .invoke(CMD_SUPPORT_FLAGS, Bytes::new(), HANDSHAKE_TIMEOUT)
        .await?;
    if code != RC_OK {
        return Err(NetError::Protocol(format!("support flags refused: {code}")));
    }
    let resp: SupportFlagsResponse = postcard::from_bytes(&body)?;
    conn.set_support_flags(resp.support_flags);
    Ok(())
}

#[cfg(feature = "debug-commands")]
async fn stat_info(node: &Arc<NodeInner>) -> StatInfoResponse {
    let (white, gray, anchor) = {
        let pl = node.peerlist.lock().await;
        (pl.white_len(), pl.gray_len(), pl.anchor_len())
    };
    StatInfoResponse {
        peer_id: node.peer_id,
        out_connections: node.conns.count_established(Direction::Outbound),
        in_connections: node.conns.count_established(Direction::Inbound),
        white_size: white,
        gray_size: gray,
        anchor_size: anchor,
        broadcast_bytes_in: node.broadcast.broadcast_bytes_in(),
        broadcast_bytes_out: node.broadcast.broadcast_bytes_out(),
    }
}

#[cfg(feature = "debug-commands")]
async fn network_state(node: &Arc<NodeInner>) -> NetworkStateResponse {
    let (white, gray) = {
        let pl = node.peerlist.lock().await;
        (pl.white_entries().to_vec(), pl.gray_entries().to_vec())
    };
    NetworkStateResponse {
        local_peerlist_white: white,
        local_peerlist_gray: gray,
        connections: node
            .conns
            .snapshot()
            .iter()
            .map(|c| (c.addr.to_string(), c.peer_id()))
            .collect(),
    }
}
