//! Multi-node integration scenarios over localhost sockets.
//!
//! Every node binds an ephemeral port on 127.0.0.1; meshes are built with
//! priority peers so links form within a couple of connect ticks.

use axum::routing::post;
use axum::Router;
use rtanode::config::NetConfig;
use rtanode::net::node::{NodeServer, NullPayloadHandler};
use rtanode::net::peerlist::{FilePeerlistStore, Tier};
use rtanode::types::PeerAddress;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn test_config(priority: &[u16], seeds: &[u16]) -> NetConfig {
    let mut config = NetConfig::default();
    config.bind_ip = LOCALHOST;
    config.bind_port = 0;
    config.out_peers = 4;
    config.allow_local_ip = true;
    config.priority_peers = priority
        .iter()
        .map(|p| PeerAddress::new(LOCALHOST, *p))
        .collect();
    config.seed_nodes = seeds.iter().map(|p| format!("127.0.0.1:{p}")).collect();
    config.data_dir = std::env::temp_dir().join(format!("rtanode_it_{}", rand::random::<u64>()));
    config
}

async fn spawn_node(config: NetConfig) -> NodeServer {
    let store = Arc::new(FilePeerlistStore::new(&config.data_dir));
    let node = NodeServer::new(config, Arc::new(NullPayloadHandler), store)
        .await
        .expect("node creation");
    node.start().await.expect("node start");
    node
}

/// Poll `check` until it returns true or the deadline passes.
async fn wait_until<F>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}

/// Tiny HTTP sink standing in for a supernode daemon; counts posts to
/// /rpc/broadcast.
async fn spawn_http_sink() -> (SocketAddr, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let hits = counter.clone();
    let app = Router::new().route(
        "/rpc/broadcast",
        post(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                r#"{"jsonrpc":"2.0","id":0,"result":{"status":1}}"#
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind((LOCALHOST, 0))
        .await
        .expect("sink bind");
    let addr = listener.local_addr().expect("sink addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (addr, counter)
}

#[tokio::test]
async fn bootstrap_from_seed_node() {
    // A node with no seeds and an empty peerlist forms no outbound
    // connections.
    let node_a = spawn_node(test_config(&[], &[])).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    let (out, _) = node_a.connection_counts();
    assert_eq!(out, 0, "node without seeds must stay idle");

    // A second node seeded with A connects exactly once; after the
    // reverse ping A has B in its verified tiers.
    let node_b = spawn_node(test_config(&[], &[node_a.listen_port()])).await;

    assert!(
        wait_until(Duration::from_secs(10), || {
            node_b.connection_counts().0 == 1
        })
        .await,
        "seeded node must establish one outbound connection"
    );
    let (out, _) = node_b.connection_counts();
    assert_eq!(out, 1);

    let b_addr = PeerAddress::new(LOCALHOST, node_b.listen_port());
    let mut verified = false;
    for _ in 0..100 {
        if let Some(tier) = node_a.peer_tier(&b_addr).await {
            if matches!(tier, Tier::Anchor | Tier::White) {
                verified = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        verified,
        "responder must learn the initiator's address after the reverse ping"
    );

    node_b.shutdown().await;
    node_a.shutdown().await;
}

#[tokio::test]
async fn gossip_propagates_through_intermediate_node() {
    // B knows A, C knows only B. C learns A from B's peerlist slice.
    let node_a = spawn_node(test_config(&[], &[])).await;
    let node_b = spawn_node(test_config(&[node_a.listen_port()], &[])).await;
    assert!(
        wait_until(Duration::from_secs(10), || {
            node_b.connection_counts().0 >= 1
        })
        .await
    );

    let node_c = spawn_node(test_config(&[node_b.listen_port()], &[])).await;
    let a_addr = PeerAddress::new(LOCALHOST, node_a.listen_port());
    let mut learned = false;
    for _ in 0..150 {
        if node_c.peer_tier(&a_addr).await.is_some() {
            learned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(learned, "C must learn A's address via B's gossip");

    node_c.shutdown().await;
    node_b.shutdown().await;
    node_a.shutdown().await;
}

#[tokio::test]
async fn broadcast_is_delivered_exactly_once_per_node() {
    // Pairwise mesh: B->A, C->A, C->B.
    let node_a = spawn_node(test_config(&[], &[])).await;
    let node_b = spawn_node(test_config(&[node_a.listen_port()], &[])).await;
    let node_c =
        spawn_node(test_config(&[node_a.listen_port(), node_b.listen_port()], &[])).await;

    assert!(
        wait_until(Duration::from_secs(10), || {
            let (b_out, _) = node_b.connection_counts();
            let (c_out, _) = node_c.connection_counts();
            b_out >= 1 && c_out >= 2
        })
        .await,
        "mesh must form"
    );

    node_a
        .broadcast(None, None, b"payment-proposal".to_vec())
        .await
        .expect("broadcast");

    assert!(
        wait_until(Duration::from_secs(5), || {
            node_b.engine().msgs_in() == 1 && node_c.engine().msgs_in() == 1
        })
        .await,
        "both peers must receive the broadcast"
    );

    // Relay echoes keep arriving for a while; dedup keeps the count at 1.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(node_b.engine().msgs_in(), 1, "dedup must drop the echo");
    assert_eq!(node_c.engine().msgs_in(), 1, "dedup must drop the echo");

    node_c.shutdown().await;
    node_b.shutdown().await;
    node_a.shutdown().await;
}

#[tokio::test]
async fn broadcast_with_recipient_posts_to_registered_supernode() {
    let (sink_addr, hits) = spawn_http_sink().await;

    let node_a = spawn_node(test_config(&[], &[])).await;
    let node_b = spawn_node(test_config(&[node_a.listen_port()], &[])).await;
    assert!(
        wait_until(Duration::from_secs(10), || {
            node_b.connection_counts().0 >= 1
        })
        .await
    );

    // Register a supernode on A and route recipient-42 to it.
    node_a
        .rta()
        .register_supernode(
            "sn1",
            &format!("http://{sink_addr}/rpc"),
            "/cb",
            60_000,
        )
        .expect("register");
    node_a.rta().add_route("recipient-42", "sn1").expect("route");

    // A peer broadcast addressed to recipient-42 reaches the supernode
    // exactly once.
    node_b
        .broadcast(None, Some("recipient-42".to_string()), b"pay-sale-1".to_vec())
        .await
        .expect("broadcast");
    assert!(
        wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 1).await,
        "supernode must receive exactly one post"
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn expired_supernode_receives_nothing() {
    let (sink_addr, hits) = spawn_http_sink().await;

    let node_a = spawn_node(test_config(&[], &[])).await;
    let node_b = spawn_node(test_config(&[node_a.listen_port()], &[])).await;
    assert!(
        wait_until(Duration::from_secs(10), || {
            node_b.connection_counts().0 >= 1
        })
        .await
    );

    // Short registration that lapses with no refresh.
    node_a
        .rta()
        .register_supernode("sn1", &format!("http://{sink_addr}/rpc"), "/cb", 300)
        .expect("register");
    node_a.rta().add_route("recipient-42", "sn1").expect("route");
    tokio::time::sleep(Duration::from_millis(600)).await;

    node_b
        .broadcast(None, Some("recipient-42".to_string()), b"pay-sale-2".to_vec())
        .await
        .expect("broadcast");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        hits.load(Ordering::SeqCst),
        0,
        "expired registration must produce zero posts"
    );

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn blocked_host_is_not_dialed_until_unblocked() {
    let node_a = spawn_node(test_config(&[], &[])).await;

    let mut config = test_config(&[node_a.listen_port()], &[]);
    config.out_peers = 2;
    let node_b = spawn_node(config).await;
    node_b.block_host("127.0.0.1", 60);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let (out, _) = node_b.connection_counts();
    assert_eq!(out, 0, "blocked host must not be dialed");

    assert!(node_b.unblock_host("127.0.0.1"));
    assert!(
        wait_until(Duration::from_secs(10), || {
            node_b.connection_counts().0 == 1
        })
        .await,
        "connection must form after the unblock"
    );

    node_b.shutdown().await;
    node_a.shutdown().await;
}

#[tokio::test]
async fn outbound_count_respects_target() {
    // Three peers available, target of two.
    let node_a = spawn_node(test_config(&[], &[])).await;
    let node_b = spawn_node(test_config(&[], &[])).await;
    let node_c = spawn_node(test_config(&[], &[])).await;

    let mut config = test_config(
        &[
            node_a.listen_port(),
            node_b.listen_port(),
            node_c.listen_port(),
        ],
        &[],
    );
    config.out_peers = 2;
    let node_d = spawn_node(config).await;

    // Priority peers may briefly exceed the target; the eviction pass
    // brings the count back down and keeps it there.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(
        wait_until(Duration::from_secs(10), || {
            node_d.connection_counts().0 <= 2
        })
        .await,
        "established outbound count must settle at or below the target"
    );

    node_d.shutdown().await;
    node_c.shutdown().await;
    node_b.shutdown().await;
    node_a.shutdown().await;
}
