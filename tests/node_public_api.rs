//! Integration tests for the Node public API.
//!
//! These tests exercise the public interface exposed through the Node facade
//! with real UDP sockets on loopback.

use std::time::Duration;

use kadmesh::{
    ConnectError, DhtConfig, ID_LEN, Identifier, LocalIdentity, MAX_DATAGRAM_SIZE, Node, NodeId, Peer,
};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn test_config() -> DhtConfig {
    DhtConfig::default()
        .with_difficulty(4, 4)
        .with_response_timeout(Duration::from_millis(300))
        .with_operation_timeout(Duration::from_secs(3))
}

async fn test_node() -> Node {
    Node::bind("127.0.0.1:0", test_config()).await.expect("bind failed")
}

#[tokio::test]
async fn node_bind_and_identity() {
    let node = test_node().await;

    assert!(node.identifier().is_valid(4, 4), "identity should satisfy the puzzles");
    assert_eq!(node.local_peer().id(), node.id());
    assert_eq!(node.local_peer().socket_addr(), node.local_addr());
    assert!(node.local_addr().port() > 0, "port should be positive");
    assert!(node.known_peers().await.is_empty());
}

#[tokio::test]
async fn bind_rejects_identity_below_difficulty() {
    let weak = LocalIdentity::generate(0, 0);
    let strict = test_config().with_difficulty(24, 24);
    let result = Node::bind_with_identity("127.0.0.1:0", strict, weak).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn bind_rejects_invalid_config() {
    let result = Node::bind("127.0.0.1:0", test_config().with_k(0)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn two_node_connect() {
    let a = test_node().await;
    let b = test_node().await;

    let seed = timeout(TEST_TIMEOUT, b.connect(&a.local_addr().to_string()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(seed.id(), a.id());

    let b_peers: Vec<NodeId> = b.known_peers().await.iter().map(Peer::id).collect();
    let a_peers: Vec<NodeId> = a.known_peers().await.iter().map(Peer::id).collect();
    assert_eq!(b_peers, vec![a.id()]);
    assert_eq!(a_peers, vec![b.id()]);
}

#[tokio::test]
async fn connect_to_silent_seed_fails_with_timeout() {
    let node = test_node().await;
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let seed = silent.local_addr().unwrap();

    let err = node.connect(&seed.to_string()).await.unwrap_err();
    assert_eq!(
        err.root_cause().downcast_ref::<ConnectError>(),
        Some(&ConnectError::Timeout { seed })
    );
    assert!(node.known_peers().await.is_empty());
}

#[tokio::test]
async fn connect_rejects_bad_addresses() {
    let node = test_node().await;
    assert!(node.connect("not-an-address").await.is_err());
    assert!(node.connect(&node.local_addr().to_string()).await.is_err());
}

#[tokio::test]
async fn add_peer_requires_valid_identifier() {
    let node = test_node().await;
    let forged = Peer::from_socket_addr(
        Identifier::from_parts(NodeId::from_bytes([0xAA; ID_LEN]), [0u8; ID_LEN]),
        "127.0.0.1:9".parse().unwrap(),
    );
    // Forged identifiers essentially never satisfy both puzzles at difficulty 4.
    if !forged.identifier().is_valid(4, 4) {
        assert!(node.add_peer(forged).await.is_err());
        assert!(node.known_peers().await.is_empty());
    }

    let honest = LocalIdentity::generate(4, 4);
    let peer = Peer::from_socket_addr(honest.identifier(), "127.0.0.1:9".parse().unwrap());
    node.add_peer(peer).await.expect("valid peer accepted");
    assert_eq!(node.known_peers().await, vec![peer]);
}

#[tokio::test]
async fn lone_node_store_fetch_remove() {
    let node = test_node().await;

    assert_eq!(node.store_value("k", "v").await.unwrap(), 1);
    assert_eq!(node.fetch_value("k").await.unwrap(), Some(vec!["v".to_string()]));
    assert_eq!(node.remove_value("k", "v").await.unwrap(), 1);
    assert_eq!(node.fetch_value("k").await.unwrap(), None);
}

#[tokio::test]
async fn oversized_value_is_refused() {
    let node = test_node().await;
    let huge = "x".repeat(MAX_DATAGRAM_SIZE);
    assert!(node.store_value("k", &huge).await.is_err());
    assert_eq!(node.store().get("k"), None);
}

#[tokio::test]
async fn refresh_on_lone_node_is_ok() {
    let node = test_node().await;
    node.store_value("k", "v").await.unwrap();
    let dropped = timeout(TEST_TIMEOUT, node.refresh())
        .await
        .expect("refresh timed out");
    assert_eq!(dropped, 0);
    assert_eq!(node.store().get("k"), Some(vec!["v".to_string()]));
}

#[tokio::test]
async fn connect_via_own_alias_fails() {
    let node = Node::bind("0.0.0.0:0", test_config()).await.expect("bind failed");
    let alias = format!("127.0.0.1:{}", node.local_addr().port());

    let err = node.connect(&alias).await.unwrap_err();
    assert!(matches!(
        err.root_cause().downcast_ref::<ConnectError>(),
        Some(ConnectError::SelfConnect { .. })
    ));
    assert!(node.known_peers().await.is_empty());
}

#[tokio::test]
async fn remove_of_never_stored_value_reports_zero() {
    let node = test_node().await;
    assert_eq!(node.remove_value("k", "v").await.unwrap(), 0);
}

#[tokio::test]
async fn shutdown_stops_answering() {
    let a = test_node().await;
    let b = test_node().await;
    a.shutdown().await;

    let err = b.connect(&a.local_addr().to_string()).await.unwrap_err();
    assert!(err.root_cause().downcast_ref::<ConnectError>().is_some());
}
