//! End-to-end scenarios on small loopback networks.

use std::time::Duration;

use kadmesh::{DhtConfig, EvictionPolicy, LocalIdentity, Node, NodeId, Peer};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn test_config() -> DhtConfig {
    DhtConfig::default()
        .with_difficulty(2, 2)
        .with_response_timeout(Duration::from_millis(300))
        .with_operation_timeout(Duration::from_secs(3))
}

async fn spawn_node() -> Node {
    Node::bind("127.0.0.1:0", test_config()).await.expect("bind failed")
}

async fn join(node: &Node, seed: &Node) {
    timeout(TEST_TIMEOUT, node.connect(&seed.local_addr().to_string()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
}

async fn known_ids(node: &Node) -> Vec<NodeId> {
    node.known_peers().await.iter().map(Peer::id).collect()
}

/// A seeded by nobody, B and C both bootstrap off A.
async fn three_node_network() -> (Node, Node, Node) {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let c = spawn_node().await;
    join(&b, &a).await;
    join(&c, &a).await;
    (a, b, c)
}

#[tokio::test]
async fn every_node_learns_the_others_after_refresh() {
    let (a, b, c) = three_node_network().await;
    for node in [&a, &b, &c] {
        timeout(TEST_TIMEOUT, node.refresh())
            .await
            .expect("refresh timed out");
    }

    for (node, others) in [(&a, [&b, &c]), (&b, [&a, &c]), (&c, [&a, &b])] {
        let known = known_ids(node).await;
        for other in others {
            assert!(known.contains(&other.id()), "{:?} does not know {:?}", node, other);
        }
    }

    let closest = a.closest_known(&c.id(), 2).await;
    let ids: Vec<NodeId> = closest.iter().map(Peer::id).collect();
    assert_eq!(ids.first(), Some(&c.id()));
    assert!(ids.contains(&b.id()));
}

#[tokio::test]
async fn stored_value_can_be_fetched_elsewhere() {
    let (a, b, _c) = three_node_network().await;

    let replicas = b.store_value("k1", "v1").await.unwrap();
    assert_eq!(replicas, 3, "small network replicates everywhere");

    // A late joiner holds nothing locally and must fetch over the network.
    let d = spawn_node().await;
    join(&d, &a).await;
    assert_eq!(d.store().get("k1"), None);
    let fetched = timeout(TEST_TIMEOUT, d.fetch_value("k1")).await.unwrap().unwrap();
    assert_eq!(fetched, Some(vec!["v1".to_string()]));
}

#[tokio::test]
async fn multiple_values_per_key_are_all_returned() {
    let (a, b, c) = three_node_network().await;
    a.store_value("k", "one").await.unwrap();
    b.store_value("k", "two").await.unwrap();

    let values = c.fetch_value("k").await.unwrap().expect("value present");
    assert_eq!(values, vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn silent_peer_is_dropped_by_lookup() {
    let (a, b, _c) = three_node_network().await;

    let silent_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_identity = LocalIdentity::generate(2, 2);
    let silent = Peer::from_socket_addr(silent_identity.identifier(), silent_socket.local_addr().unwrap());
    a.add_peer(silent).await.unwrap();
    assert!(known_ids(&a).await.contains(&silent.id()));

    let closest = timeout(TEST_TIMEOUT, a.lookup(silent.id())).await.unwrap();
    assert!(closest.iter().all(|p| p.id() != silent.id()));
    assert!(closest.iter().any(|p| p.id() == b.id()));
    assert!(!known_ids(&a).await.contains(&silent.id()));
}

#[tokio::test]
async fn removed_value_is_not_found() {
    let (a, b, c) = three_node_network().await;

    assert_eq!(a.store_value("k1", "v1").await.unwrap(), 3);
    assert_eq!(b.remove_value("k1", "v1").await.unwrap(), 3);

    assert_eq!(c.fetch_value("k1").await.unwrap(), None);
    assert_eq!(a.fetch_value("k1").await.unwrap(), None);
}

#[tokio::test]
async fn missing_key_is_not_an_error() {
    let (a, _b, _c) = three_node_network().await;
    assert_eq!(a.fetch_value("never-stored").await.unwrap(), None);
}

#[tokio::test]
async fn content_refresh_hands_keys_to_closer_node() {
    let config = test_config().with_k(1);
    let a = Node::bind("127.0.0.1:0", config.clone()).await.unwrap();
    let b = Node::bind("127.0.0.1:0", config).await.unwrap();

    // Choose a key that b is closer to than a.
    let key = (0..)
        .map(|i| format!("key-{}", i))
        .find(|key| {
            let id = NodeId::for_key(key);
            kadmesh::distance_cmp(&b.id().xor_distance(&id), &a.id().xor_distance(&id))
                == std::cmp::Ordering::Less
        })
        .unwrap();

    // Stored while alone, so the value lands on a.
    assert_eq!(a.store_value(&key, "v").await.unwrap(), 1);
    join(&a, &b).await;

    assert_eq!(a.refresh().await, 1);
    assert_eq!(a.store().get(&key), None);
    assert_eq!(b.store().get(&key), Some(vec!["v".to_string()]));
    assert_eq!(a.fetch_value(&key).await.unwrap(), Some(vec!["v".to_string()]));
}

#[tokio::test]
async fn ping_oldest_keeps_live_incumbent() {
    let config = test_config()
        .with_k(1)
        .with_eviction_policy(EvictionPolicy::PingOldest);
    let a = Node::bind("127.0.0.1:0", config.clone()).await.unwrap();

    // Two nodes at the same distance from a land in the same one-slot bucket.
    let mut candidates: Vec<Node> = Vec::new();
    let (incumbent, newcomer) = loop {
        let candidate = Node::bind("127.0.0.1:0", config.clone()).await.unwrap();
        let d = a.id().distance(&candidate.id());
        if let Some(pos) = candidates.iter().position(|c| a.id().distance(&c.id()) == d) {
            break (candidates.swap_remove(pos), candidate);
        }
        candidates.push(candidate);
    };

    join(&incumbent, &a).await;
    join(&newcomer, &a).await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    // The incumbent answered the probe, so it stays and the newcomer is dropped.
    let known = known_ids(&a).await;
    assert!(known.contains(&incumbent.id()));
    assert!(!known.contains(&newcomer.id()));
}
