//! # Actions
//!
//! Orchestrators built on [`NodeLookupAction`] and the transport.
//!
//! | Action | Purpose |
//! |--------|---------|
//! | [`ConnectionAction`] | bootstrap from a seed address |
//! | [`StoreValueAction`] | replicate a value to the `k` closest peers |
//! | [`RemoveValueAction`] | remove a value from the `k` closest peers |
//! | [`BucketRefreshAction`] | one lookup per bucket distance |
//! | [`ContentRefreshAction`] | republish local values, drop keys no longer ours |
//!
//! The replication set for a key is the lookup result plus the local node,
//! ordered by XOR distance to the key identifier and capped at `k`. When the
//! local node is in the set its store is mutated directly and counted as one
//! success. Remote peers are contacted at most `max_concurrent_messages` at a
//! time. There are no retries: failed or silent peers are left to the next
//! content refresh.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::components::Components;
use crate::identity::{ID_BITS, NodeId, distance_cmp, generate_by_distance};
use crate::lookup::NodeLookupAction;
use crate::messages::{Message, MessageType};
use crate::peer::Peer;
use crate::transport::{ActionEvent, Transport, event_channel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The seed did not answer before the deadline.
    Timeout { seed: SocketAddr },
    /// The seed answered with something other than `ConnectResponse`.
    Unexpected { seed: SocketAddr, kind: MessageType },
    /// The seed address reaches this node itself.
    SelfConnect { seed: SocketAddr },
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::Timeout { seed } => write!(f, "no response from seed {}", seed),
            ConnectError::Unexpected { seed, kind } => {
                write!(f, "seed {} answered connect with {:?}", seed, kind)
            }
            ConnectError::SelfConnect { seed } => write!(f, "seed {} is this node", seed),
        }
    }
}

impl std::error::Error for ConnectError {}

// ============================================================================
// Shared Helpers
// ============================================================================

/// Lookup result plus the local node, closest `k` to `key_id`.
async fn replication_set(components: &Arc<Components>, transport: &Transport, key_id: NodeId) -> Vec<Peer> {
    let mut set = NodeLookupAction::new(Arc::clone(components), transport.clone(), key_id)
        .execute()
        .await;
    set.push(components.local_peer);
    set.sort_by(|a, b| distance_cmp(&a.id().xor_distance(&key_id), &b.id().xor_distance(&key_id)));
    set.truncate(components.config.k);
    set
}

fn is_positive_ack(message: &Message) -> bool {
    matches!(
        message,
        Message::StoreValueResponse { success: true, .. } | Message::RemoveValueResponse { success: true, .. }
    )
}

/// Send each `(peer, request)` pair, at most `max_concurrent_messages` at a
/// time, and count positive acknowledgements received before the deadline.
async fn broadcast(components: &Arc<Components>, transport: &Transport, jobs: Vec<(Peer, Message)>) -> usize {
    let deadline = Instant::now() + components.config.operation_timeout;
    let max = components.config.max_concurrent_messages;
    let (sink, mut events) = event_channel();
    let mut queue = jobs.into_iter();
    let mut in_flight: HashMap<u32, Peer> = HashMap::new();
    let mut acked = 0;

    loop {
        while in_flight.len() < max {
            let Some((peer, request)) = queue.next() else {
                break;
            };
            match transport.send(peer.socket_addr(), request, Some(sink.clone())).await {
                Ok(message_id) => {
                    in_flight.insert(message_id, peer);
                }
                Err(e) => debug!(peer = %peer.id().short(), error = %e, "request not sent"),
            }
        }
        if in_flight.is_empty() {
            break;
        }

        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(ActionEvent::Response { message_id, from, message })) => {
                if in_flight.remove(&message_id).is_some() {
                    components.observe(transport, from).await;
                    if is_positive_ack(&message) {
                        acked += 1;
                    }
                }
            }
            Ok(Some(ActionEvent::Timeout { message_id })) => {
                if let Some(peer) = in_flight.remove(&message_id) {
                    components.routing.write().await.set_unresponsive_node(&peer);
                    debug!(peer = %peer.id().short(), "request timed out");
                }
            }
            Ok(None) => break,
            Err(_) => {
                debug!(unanswered = in_flight.len(), "broadcast deadline reached");
                break;
            }
        }
    }
    acked
}

// ============================================================================
// Connection
// ============================================================================

/// Join the network through a seed address.
pub struct ConnectionAction {
    components: Arc<Components>,
    transport: Transport,
    seed: SocketAddr,
}

impl ConnectionAction {
    pub fn new(components: Arc<Components>, transport: Transport, seed: SocketAddr) -> Self {
        Self {
            components,
            transport,
            seed,
        }
    }

    /// Handshake with the seed, look up our own identifier, then refresh every
    /// bucket. Returns the seed's peer record.
    ///
    /// On failure the error's root cause is a [`ConnectError`] and the
    /// routing table is left untouched.
    pub async fn execute(&self) -> Result<Peer> {
        let deadline = Instant::now() + self.components.config.operation_timeout;
        let (sink, mut events) = event_channel();
        self.transport
            .send(self.seed, Message::Connect, Some(sink))
            .await?;

        let seed = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(ActionEvent::Response {
                from,
                message: Message::ConnectResponse,
                ..
            })) => from,
            Ok(Some(ActionEvent::Response { message, .. })) => {
                return Err(ConnectError::Unexpected {
                    seed: self.seed,
                    kind: message.message_type(),
                }
                .into());
            }
            _ => return Err(ConnectError::Timeout { seed: self.seed }.into()),
        };
        if seed.id() == self.components.local_id() {
            return Err(ConnectError::SelfConnect { seed: self.seed }.into());
        }

        self.components.observe(&self.transport, seed).await;
        info!(seed = %self.seed, peer = %seed.id().short(), "connected to seed");

        let local = self.components.local_id();
        NodeLookupAction::new(Arc::clone(&self.components), self.transport.clone(), local)
            .execute()
            .await;
        BucketRefreshAction::new(Arc::clone(&self.components), self.transport.clone())
            .execute()
            .await;

        info!(
            known_peers = self.components.routing.read().await.len(),
            "bootstrap complete"
        );
        Ok(seed)
    }
}

// ============================================================================
// Store / Remove
// ============================================================================

pub struct StoreValueAction {
    components: Arc<Components>,
    transport: Transport,
    key: String,
    value: String,
}

impl StoreValueAction {
    pub fn new(components: Arc<Components>, transport: Transport, key: &str, value: &str) -> Self {
        Self {
            components,
            transport,
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }

    /// Returns how many replicas confirmed the store, the local node included.
    pub async fn execute(&self) -> usize {
        let local = self.components.local_id();
        let set = replication_set(&self.components, &self.transport, NodeId::for_key(&self.key)).await;

        let mut successes = 0;
        let mut jobs = Vec::with_capacity(set.len());
        for peer in set {
            if peer.id() == local {
                self.components.store.set(&self.key, &self.value);
                successes += 1;
            } else {
                let request = Message::StoreValue {
                    key: self.key.clone(),
                    value: self.value.clone(),
                };
                jobs.push((peer, request));
            }
        }
        successes += broadcast(&self.components, &self.transport, jobs).await;

        debug!(key = %self.key, successes, "store finished");
        successes
    }
}

pub struct RemoveValueAction {
    components: Arc<Components>,
    transport: Transport,
    key: String,
    value: String,
}

impl RemoveValueAction {
    pub fn new(components: Arc<Components>, transport: Transport, key: &str, value: &str) -> Self {
        Self {
            components,
            transport,
            key: key.to_owned(),
            value: value.to_owned(),
        }
    }

    /// Returns how many replicas confirmed the removal, the local node included.
    pub async fn execute(&self) -> usize {
        let local = self.components.local_id();
        let set = replication_set(&self.components, &self.transport, NodeId::for_key(&self.key)).await;

        let mut successes = 0;
        let mut jobs = Vec::with_capacity(set.len());
        for peer in set {
            if peer.id() == local {
                // Same rule as a remote ack: only a value actually removed counts.
                if self.components.store.remove(&self.key, &self.value) {
                    successes += 1;
                }
            } else {
                let request = Message::RemoveValue {
                    key: self.key.clone(),
                    value: self.value.clone(),
                };
                jobs.push((peer, request));
            }
        }
        successes += broadcast(&self.components, &self.transport, jobs).await;

        debug!(key = %self.key, successes, "remove finished");
        successes
    }
}

// ============================================================================
// Maintenance
// ============================================================================

/// One node lookup per bucket distance, each aimed at a synthetic target
/// that distance away from the local identifier.
pub struct BucketRefreshAction {
    components: Arc<Components>,
    transport: Transport,
}

impl BucketRefreshAction {
    pub fn new(components: Arc<Components>, transport: Transport) -> Self {
        Self { components, transport }
    }

    pub async fn execute(&self) {
        let local = self.components.local_id();
        for d in 1..=ID_BITS {
            let target = generate_by_distance(&local, d);
            NodeLookupAction::new(Arc::clone(&self.components), self.transport.clone(), target)
                .execute()
                .await;
        }
        debug!(
            known_peers = self.components.routing.read().await.len(),
            "bucket refresh finished"
        );
    }
}

/// Republish every locally held value to its current replication set and
/// drop keys the local node is no longer responsible for.
pub struct ContentRefreshAction {
    components: Arc<Components>,
    transport: Transport,
}

impl ContentRefreshAction {
    pub fn new(components: Arc<Components>, transport: Transport) -> Self {
        Self { components, transport }
    }

    /// Returns the number of keys dropped from the local store.
    pub async fn execute(&self) -> usize {
        let local = self.components.local_id();
        let mut dropped = 0;

        for (key, values) in self.components.store.get_all_entries() {
            let set = replication_set(&self.components, &self.transport, NodeId::for_key(&key)).await;
            let responsible = set.iter().any(|p| p.id() == local);

            let mut jobs = Vec::new();
            for peer in set.iter().filter(|p| p.id() != local) {
                for value in &values {
                    let request = Message::StoreValue {
                        key: key.clone(),
                        value: value.clone(),
                    };
                    jobs.push((*peer, request));
                }
            }
            let acked = broadcast(&self.components, &self.transport, jobs).await;

            if !responsible {
                for value in &values {
                    self.components.store.remove(&key, value);
                }
                dropped += 1;
            }
            debug!(%key, values = values.len(), acked, responsible, "republished key");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::handlers::handler_table;
    use crate::identity::LocalIdentity;
    use crate::store::{MemoryValueStore, ValueStore};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn config() -> DhtConfig {
        DhtConfig::default()
            .with_difficulty(0, 0)
            .with_response_timeout(Duration::from_millis(200))
            .with_operation_timeout(Duration::from_secs(3))
    }

    async fn serving_node(config: DhtConfig) -> (Arc<Components>, Transport) {
        let identity = LocalIdentity::generate(config.c1, config.c2);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local_peer = Peer::from_socket_addr(identity.identifier(), socket.local_addr().unwrap());
        let components = Arc::new(Components::new(
            config.clone(),
            identity.clone(),
            local_peer,
            Arc::new(MemoryValueStore::new()),
        ));
        let transport =
            Transport::from_socket(socket, identity.identifier(), &config, handler_table(&components)).unwrap();
        (components, transport)
    }

    #[tokio::test]
    async fn connect_to_silent_seed_times_out() {
        let (a, a_t) = serving_node(config()).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let seed = silent.local_addr().unwrap();

        let err = ConnectionAction::new(Arc::clone(&a), a_t, seed)
            .execute()
            .await
            .unwrap_err();
        assert_eq!(
            err.root_cause().downcast_ref::<ConnectError>(),
            Some(&ConnectError::Timeout { seed })
        );
        assert!(a.routing.read().await.is_empty());
    }

    #[tokio::test]
    async fn connect_populates_both_tables() {
        let (seed, seed_t) = serving_node(config()).await;
        let (a, a_t) = serving_node(config()).await;

        let peer = ConnectionAction::new(Arc::clone(&a), a_t, seed_t.local_addr())
            .execute()
            .await
            .unwrap();
        assert_eq!(peer.id(), seed.local_id());
        assert!(a.routing.read().await.contains(&seed.local_id()));
        assert!(seed.routing.read().await.contains(&a.local_id()));
    }

    #[tokio::test]
    async fn connect_to_own_alias_is_refused() {
        let identity = LocalIdentity::generate(0, 0);
        let socket = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let local_peer = Peer::from_socket_addr(identity.identifier(), socket.local_addr().unwrap());
        let a = Arc::new(Components::new(
            config(),
            identity.clone(),
            local_peer,
            Arc::new(MemoryValueStore::new()),
        ));
        let a_t = Transport::from_socket(socket, identity.identifier(), &config(), handler_table(&a)).unwrap();

        let seed: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let err = ConnectionAction::new(Arc::clone(&a), a_t, seed)
            .execute()
            .await
            .unwrap_err();
        assert_eq!(
            err.root_cause().downcast_ref::<ConnectError>(),
            Some(&ConnectError::SelfConnect { seed })
        );
        assert!(a.routing.read().await.is_empty());
    }

    #[tokio::test]
    async fn lone_node_stores_locally() {
        let (a, a_t) = serving_node(config()).await;
        let successes = StoreValueAction::new(Arc::clone(&a), a_t.clone(), "k", "v")
            .execute()
            .await;
        assert_eq!(successes, 1);
        assert_eq!(a.store.get("k"), Some(vec!["v".to_string()]));

        let successes = RemoveValueAction::new(Arc::clone(&a), a_t, "k", "v")
            .execute()
            .await;
        assert_eq!(successes, 1);
        assert_eq!(a.store.get("k"), None);
    }

    #[tokio::test]
    async fn store_replicates_to_known_peers() {
        let (a, a_t) = serving_node(config()).await;
        let (b, _b_t) = serving_node(config()).await;
        let (c, _c_t) = serving_node(config()).await;
        {
            let mut routing = a.routing.write().await;
            routing.insert(b.local_peer);
            routing.insert(c.local_peer);
        }

        let successes = StoreValueAction::new(Arc::clone(&a), a_t, "k1", "v1")
            .execute()
            .await;
        assert_eq!(successes, 3);
        for node in [&a, &b, &c] {
            assert_eq!(node.store.get("k1"), Some(vec!["v1".to_string()]));
        }
    }

    #[tokio::test]
    async fn remove_of_absent_value_counts_nobody() {
        let (a, a_t) = serving_node(config()).await;
        let (b, _b_t) = serving_node(config()).await;
        let (c, _c_t) = serving_node(config()).await;
        {
            let mut routing = a.routing.write().await;
            routing.insert(b.local_peer);
            routing.insert(c.local_peer);
        }

        let successes = RemoveValueAction::new(Arc::clone(&a), a_t.clone(), "never", "stored")
            .execute()
            .await;
        assert_eq!(successes, 0);

        StoreValueAction::new(Arc::clone(&a), a_t.clone(), "k", "v")
            .execute()
            .await;
        let successes = RemoveValueAction::new(Arc::clone(&a), a_t, "k", "v")
            .execute()
            .await;
        assert_eq!(successes, 3);
    }

    #[tokio::test]
    async fn broadcast_respects_concurrency_limit() {
        let response_timeout = Duration::from_millis(150);
        let (a, a_t) = serving_node(
            config()
                .with_max_concurrent_messages(1)
                .with_response_timeout(response_timeout),
        )
        .await;

        let mut silent_sockets = Vec::new();
        let mut jobs = Vec::new();
        for _ in 0..3 {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let peer = Peer::from_socket_addr(
                LocalIdentity::generate(0, 0).identifier(),
                socket.local_addr().unwrap(),
            );
            let request = Message::StoreValue {
                key: "k".into(),
                value: "v".into(),
            };
            jobs.push((peer, request));
            silent_sockets.push(socket);
        }

        let started = Instant::now();
        let sending = broadcast(&a, &a_t, jobs);
        tokio::pin!(sending);
        let mut max_pending = 0;
        let acked = loop {
            tokio::select! {
                acked = &mut sending => break acked,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    max_pending = max_pending.max(a_t.pending_len().await);
                }
            }
        };

        assert_eq!(acked, 0);
        assert_eq!(max_pending, 1);
        assert!(started.elapsed() >= response_timeout * 3);
    }

    #[tokio::test]
    async fn content_refresh_migrates_keys_away() {
        let (a, a_t) = serving_node(config().with_k(1)).await;
        let (b, _b_t) = serving_node(config()).await;
        a.routing.write().await.insert(b.local_peer);

        // Find a key for which b is strictly closer than a.
        let key = (0..)
            .map(|i| format!("key-{}", i))
            .find(|key| {
                let id = NodeId::for_key(key);
                distance_cmp(&b.local_id().xor_distance(&id), &a.local_id().xor_distance(&id))
                    == std::cmp::Ordering::Less
            })
            .unwrap();
        a.store.set(&key, "v");

        let dropped = ContentRefreshAction::new(Arc::clone(&a), a_t).execute().await;
        assert_eq!(dropped, 1);
        assert_eq!(a.store.get(&key), None);
        assert_eq!(b.store.get(&key), Some(vec!["v".to_string()]));
    }

    #[tokio::test]
    async fn content_refresh_keeps_keys_we_own() {
        let (a, a_t) = serving_node(config()).await;
        a.store.set("mine", "v");
        let dropped = ContentRefreshAction::new(Arc::clone(&a), a_t).execute().await;
        assert_eq!(dropped, 0);
        assert_eq!(a.store.get("mine"), Some(vec!["v".to_string()]));
    }
}
