//! # High-Level Node API
//!
//! A [`Node`] owns one UDP transport, one routing table and one value store,
//! and exposes the DHT operations to an embedding application.
//!
//! ## Quick Start
//!
//! ```ignore
//! let config = DhtConfig::default();
//! let node = Node::bind("0.0.0.0:4000", config).await?;
//!
//! // Join through any reachable member.
//! node.connect("203.0.113.7:4000").await?;
//!
//! let replicas = node.store_value("greeting", "hello").await?;
//! let values = node.fetch_value("greeting").await?;
//!
//! // Embedders call this periodically.
//! node.refresh().await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::actions::{
    BucketRefreshAction, ConnectionAction, ContentRefreshAction, RemoveValueAction, StoreValueAction,
};
use crate::components::Components;
use crate::config::DhtConfig;
use crate::handlers::handler_table;
use crate::identity::{Identifier, LocalIdentity, NodeId};
use crate::lookup::{FetchValueAction, NodeLookupAction};
use crate::messages::{Envelope, Message};
use crate::peer::Peer;
use crate::store::{MemoryValueStore, ValueStore};
use crate::transport::Transport;

pub struct Node {
    components: Arc<Components>,
    transport: Transport,
}

impl Node {
    /// Create a node with a fresh identity.
    ///
    /// Identity generation is the proof-of-work and runs on a blocking thread;
    /// its cost grows with `2^c1`.
    pub async fn bind(addr: &str, config: DhtConfig) -> Result<Self> {
        config.validate()?;
        let (c1, c2) = (config.c1, config.c2);
        let identity = tokio::task::spawn_blocking(move || LocalIdentity::generate(c1, c2))
            .await
            .context("identity generation task failed")?;
        Self::bind_with_identity(addr, config, identity).await
    }

    /// Create a node with an existing identity and an in-memory store.
    pub async fn bind_with_identity(addr: &str, config: DhtConfig, identity: LocalIdentity) -> Result<Self> {
        Self::bind_with_store(addr, config, identity, Arc::new(MemoryValueStore::new())).await
    }

    /// Create a node backed by a caller-supplied value store.
    pub async fn bind_with_store(
        addr: &str,
        config: DhtConfig,
        identity: LocalIdentity,
        store: Arc<dyn ValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        identity
            .identifier()
            .verify(config.c1, config.c2)
            .context("local identity does not satisfy the configured difficulty")?;

        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", addr))?;
        let local_addr = socket.local_addr().context("failed to read local address")?;

        let local_peer = Peer::from_socket_addr(identity.identifier(), local_addr);
        let components = Arc::new(Components::new(config, identity, local_peer, store));
        let transport = Transport::from_socket(
            socket,
            local_peer.identifier(),
            &components.config,
            handler_table(&components),
        )?;

        info!(
            id = %local_peer.id(),
            addr = %local_addr,
            k = components.config.k,
            "node started"
        );
        Ok(Self { components, transport })
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn local_peer(&self) -> Peer {
        self.components.local_peer
    }

    pub fn identifier(&self) -> Identifier {
        self.components.local.identifier()
    }

    pub fn id(&self) -> NodeId {
        self.components.local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.components.config
    }

    pub fn store(&self) -> &Arc<dyn ValueStore> {
        &self.components.store
    }

    /// Every peer currently in the routing table.
    pub async fn known_peers(&self) -> Vec<Peer> {
        self.components.routing.read().await.all_nodes()
    }

    /// The `n` known peers closest to `target`, without any network traffic.
    pub async fn closest_known(&self, target: &NodeId, n: usize) -> Vec<Peer> {
        self.components.routing.read().await.find_closest(target, n)
    }

    /// Bucket distances not touched within `threshold`.
    pub async fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.components.routing.read().await.stale_buckets(threshold)
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Bootstrap from a seed address. On failure the node stays unconnected
    /// and the call may be retried.
    pub async fn connect(&self, seed: &str) -> Result<Peer> {
        let seed: SocketAddr = seed.parse().context("invalid seed address")?;
        if seed == self.local_addr() {
            bail!("cannot bootstrap from our own address {}", seed);
        }
        ConnectionAction::new(Arc::clone(&self.components), self.transport.clone(), seed)
            .execute()
            .await
            .with_context(|| format!("bootstrap via {} failed", seed))
    }

    /// Insert a peer directly into the routing table.
    ///
    /// The peer's identifier must pass the configured proof-of-work check.
    pub async fn add_peer(&self, peer: Peer) -> Result<()> {
        let config = &self.components.config;
        peer.identifier()
            .verify(config.c1, config.c2)
            .with_context(|| format!("refusing peer {:?}", peer))?;
        self.components.observe(&self.transport, peer).await;
        Ok(())
    }

    /// Iterative lookup for the `k` closest reachable peers to `target`.
    pub async fn lookup(&self, target: NodeId) -> Vec<Peer> {
        NodeLookupAction::new(Arc::clone(&self.components), self.transport.clone(), target)
            .execute()
            .await
    }

    /// Periodic maintenance: refresh every bucket, then republish local values.
    /// Returns how many keys were handed off and dropped locally.
    pub async fn refresh(&self) -> usize {
        BucketRefreshAction::new(Arc::clone(&self.components), self.transport.clone())
            .execute()
            .await;
        let dropped = ContentRefreshAction::new(Arc::clone(&self.components), self.transport.clone())
            .execute()
            .await;
        debug!(dropped_keys = dropped, "refresh complete");
        dropped
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Store `value` under `key` on the replication set. Returns the number of
    /// replicas that confirmed, the local node included when it is one of them.
    pub async fn store_value(&self, key: &str, value: &str) -> Result<usize> {
        self.check_fits(Message::StoreValue {
            key: key.to_owned(),
            value: value.to_owned(),
        })?;
        let successes = StoreValueAction::new(Arc::clone(&self.components), self.transport.clone(), key, value)
            .execute()
            .await;
        Ok(successes)
    }

    /// All values stored under `key`, or `None` if no reachable peer holds it.
    pub async fn fetch_value(&self, key: &str) -> Result<Option<Vec<String>>> {
        self.check_fits(Message::FetchValue { key: key.to_owned() })?;
        if let Some(values) = self.components.store.get(key) {
            return Ok(Some(values));
        }
        let values = FetchValueAction::new(Arc::clone(&self.components), self.transport.clone(), key)
            .execute()
            .await;
        Ok(values)
    }

    /// Remove `value` from the set under `key` on the replication set.
    pub async fn remove_value(&self, key: &str, value: &str) -> Result<usize> {
        self.check_fits(Message::RemoveValue {
            key: key.to_owned(),
            value: value.to_owned(),
        })?;
        let successes = RemoveValueAction::new(Arc::clone(&self.components), self.transport.clone(), key, value)
            .execute()
            .await;
        Ok(successes)
    }

    /// Stop the receive loop. Outstanding requests are abandoned.
    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
        info!(id = %self.id().short(), "node stopped");
    }

    fn check_fits(&self, message: Message) -> Result<()> {
        Envelope::new(0, self.identifier(), message)
            .encode()
            .context("request too large for one datagram")?;
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("local_peer", &self.components.local_peer)
            .field("local_addr", &self.transport.local_addr())
            .finish()
    }
}
