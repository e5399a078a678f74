//! Shared state handed to every action and request handler.
//!
//! There is exactly one [`Components`] per node, built once in
//! [`Node::bind`](crate::node::Node::bind) and shared through an `Arc`. It
//! deliberately does not own the [`Transport`]: the transport owns the request
//! handlers, which own a `Components`, so the transport is passed alongside
//! instead.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError};

use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::config::{DhtConfig, EvictionPolicy};
use crate::identity::{LocalIdentity, NodeId};
use crate::messages::Message;
use crate::peer::Peer;
use crate::routing::{InsertOutcome, RoutingTable};
use crate::store::ValueStore;
use crate::transport::{ActionEvent, Transport, event_channel};

pub struct Components {
    pub config: DhtConfig,
    pub local: LocalIdentity,
    pub local_peer: Peer,
    pub routing: RwLock<RoutingTable>,
    pub store: Arc<dyn ValueStore>,
    /// Incumbents with an eviction probe in flight.
    probing: std::sync::Mutex<HashSet<NodeId>>,
}

impl Components {
    pub fn new(config: DhtConfig, local: LocalIdentity, local_peer: Peer, store: Arc<dyn ValueStore>) -> Self {
        let routing = RoutingTable::new(local.id(), config.k);
        Self {
            config,
            local,
            local_peer,
            routing: RwLock::new(routing),
            store,
            probing: std::sync::Mutex::new(HashSet::new()),
        }
    }

    #[inline]
    pub fn local_id(&self) -> NodeId {
        self.local.id()
    }

    /// Record that `peer` is alive.
    ///
    /// A full bucket is resolved per [`EvictionPolicy`]: under `DropNew` the
    /// newcomer is ignored; under `PingOldest` the bucket's least-recently-seen
    /// entry is probed in the background and replaced only if it stays silent.
    pub async fn observe(self: &Arc<Self>, transport: &Transport, peer: Peer) {
        let outcome = self.routing.write().await.insert(peer);
        match outcome {
            InsertOutcome::Inserted => {
                trace!(peer = %peer.id().short(), addr = %peer.socket_addr(), "peer added");
            }
            InsertOutcome::Refreshed | InsertOutcome::Local => {}
            InsertOutcome::Full { oldest } => match self.config.eviction_policy {
                EvictionPolicy::DropNew => {
                    trace!(peer = %peer.id().short(), "bucket full, dropping newcomer");
                }
                EvictionPolicy::PingOldest => self.spawn_probe(transport, oldest, peer),
            },
        }
    }

    fn spawn_probe(self: &Arc<Self>, transport: &Transport, oldest: Peer, newcomer: Peer) {
        {
            let mut probing = self.probing.lock().unwrap_or_else(PoisonError::into_inner);
            if !probing.insert(oldest.id()) {
                return;
            }
        }

        let components = Arc::clone(self);
        let transport = transport.clone();
        tokio::spawn(async move {
            let alive = components.probe(&transport, &oldest).await;
            {
                let mut routing = components.routing.write().await;
                if alive {
                    routing.refresh(&oldest.id());
                } else if routing.replace(&oldest.id(), newcomer) {
                    debug!(
                        evicted = %oldest.id().short(),
                        added = %newcomer.id().short(),
                        "replaced unresponsive incumbent"
                    );
                }
            }
            components
                .probing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&oldest.id());
        });
    }

    async fn probe(&self, transport: &Transport, peer: &Peer) -> bool {
        let (sink, mut events) = event_channel();
        if transport
            .send(peer.socket_addr(), Message::Connect, Some(sink))
            .await
            .is_err()
        {
            return false;
        }
        matches!(
            events.recv().await,
            Some(ActionEvent::Response { from, message: Message::ConnectResponse, .. })
                if from.id() == peer.id()
        )
    }
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("local_peer", &self.local_peer)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
