//! # Iterative Lookup
//!
//! [`NodeLookupAction`] and [`FetchValueAction`] share one engine. Each action
//! owns a query-state map (peer → [`QueryState`]) and a map of outstanding
//! message IDs, both private to the action and driven by a single loop:
//!
//! 1. Seed every peer in the routing table as `Unasked`; the local node is
//!    pre-marked `Asked` and never queried.
//! 2. Admit up to `max_concurrent_messages` requests, closest `Unasked` first.
//! 3. Await the next [`ActionEvent`] on the action's channel, bounded by the
//!    operation deadline.
//!    - Response: the responder is refreshed in the routing table and marked
//!      `Asked`; valid peers it returns join the map as `Unasked`.
//!    - Timeout: the peer is marked `Failed` and evicted from the routing table.
//! 4. Stop when a value is found (fetch only), when nothing is `Unasked` and
//!    nothing is in flight, or when the deadline passes.
//!
//! The result is the `Asked` peers ordered by XOR distance to the target,
//! capped at `k`. A deadline hit yields whatever was gathered so far; an
//! exhausted search is not an error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::components::Components;
use crate::identity::{NodeId, distance_cmp};
use crate::messages::Message;
use crate::peer::Peer;
use crate::transport::{ActionEvent, EventSink, Transport, event_channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Unasked,
    Awaiting,
    Asked,
    Failed,
}

#[derive(Debug, Clone)]
enum LookupKind {
    Node,
    Value { key: String },
}

struct LookupEngine {
    components: Arc<Components>,
    transport: Transport,
    target: NodeId,
    kind: LookupKind,
    states: HashMap<NodeId, (Peer, QueryState)>,
    in_flight: HashMap<u32, NodeId>,
    found: Option<Vec<String>>,
}

impl LookupEngine {
    fn new(components: Arc<Components>, transport: Transport, target: NodeId, kind: LookupKind) -> Self {
        Self {
            components,
            transport,
            target,
            kind,
            states: HashMap::new(),
            in_flight: HashMap::new(),
            found: None,
        }
    }

    fn request(&self) -> Message {
        match &self.kind {
            LookupKind::Node => Message::NodeLookup { target: self.target },
            LookupKind::Value { key } => Message::FetchValue { key: key.clone() },
        }
    }

    async fn seed(&mut self) {
        let known = self.components.routing.read().await.all_nodes();
        for peer in known {
            self.states.insert(peer.id(), (peer, QueryState::Unasked));
        }
        let local = self.components.local_peer;
        self.states.insert(local.id(), (local, QueryState::Asked));
    }

    async fn run(&mut self) {
        let config = &self.components.config;
        let deadline = Instant::now() + config.operation_timeout;
        let (sink, mut events) = event_channel();

        self.seed().await;

        loop {
            if self.found.is_some() {
                break;
            }
            self.admit(&sink).await;
            if self.in_flight.is_empty() {
                break;
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => self.on_event(event).await,
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        lookup = %self.target.short(),
                        in_flight = self.in_flight.len(),
                        "lookup deadline reached, returning partial result"
                    );
                    break;
                }
            }
        }

        debug!(
            lookup = %self.target.short(),
            asked = self.count(QueryState::Asked).saturating_sub(1),
            failed = self.count(QueryState::Failed),
            found = self.found.is_some(),
            "lookup finished"
        );
    }

    fn count(&self, state: QueryState) -> usize {
        self.states.values().filter(|(_, s)| *s == state).count()
    }

    fn closest_unasked(&self) -> Option<Peer> {
        self.states
            .values()
            .filter(|(_, state)| *state == QueryState::Unasked)
            .map(|(peer, _)| *peer)
            .min_by(|a, b| {
                distance_cmp(&a.id().xor_distance(&self.target), &b.id().xor_distance(&self.target))
            })
    }

    async fn admit(&mut self, sink: &EventSink) {
        let max = self.components.config.max_concurrent_messages;
        while self.in_flight.len() < max {
            let Some(peer) = self.closest_unasked() else {
                break;
            };
            match self
                .transport
                .send(peer.socket_addr(), self.request(), Some(sink.clone()))
                .await
            {
                Ok(message_id) => {
                    self.set_state(&peer.id(), QueryState::Awaiting);
                    self.in_flight.insert(message_id, peer.id());
                }
                Err(e) => {
                    debug!(peer = %peer.id().short(), error = %e, "lookup request not sent");
                    self.set_state(&peer.id(), QueryState::Failed);
                }
            }
        }
    }

    fn set_state(&mut self, id: &NodeId, state: QueryState) {
        if let Some(entry) = self.states.get_mut(id) {
            entry.1 = state;
        }
    }

    async fn on_event(&mut self, event: ActionEvent) {
        let Some(queried) = self.in_flight.remove(&event.message_id()) else {
            return;
        };

        match event {
            ActionEvent::Timeout { .. } => {
                self.set_state(&queried, QueryState::Failed);
                if let Some((peer, _)) = self.states.get(&queried).copied() {
                    let evicted = self.components.routing.write().await.set_unresponsive_node(&peer);
                    debug!(peer = %queried.short(), evicted, "lookup request timed out");
                }
            }
            ActionEvent::Response { from, message, .. } => {
                self.components.observe(&self.transport, from).await;
                if from.id() != queried {
                    debug!(
                        expected = %queried.short(),
                        got = %from.id().short(),
                        "responder identity changed"
                    );
                    self.set_state(&queried, QueryState::Failed);
                    return;
                }
                self.set_state(&queried, QueryState::Asked);

                match message {
                    Message::NodeLookupResponse { nodes } => self.merge(nodes),
                    Message::FetchValueResponse { values, nodes, .. } => {
                        if matches!(self.kind, LookupKind::Value { .. }) && !values.is_empty() {
                            trace!(peer = %queried.short(), values = values.len(), "value found");
                            self.found = Some(values);
                        }
                        self.merge(nodes);
                    }
                    other => {
                        trace!(peer = %queried.short(), kind = ?other.message_type(), "unexpected lookup reply");
                    }
                }
            }
        }
    }

    fn merge(&mut self, nodes: Vec<Peer>) {
        let (c1, c2) = (self.components.config.c1, self.components.config.c2);
        for peer in nodes {
            if self.states.contains_key(&peer.id()) {
                continue;
            }
            if !peer.identifier().is_valid(c1, c2) {
                trace!(peer = %peer.id().short(), "discarding learned peer with invalid identifier");
                continue;
            }
            self.states.insert(peer.id(), (peer, QueryState::Unasked));
        }
    }

    fn closest_nodes(&self) -> Vec<Peer> {
        let local = self.components.local_id();
        let mut asked: Vec<Peer> = self
            .states
            .values()
            .filter(|(peer, state)| *state == QueryState::Asked && peer.id() != local)
            .map(|(peer, _)| *peer)
            .collect();
        asked.sort_by(|a, b| {
            distance_cmp(&a.id().xor_distance(&self.target), &b.id().xor_distance(&self.target))
        });
        asked.truncate(self.components.config.k);
        asked
    }

    fn state_of(&self, id: &NodeId) -> Option<QueryState> {
        self.states.get(id).map(|(_, state)| *state)
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Converge on the `k` closest peers to a target identifier.
pub struct NodeLookupAction {
    engine: LookupEngine,
}

impl NodeLookupAction {
    pub fn new(components: Arc<Components>, transport: Transport, target: NodeId) -> Self {
        Self {
            engine: LookupEngine::new(components, transport, target, LookupKind::Node),
        }
    }

    /// Run the lookup to completion and return [`Self::closest_nodes`].
    pub async fn execute(&mut self) -> Vec<Peer> {
        self.engine.run().await;
        self.engine.closest_nodes()
    }

    pub fn closest_nodes(&self) -> Vec<Peer> {
        self.engine.closest_nodes()
    }

    pub fn state_of(&self, id: &NodeId) -> Option<QueryState> {
        self.engine.state_of(id)
    }
}

/// Search for the values stored under a key, following closer peers until
/// one of them holds it.
pub struct FetchValueAction {
    engine: LookupEngine,
}

impl FetchValueAction {
    pub fn new(components: Arc<Components>, transport: Transport, key: &str) -> Self {
        let target = NodeId::for_key(key);
        Self {
            engine: LookupEngine::new(
                components,
                transport,
                target,
                LookupKind::Value { key: key.to_owned() },
            ),
        }
    }

    /// Run the lookup; `None` means no reachable peer holds the key.
    pub async fn execute(&mut self) -> Option<Vec<String>> {
        self.engine.run().await;
        self.engine.found.clone()
    }

    pub fn closest_nodes(&self) -> Vec<Peer> {
        self.engine.closest_nodes()
    }
}
