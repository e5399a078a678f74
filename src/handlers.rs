//! Handlers for unsolicited requests, one per request type.
//!
//! Every handler first learns the sender (see [`Components::observe`]) and then
//! answers from local state only. None of them issue further network requests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::components::Components;
use crate::identity::NodeId;
use crate::messages::{Message, MessageType};
use crate::peer::Peer;
use crate::transport::{HandlerTable, RequestHandler, Transport};

/// Build the dispatch table registered with the node's transport.
pub fn handler_table(components: &Arc<Components>) -> HandlerTable {
    let mut table = HandlerTable::new();
    table.register(MessageType::Connect, Arc::new(ConnectHandler(Arc::clone(components))));
    table.register(MessageType::NodeLookup, Arc::new(NodeLookupHandler(Arc::clone(components))));
    table.register(MessageType::FetchValue, Arc::new(FetchValueHandler(Arc::clone(components))));
    table.register(MessageType::StoreValue, Arc::new(StoreValueHandler(Arc::clone(components))));
    table.register(MessageType::RemoveValue, Arc::new(RemoveValueHandler(Arc::clone(components))));
    table
}

fn unexpected(expected: MessageType, got: &Message) -> Option<Message> {
    debug!(?expected, got = ?got.message_type(), "handler received wrong message type");
    Some(Message::Error {
        message: format!("expected {:?}", expected),
    })
}

/// Closest known peers to `target`, leaving out the requester itself.
async fn closest_excluding(components: &Components, target: &NodeId, requester: &NodeId) -> Vec<Peer> {
    let k = components.config.k;
    let mut nodes = components.routing.read().await.find_closest(target, k + 1);
    nodes.retain(|p| p.id() != *requester);
    nodes.truncate(k);
    nodes
}

struct ConnectHandler(Arc<Components>);

#[async_trait]
impl RequestHandler for ConnectHandler {
    async fn handle(&self, transport: &Transport, origin: &Peer, request: Message) -> Option<Message> {
        let Message::Connect = request else {
            return unexpected(MessageType::Connect, &request);
        };
        self.0.observe(transport, *origin).await;
        debug!(peer = %origin.id().short(), addr = %origin.socket_addr(), "peer connected");
        Some(Message::ConnectResponse)
    }
}

struct NodeLookupHandler(Arc<Components>);

#[async_trait]
impl RequestHandler for NodeLookupHandler {
    async fn handle(&self, transport: &Transport, origin: &Peer, request: Message) -> Option<Message> {
        let Message::NodeLookup { target } = request else {
            return unexpected(MessageType::NodeLookup, &request);
        };
        self.0.observe(transport, *origin).await;
        let nodes = closest_excluding(&self.0, &target, &origin.id()).await;
        trace!(peer = %origin.id().short(), target_id = %target.short(), returned = nodes.len(), "node lookup");
        Some(Message::NodeLookupResponse { nodes })
    }
}

struct FetchValueHandler(Arc<Components>);

#[async_trait]
impl RequestHandler for FetchValueHandler {
    async fn handle(&self, transport: &Transport, origin: &Peer, request: Message) -> Option<Message> {
        let Message::FetchValue { key } = request else {
            return unexpected(MessageType::FetchValue, &request);
        };
        self.0.observe(transport, *origin).await;
        let values = self.0.store.get(&key).unwrap_or_default();
        let nodes = closest_excluding(&self.0, &NodeId::for_key(&key), &origin.id()).await;
        trace!(peer = %origin.id().short(), %key, values = values.len(), "fetch value");
        Some(Message::FetchValueResponse { key, values, nodes })
    }
}

struct StoreValueHandler(Arc<Components>);

#[async_trait]
impl RequestHandler for StoreValueHandler {
    async fn handle(&self, transport: &Transport, origin: &Peer, request: Message) -> Option<Message> {
        let Message::StoreValue { key, value } = request else {
            return unexpected(MessageType::StoreValue, &request);
        };
        self.0.observe(transport, *origin).await;
        self.0.store.set(&key, &value);
        trace!(peer = %origin.id().short(), %key, "stored value");
        Some(Message::StoreValueResponse { key, success: true })
    }
}

struct RemoveValueHandler(Arc<Components>);

#[async_trait]
impl RequestHandler for RemoveValueHandler {
    async fn handle(&self, transport: &Transport, origin: &Peer, request: Message) -> Option<Message> {
        let Message::RemoveValue { key, value } = request else {
            return unexpected(MessageType::RemoveValue, &request);
        };
        self.0.observe(transport, *origin).await;
        let success = self.0.store.remove(&key, &value);
        trace!(peer = %origin.id().short(), %key, success, "removed value");
        Some(Message::RemoveValueResponse { key, success })
    }
}
