//! # Kadmesh - Kademlia DHT over UDP
//!
//! Kadmesh is a peer-to-peer distributed hash table node. A swarm of untrusted
//! peers cooperatively stores small string key/value records without a
//! central directory; a joining peer discovers the network from a single seed
//! address.
//!
//! - **Identity**: 160-bit identifiers minted by a two-stage proof-of-work
//!   (S/Kademlia static and dynamic puzzles) over an Ed25519 keypair
//! - **Routing**: XOR-metric k-buckets with a configurable full-bucket policy
//! - **Wire**: a compact big-endian binary protocol, one message per datagram
//! - **Actions**: iterative parallel lookups plus store, fetch, remove and
//!   periodic bucket/content refresh
//!
//! ## Architecture
//!
//! A [`Node`] owns one [`Transport`] and one shared [`Components`] aggregate
//! (configuration, local identity, routing table, value store). Every action
//! is a short-lived struct that borrows both, drives its own event channel and
//! returns a result when it converges or its deadline passes. The transport's
//! receive loop answers unsolicited requests through a [`HandlerTable`] fixed
//! at construction.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API for embedders |
//! | `identity` | Identifiers, proof-of-work, XOR distance |
//! | `peer` | Identifier plus UDP address |
//! | `routing` | k-bucket routing table |
//! | `messages` | Wire format encode/decode |
//! | `transport` | UDP socket, request correlation, timeouts, dispatch |
//! | `store` | Pluggable local value storage |
//! | `config` | Tunables |
//! | `components` | Shared per-node state |
//! | `handlers` | Answers to unsolicited requests |
//! | `lookup` | Iterative node and value lookup |
//! | `actions` | Connect, store, remove, bucket and content refresh |

mod actions;
mod components;
mod config;
mod handlers;
mod identity;
mod lookup;
mod messages;
mod node;
mod peer;
mod routing;
mod store;
mod transport;

pub use actions::{
    BucketRefreshAction, ConnectError, ConnectionAction, ContentRefreshAction, RemoveValueAction,
    StoreValueAction,
};
pub use components::Components;
pub use config::{
    DEFAULT_C1, DEFAULT_C2, DEFAULT_K, DEFAULT_MAX_CONCURRENT_MESSAGES, DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_RESPONSE_TIMEOUT, DhtConfig, EvictionPolicy,
};
pub use handlers::handler_table;
pub use identity::{
    ID_BITS, ID_LEN, Identifier, IdentityError, Keypair, LocalIdentity, NodeId, Puzzle, distance,
    distance_cmp, generate_by_distance, hash160, leading_zero_bits, validate,
};
pub use lookup::{FetchValueAction, NodeLookupAction, QueryState};
pub use messages::{Envelope, MAX_DATAGRAM_SIZE, Message, MessageType, WireError};
pub use node::Node;
pub use peer::Peer;
pub use routing::{InsertOutcome, RoutingTable};
pub use store::{MemoryValueStore, ValueStore};
pub use transport::{
    ActionEvent, EventSink, EventStream, HandlerTable, RequestHandler, Transport, event_channel,
};
