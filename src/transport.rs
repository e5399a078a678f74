//! # UDP Transport
//!
//! One UDP socket per node. The [`Transport`] handle is cheap to clone; all
//! clones share the socket, the pending-request map and the handler table.
//!
//! ## Request/response correlation
//!
//! [`Transport::send`] picks a random message ID that is not currently
//! outstanding, registers the caller's [`EventSink`] under it, and arms a timer
//! task. Exactly one of two events is then delivered to the sink:
//!
//! - [`ActionEvent::Response`] when a response-typed datagram with that ID
//!   arrives (the timer is aborted), or
//! - [`ActionEvent::Timeout`] when the response timeout elapses first.
//!
//! Whichever side removes the entry from the pending map first wins, so the
//! two can never both fire.
//!
//! ## Unsolicited requests
//!
//! Request-typed datagrams are dispatched through a [`HandlerTable`] keyed by
//! [`MessageType`], fixed at construction. Each request runs on its own task;
//! a returned message is sent back with the request's message ID.
//!
//! ## Edge filtering
//!
//! Malformed datagrams and datagrams whose sender identifier fails the
//! proof-of-work check are dropped with a `debug!` log. Nothing received from
//! the network can terminate the receive loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::identity::Identifier;
use crate::messages::{Envelope, MAX_DATAGRAM_SIZE, Message, MessageType};
use crate::peer::Peer;

/// Outcome of one request, delivered to the action that sent it.
#[derive(Debug, Clone)]
pub enum ActionEvent {
    Response {
        message_id: u32,
        from: Peer,
        message: Message,
    },
    Timeout {
        message_id: u32,
    },
}

impl ActionEvent {
    pub fn message_id(&self) -> u32 {
        match self {
            ActionEvent::Response { message_id, .. } | ActionEvent::Timeout { message_id } => {
                *message_id
            }
        }
    }
}

pub type EventSink = mpsc::UnboundedSender<ActionEvent>;
pub type EventStream = mpsc::UnboundedReceiver<ActionEvent>;

/// Open a fresh per-action event channel.
pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

// ============================================================================
// Request Handlers
// ============================================================================

/// Answers one kind of unsolicited request.
///
/// `origin` carries the sender's verified identifier and the datagram's source
/// address. Returning `Some` sends that message back under the request's ID.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, transport: &Transport, origin: &Peer, request: Message) -> Option<Message>;
}

#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<MessageType, Arc<dyn RequestHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: MessageType, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: MessageType) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

// ============================================================================
// Transport
// ============================================================================

struct PendingRequest {
    sink: EventSink,
    timer: JoinHandle<()>,
}

struct TransportInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    local: Identifier,
    c1: u32,
    c2: u32,
    response_timeout: Duration,
    pending: Mutex<HashMap<u32, PendingRequest>>,
    handlers: HandlerTable,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        let task = self.recv_task.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = task.take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Bind the socket and start the receive loop.
    pub async fn bind(
        addr: SocketAddr,
        local: Identifier,
        config: &DhtConfig,
        handlers: HandlerTable,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {}", addr))?;
        Self::from_socket(socket, local, config, handlers)
    }

    /// Wrap an already bound socket and start the receive loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_socket(
        socket: UdpSocket,
        local: Identifier,
        config: &DhtConfig,
        handlers: HandlerTable,
    ) -> Result<Self> {
        let local_addr = socket.local_addr().context("failed to read local address")?;
        let socket = Arc::new(socket);

        let inner = Arc::new(TransportInner {
            socket: Arc::clone(&socket),
            local_addr,
            local,
            c1: config.c1,
            c2: config.c2,
            response_timeout: config.response_timeout,
            pending: Mutex::new(HashMap::new()),
            handlers,
            recv_task: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn(receive_loop(socket, Arc::downgrade(&inner)));
        *inner.recv_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        debug!(addr = %local_addr, id = %local.id().short(), "transport bound");
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn local_identifier(&self) -> Identifier {
        self.inner.local
    }

    /// Send `message` to `addr` and return the message ID used.
    ///
    /// With a sink, the request is tracked until a response or timeout is
    /// delivered to it. Without one the datagram is fire-and-forget.
    pub async fn send(&self, addr: SocketAddr, message: Message, sink: Option<EventSink>) -> Result<u32> {
        let kind = message.message_type();
        let mut pending = self.inner.pending.lock().await;
        let message_id = loop {
            let candidate: u32 = rand::random();
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };

        let bytes = Envelope::new(message_id, self.inner.local, message).encode()?;

        if let Some(sink) = sink {
            let timer = self.arm_timer(message_id);
            pending.insert(message_id, PendingRequest { sink, timer });
        }
        drop(pending);

        if let Err(e) = self.inner.socket.send_to(&bytes, addr).await {
            if let Some(request) = self.inner.pending.lock().await.remove(&message_id) {
                request.timer.abort();
            }
            return Err(e).with_context(|| format!("failed to send {:?} to {}", kind, addr));
        }

        trace!(to = %addr, ?kind, message_id, "sent request");
        Ok(message_id)
    }

    /// Send a response reusing the request's message ID.
    pub async fn reply(&self, addr: SocketAddr, message: Message, message_id: u32) -> Result<()> {
        let kind = message.message_type();
        let bytes = Envelope::new(message_id, self.inner.local, message).encode()?;
        self.inner
            .socket
            .send_to(&bytes, addr)
            .await
            .with_context(|| format!("failed to send {:?} to {}", kind, addr))?;
        trace!(to = %addr, ?kind, message_id, "sent response");
        Ok(())
    }

    /// Number of requests still awaiting a response or timeout.
    pub async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Stop receiving and drop all outstanding requests without notifying them.
    pub async fn shutdown(&self) {
        let task = self
            .inner
            .recv_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        let mut pending = self.inner.pending.lock().await;
        for (_, request) in pending.drain() {
            request.timer.abort();
        }
        debug!(addr = %self.inner.local_addr, "transport shut down");
    }

    fn arm_timer(&self, message_id: u32) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let delay = self.inner.response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let expired = inner.pending.lock().await.remove(&message_id);
            if let Some(request) = expired {
                trace!(message_id, "request timed out");
                let _ = request.sink.send(ActionEvent::Timeout { message_id });
            }
        })
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.inner.local_addr)
            .field("local", &self.inner.local)
            .finish()
    }
}

// ============================================================================
// Receive Loop
// ============================================================================

/// Pause after a socket error so a persistent failure cannot spin the loop.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

async fn receive_loop(socket: Arc<UdpSocket>, inner: Weak<TransportInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms.
                debug!(error = %e, "recv_from failed");
                tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                continue;
            }
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        dispatch(Transport { inner }, &buf[..len], from).await;
    }
}

async fn dispatch(transport: Transport, bytes: &[u8], from: SocketAddr) {
    let envelope = match Envelope::decode(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(%from, len = bytes.len(), error = %e, "dropping malformed datagram");
            return;
        }
    };

    let inner = &transport.inner;
    if let Err(e) = envelope.sender.verify(inner.c1, inner.c2) {
        debug!(%from, sender = %envelope.sender.id().short(), error = %e, "dropping datagram from invalid identifier");
        return;
    }

    let Envelope {
        message_id,
        sender,
        message,
    } = envelope;
    let origin = Peer::from_socket_addr(sender, from);
    let kind = message.message_type();

    if kind.is_response() {
        let request = inner.pending.lock().await.remove(&message_id);
        match request {
            Some(request) => {
                request.timer.abort();
                trace!(peer = %origin.id().short(), ?kind, message_id, "response correlated");
                let _ = request.sink.send(ActionEvent::Response {
                    message_id,
                    from: origin,
                    message,
                });
            }
            None => {
                trace!(peer = %origin.id().short(), ?kind, message_id, "dropping uncorrelated response");
            }
        }
        return;
    }

    let Some(handler) = inner.handlers.get(kind) else {
        debug!(peer = %origin.id().short(), ?kind, "no handler registered");
        return;
    };

    tokio::spawn(async move {
        if let Some(response) = handler.handle(&transport, &origin, message).await
            && let Err(e) = transport.reply(from, response, message_id).await
        {
            warn!(peer = %origin.id().short(), error = %e, "failed to send response");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ID_LEN, LocalIdentity, NodeId};
    use std::time::Duration;

    struct EchoConnect;

    #[async_trait]
    impl RequestHandler for EchoConnect {
        async fn handle(&self, _transport: &Transport, _origin: &Peer, request: Message) -> Option<Message> {
            match request {
                Message::Connect => Some(Message::ConnectResponse),
                _ => None,
            }
        }
    }

    fn config() -> DhtConfig {
        DhtConfig::default()
            .with_difficulty(0, 0)
            .with_response_timeout(Duration::from_millis(200))
    }

    fn handlers() -> HandlerTable {
        let mut table = HandlerTable::new();
        table.register(MessageType::Connect, Arc::new(EchoConnect));
        table
    }

    async fn transport(config: &DhtConfig) -> Transport {
        let identity = LocalIdentity::generate(0, 0);
        Transport::bind("127.0.0.1:0".parse().unwrap(), identity.identifier(), config, handlers())
            .await
            .expect("bind")
    }

    async fn next_event(stream: &mut EventStream) -> ActionEvent {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("event within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn request_is_answered_and_correlated() {
        let config = config();
        let a = transport(&config).await;
        let b = transport(&config).await;

        let (sink, mut stream) = event_channel();
        let id = a.send(b.local_addr(), Message::Connect, Some(sink)).await.unwrap();

        match next_event(&mut stream).await {
            ActionEvent::Response { message_id, from, message } => {
                assert_eq!(message_id, id);
                assert_eq!(from.identifier(), b.local_identifier());
                assert_eq!(from.socket_addr(), b.local_addr());
                assert_eq!(message, Message::ConnectResponse);
            }
            other => panic!("expected response, got {:?}", other),
        }
        assert_eq!(a.pending_len().await, 0);
    }

    #[tokio::test]
    async fn silent_peer_times_out_once() {
        let config = config();
        let a = transport(&config).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (sink, mut stream) = event_channel();
        let id = a
            .send(silent.local_addr().unwrap(), Message::Connect, Some(sink))
            .await
            .unwrap();

        match next_event(&mut stream).await {
            ActionEvent::Timeout { message_id } => assert_eq!(message_id, id),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(a.pending_len().await, 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(stream.try_recv().is_err(), "timeout delivered twice");
    }

    #[tokio::test]
    async fn malformed_datagrams_do_not_stop_the_loop() {
        let config = config();
        let a = transport(&config).await;
        let b = transport(&config).await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        raw.send_to(&[], b.local_addr()).await.unwrap();
        raw.send_to(&[0xAB; 3], b.local_addr()).await.unwrap();
        raw.send_to(&[0, 0, 0, 1, 0x42, 0, 0], b.local_addr()).await.unwrap();

        let (sink, mut stream) = event_channel();
        a.send(b.local_addr(), Message::Connect, Some(sink)).await.unwrap();
        assert!(matches!(next_event(&mut stream).await, ActionEvent::Response { .. }));
    }

    #[tokio::test]
    async fn loop_keeps_serving_after_sends_to_closed_ports() {
        let config = config();
        let a = transport(&config).await;
        let b = transport(&config).await;
        let closed = {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.local_addr().unwrap()
        };

        // Port-unreachable errors may surface on a's receive path.
        let (sink, mut stream) = event_channel();
        for _ in 0..5 {
            a.send(closed, Message::Connect, Some(sink.clone())).await.unwrap();
        }
        for _ in 0..5 {
            assert!(matches!(next_event(&mut stream).await, ActionEvent::Timeout { .. }));
        }

        a.send(b.local_addr(), Message::Connect, Some(sink)).await.unwrap();
        assert!(matches!(next_event(&mut stream).await, ActionEvent::Response { .. }));
    }

    #[tokio::test]
    async fn invalid_sender_identifier_is_ignored() {
        let strict = config().with_difficulty(24, 24);
        let b = transport(&strict).await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let forged = Identifier::from_parts(NodeId::from_bytes([0xFF; ID_LEN]), [0u8; ID_LEN]);
        let bytes = Envelope::new(7, forged, Message::Connect).encode().unwrap();
        raw.send_to(&bytes, b.local_addr()).await.unwrap();

        let mut buf = [0u8; 1024];
        let reply = tokio::time::timeout(Duration::from_millis(300), raw.recv_from(&mut buf)).await;
        assert!(reply.is_err(), "forged sender received a reply");
    }

    #[tokio::test]
    async fn uncorrelated_response_is_dropped() {
        let config = config();
        let a = transport(&config).await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = LocalIdentity::generate(0, 0);

        let (sink, mut stream) = event_channel();
        let id = a.send(raw.local_addr().unwrap(), Message::Connect, Some(sink)).await.unwrap();

        let stray = Envelope::new(id.wrapping_add(1), peer.identifier(), Message::ConnectResponse)
            .encode()
            .unwrap();
        raw.send_to(&stray, a.local_addr()).await.unwrap();

        // Only the timeout for the real request arrives.
        match next_event(&mut stream).await {
            ActionEvent::Timeout { message_id } => assert_eq!(message_id, id),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn shutdown_clears_pending_requests() {
        let config = config().with_response_timeout(Duration::from_secs(5));
        let a = transport(&config).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (sink, _stream) = event_channel();
        a.send(silent.local_addr().unwrap(), Message::Connect, Some(sink)).await.unwrap();
        assert_eq!(a.pending_len().await, 1);

        a.shutdown().await;
        assert_eq!(a.pending_len().await, 0);
    }
}
