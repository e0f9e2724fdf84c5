use super::config::DhtConfig;
use super::endpoint::{Endpoint, Family};
use super::error::DhtError;
use super::handlers;
use super::message::{ErrorCode, Message, MessageKind};
use super::node::{parse_compact_nodes, Node, NodeId, COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN};
use super::registry::{Handler, Registry};
use super::routing::RoutingTable;
use super::transaction::{Outcome, TransactionCallback, TransactionTable};
use crate::bencode::{Dict, Value};
use bytes::{Bytes, BytesMut};
use futures::future::select_all;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhtState {
    Unbound,
    Bound,
    Running,
    Stopped,
}

struct Outbound {
    local: SocketAddr,
    remote: SocketAddr,
    data: Bytes,
}

/// A DHT node: endpoints, dispatch tables and outstanding queries, driven by
/// repeated calls to [`Dht::pulse`].
///
/// # Examples
///
/// ```no_run
/// use dht_engine::dht::{Dht, DhtConfig, DEFAULT_PULSE_TIMEOUT};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut dht = Dht::new(DhtConfig::default());
/// dht.bind(None, "0.0.0.0:5309".parse()?)?;
///
/// dht.send_ping("192.0.2.7:5309".parse()?)?;
///
/// loop {
///     dht.pulse(DEFAULT_PULSE_TIMEOUT).await?;
/// }
/// # }
/// ```
pub struct Dht {
    config: DhtConfig,
    state: DhtState,
    registry: Arc<Registry>,
    endpoints: Vec<Arc<Endpoint>>,
    endpoints_by_addr: HashMap<SocketAddr, Arc<Endpoint>>,
    recv_buffer: BytesMut,
    send_queue: VecDeque<Outbound>,
    transactions: TransactionTable,
    routing: HashMap<Family, RoutingTable>,
}

impl Dht {
    /// Creates an unbound engine with the built-in `ping` and `find_node`
    /// query handlers registered.
    pub fn new(config: DhtConfig) -> Self {
        let registry = Arc::new(Registry::new());
        handlers::register_builtin(&registry);

        Self {
            recv_buffer: BytesMut::zeroed(config.recv_buffer_size),
            config,
            state: DhtState::Unbound,
            registry,
            endpoints: Vec::new(),
            endpoints_by_addr: HashMap::new(),
            send_queue: VecDeque::new(),
            transactions: TransactionTable::new(),
            routing: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn state(&self) -> DhtState {
        self.state
    }

    /// Shared handle for registering handlers from outside the pulse loop.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn register_type<F>(&self, name: &str, handler: F) -> Option<Handler>
    where
        F: Fn(&mut Dht, &Message) -> Result<(), DhtError> + Send + Sync + 'static,
    {
        self.registry.register_type(name, handler)
    }

    pub fn register_query<F>(&self, name: &str, handler: F) -> Option<Handler>
    where
        F: Fn(&mut Dht, &Message) -> Result<(), DhtError> + Send + Sync + 'static,
    {
        self.registry.register_query(name, handler)
    }

    pub fn register_error<F>(&self, name: &str, handler: F) -> Option<Handler>
    where
        F: Fn(&mut Dht, &Message) -> Result<(), DhtError> + Send + Sync + 'static,
    {
        self.registry.register_error(name, handler)
    }

    pub fn autoroute(&mut self, enabled: bool, port: u16) {
        self.config.autoroute = enabled;
        self.config.autoroute_port = port;
    }

    /// Binds a UDP endpoint on `addr`, advertising `id` (random if `None`).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(&mut self, id: Option<NodeId>, addr: SocketAddr) -> Result<&Endpoint, DhtError> {
        if self.state == DhtState::Stopped {
            return Err(DhtError::Stopped);
        }

        let family = Family::of(&addr);
        let enabled = match family {
            Family::V4 => self.config.bind_ipv4,
            Family::V6 => self.config.bind_ipv6,
        };
        if !enabled {
            return Err(DhtError::FamilyDisabled(addr));
        }
        if self.endpoints_by_addr.contains_key(&addr) {
            return Err(DhtError::AddressInUse(addr));
        }

        let id = id.unwrap_or_else(NodeId::generate);
        let endpoint = Endpoint::bind(id, addr).map_err(|e| match e {
            DhtError::Io(io) if io.kind() == ErrorKind::AddrInUse => DhtError::AddressInUse(addr),
            other => other,
        })?;
        let local = endpoint.local_addr();
        let endpoint = Arc::new(endpoint);

        info!("DHT endpoint bound to {} with id {}", local, id);

        self.routing
            .entry(family)
            .or_insert_with(|| RoutingTable::new(id));
        self.endpoints_by_addr.insert(local, Arc::clone(&endpoint));
        self.endpoints.push(endpoint);
        if self.state == DhtState::Unbound {
            self.state = DhtState::Bound;
        }

        Ok(self.endpoints[self.endpoints.len() - 1].as_ref())
    }

    /// Discovers the local address of `family` and binds it on the
    /// autoroute port.
    pub fn autoroute_bind(&mut self, family: Family) -> Result<&Endpoint, DhtError> {
        let ip = family
            .discover_local_ip()
            .ok_or(DhtError::NoRoute(family.name()))?;
        let port = self.config.autoroute_port;
        self.bind(None, SocketAddr::new(ip, port))
    }

    /// Closes the endpoint bound on `addr` and drops its queued datagrams.
    pub fn unbind(&mut self, addr: SocketAddr) -> Result<(), DhtError> {
        let endpoint = self
            .endpoints_by_addr
            .remove(&addr)
            .ok_or(DhtError::NoEndpoint(addr))?;
        self.endpoints.retain(|e| !Arc::ptr_eq(e, &endpoint));
        self.send_queue.retain(|o| o.local != addr);

        info!("DHT endpoint {} unbound", addr);

        if self.endpoints.is_empty() && self.state != DhtState::Stopped {
            self.state = DhtState::Unbound;
        }
        Ok(())
    }

    pub fn endpoint(&self, addr: &SocketAddr) -> Option<&Endpoint> {
        self.endpoints_by_addr.get(addr).map(Arc::as_ref)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().map(Arc::as_ref)
    }

    pub fn routing_table(&self, family: Family) -> Option<&RoutingTable> {
        self.routing.get(&family)
    }

    pub fn routing_table_mut(&mut self, family: Family) -> Option<&mut RoutingTable> {
        self.routing.get_mut(&family)
    }

    pub fn transactions(&self) -> &TransactionTable {
        &self.transactions
    }

    #[cfg(test)]
    pub(crate) fn transactions_mut(&mut self) -> &mut TransactionTable {
        &mut self.transactions
    }

    /// Number of datagrams waiting to be sent.
    pub fn queued(&self) -> usize {
        self.send_queue.len()
    }

    /// The receive buffer, for feeding [`Dht::process`] directly.
    pub fn recv_buffer_mut(&mut self) -> &mut [u8] {
        &mut self.recv_buffer
    }

    /// Runs one iteration of the event loop.
    ///
    /// In order: waits up to `timeout` for any endpoint to become readable,
    /// receives and dispatches at most one datagram per endpoint, expires
    /// overdue transactions, then sends at most one queued datagram. Only
    /// the first step suspends.
    pub async fn pulse(&mut self, timeout: Duration) -> Result<(), DhtError> {
        if self.state == DhtState::Stopped {
            return Err(DhtError::Stopped);
        }
        if self.endpoints.is_empty() {
            return Err(DhtError::NotBound);
        }
        self.state = DhtState::Running;

        let endpoints = self.endpoints.clone();
        wait_readable(&endpoints, timeout).await;

        for endpoint in &endpoints {
            if self.state == DhtState::Stopped {
                return Ok(());
            }
            if self.endpoints_by_addr.contains_key(&endpoint.local_addr()) {
                self.receive(endpoint);
            }
        }

        self.transaction_sweep(Instant::now());
        self.flush_one();
        Ok(())
    }

    fn receive(&mut self, endpoint: &Endpoint) {
        let local = endpoint.local_addr();
        match endpoint.socket().try_recv_from(&mut self.recv_buffer) {
            Ok((len, remote)) => {
                trace!("{} <- {} ({} bytes)", local, remote, len);
                if let Err(e) = self.process(local, remote, len) {
                    debug!("Dropping datagram from {}: {}", remote, e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("Receive on {} failed: {}", local, e),
        }
    }

    /// Parses the first `len` bytes of the receive buffer as a datagram that
    /// arrived on `local` from `remote`, and dispatches it.
    ///
    /// A parse failure is returned and leaves the engine untouched.
    pub fn process(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        len: usize,
    ) -> Result<(), DhtError> {
        let len = len.min(self.recv_buffer.len());
        let message = Message::parse(local, remote, &self.recv_buffer[..len])?;
        self.dispatch(message);
        Ok(())
    }

    fn dispatch(&mut self, message: Message) {
        let type_handler = self.registry.type_handler(message.kind.type_name());
        let hooked = type_handler.is_some();
        if let Some(handler) = type_handler {
            if let Err(e) = handler(self, &message) {
                debug!(
                    "Type handler {:?} failed for message from {}: {}",
                    message.kind.type_name(),
                    message.remote,
                    e
                );
            }
        }

        match &message.kind {
            MessageKind::Query { method, .. } => self.dispatch_query(&message, method),
            MessageKind::Response { .. } => {
                match self
                    .transactions
                    .take_match(&message.transaction_id, message.remote)
                {
                    Some(transaction) => transaction.complete(self, Outcome::Response(&message)),
                    None => debug!(
                        "Dropping unmatched response {:?} from {}",
                        message.transaction_id, message.remote
                    ),
                }
            }
            MessageKind::Error { code, description } => {
                let Some(transaction) = self
                    .transactions
                    .take_match(&message.transaction_id, message.remote)
                else {
                    debug!(
                        "Dropping unmatched error {:?} from {}",
                        message.transaction_id, message.remote
                    );
                    return;
                };

                debug!(
                    "Query {} to {} failed: {} {}",
                    transaction.id(),
                    message.remote,
                    code,
                    description
                );
                transaction.complete(self, Outcome::Error(&message));

                if let Some(handler) = self.registry.error_handler(description) {
                    if let Err(e) = handler(self, &message) {
                        debug!("Error handler {:?} failed: {}", description, e);
                    }
                }
            }
            MessageKind::Other { tag, .. } => {
                if !hooked {
                    debug!("No handler for message type {:?} from {}", tag, message.remote);
                }
            }
        }
    }

    fn dispatch_query(&mut self, message: &Message, method: &str) {
        let Some(handler) = self.registry.query_handler(method) else {
            debug!("Unknown query {:?} from {}", method, message.remote);
            self.reply_error(message, ErrorCode::MethodUnknown);
            return;
        };

        if let Err(e) = handler(self, message) {
            debug!("Query {:?} from {} failed: {}", method, message.remote, e);
            let code = match e {
                DhtError::InvalidMessage(_) | DhtError::InvalidNodeId | DhtError::Bencode(_) => {
                    ErrorCode::Protocol
                }
                _ => ErrorCode::Server,
            };
            self.reply_error(message, code);
        }
    }

    fn reply_error(&mut self, message: &Message, code: ErrorCode) {
        match self.send_error(message, code.code(), code.description()) {
            Ok(()) | Err(DhtError::QueueFull(_)) => {}
            Err(e) => warn!("Failed to queue error reply to {}: {}", message.remote, e),
        }
    }

    /// Starts tracking an outbound query to `remote` that expires after the
    /// configured delay.
    pub fn transaction_begin(&mut self, remote: SocketAddr, callback: TransactionCallback) -> u32 {
        let expiration = Instant::now() + self.config.transaction_expiration;
        self.transactions.begin(remote, expiration, callback)
    }

    /// Times out every transaction due at `now`, running each callback with
    /// [`Outcome::Timeout`]. Returns how many expired.
    pub fn transaction_sweep(&mut self, now: Instant) -> usize {
        let expired = self.transactions.sweep(now);
        let count = expired.len();

        for transaction in expired {
            debug!(
                "Transaction {} to {} timed out",
                transaction.id(),
                transaction.remote()
            );
            transaction.complete(self, Outcome::Timeout);
        }

        count
    }

    /// Drops a pending transaction without running its callback.
    pub fn cancel_transaction(&mut self, id: u32) -> bool {
        self.transactions.cancel(id)
    }

    /// Queues query `method` to `remote` and tracks it; the node id of the
    /// sending endpoint is filled into `args` unless already present.
    pub fn send_query<F>(
        &mut self,
        remote: SocketAddr,
        method: &str,
        mut args: Dict,
        callback: F,
    ) -> Result<u32, DhtError>
    where
        F: FnOnce(&mut Dht, Outcome<'_>) + Send + 'static,
    {
        let endpoint = self.endpoint_for(remote)?;
        insert_id(&mut args, endpoint.id());

        let id = self.transaction_begin(remote, Box::new(callback));
        let data = match Message::encode_query(id, method, args) {
            Ok(data) => data,
            Err(e) => {
                self.transactions.cancel(id);
                return Err(e);
            }
        };

        if let Err(e) = self.enqueue(endpoint.local_addr(), remote, data) {
            self.transactions.cancel(id);
            return Err(e);
        }
        trace!("Queued {} query {} to {}", method, id, remote);
        Ok(id)
    }

    /// Queues a response to `query` on the endpoint it arrived on.
    pub fn send_response(&mut self, query: &Message, mut args: Dict) -> Result<(), DhtError> {
        let endpoint = self.reply_endpoint(query)?;
        insert_id(&mut args, endpoint.id());

        let data = Message::encode_response(&query.transaction_id, args)?;
        self.enqueue(query.local, query.remote, data)
    }

    /// Queues a protocol error reply to `query`.
    pub fn send_error(
        &mut self,
        query: &Message,
        code: i64,
        description: &str,
    ) -> Result<(), DhtError> {
        self.reply_endpoint(query)?;

        let data = Message::encode_error(&query.transaction_id, code, description)?;
        self.enqueue(query.local, query.remote, data)
    }

    pub fn send_ping(&mut self, remote: SocketAddr) -> Result<u32, DhtError> {
        self.send_query(remote, "ping", Dict::new(), move |dht, outcome| match outcome {
            Outcome::Response(reply) => dht.learn_sender(reply),
            Outcome::Error(_) => {}
            Outcome::Timeout => dht.mark_unresponsive(remote),
        })
    }

    pub fn send_find_node(&mut self, remote: SocketAddr, target: NodeId) -> Result<u32, DhtError> {
        let mut args = Dict::new();
        args.insert(Bytes::from_static(b"target"), Value::bytes(target.as_bytes()));

        self.send_query(remote, "find_node", args, move |dht, outcome| match outcome {
            Outcome::Response(reply) => {
                dht.learn_sender(reply);
                dht.learn_nodes(reply);
            }
            Outcome::Error(_) => {}
            Outcome::Timeout => dht.mark_unresponsive(remote),
        })
    }

    /// Inserts the sender of `message` into the routing table of its family.
    pub fn learn_sender(&mut self, message: &Message) {
        let Some(id) = message.sender_id() else {
            return;
        };
        if let Some(table) = self.routing.get_mut(&Family::of(&message.remote)) {
            table.insert(Node::new(id, message.remote));
        }
    }

    fn learn_nodes(&mut self, reply: &Message) {
        let Some(args) = reply.args() else {
            return;
        };

        let compact = [
            (&b"nodes"[..], COMPACT_NODE_V4_LEN),
            (&b"nodes6"[..], COMPACT_NODE_V6_LEN),
        ];
        for (key, entry_len) in compact {
            let Some(data) = args.get(key).and_then(Value::as_bytes) else {
                continue;
            };
            for node in parse_compact_nodes(data, entry_len) {
                if let Some(table) = self.routing.get_mut(&Family::of(&node.addr)) {
                    table.insert(node);
                }
            }
        }
    }

    fn mark_unresponsive(&mut self, remote: SocketAddr) {
        if let Some(table) = self.routing.get_mut(&Family::of(&remote)) {
            table.mark_failed(&remote);
        }
    }

    /// Stops the engine: closes every endpoint and discards pending
    /// transactions and queued datagrams without running any callback.
    /// Returns the number of transactions discarded.
    pub fn shutdown(&mut self) -> usize {
        if self.state == DhtState::Stopped {
            return 0;
        }

        let dropped = self.transactions.clear();
        self.send_queue.clear();
        self.endpoints.clear();
        self.endpoints_by_addr.clear();
        self.state = DhtState::Stopped;

        info!("DHT shut down, discarded {} pending transactions", dropped);
        dropped
    }

    fn endpoint_for(&mut self, remote: SocketAddr) -> Result<Arc<Endpoint>, DhtError> {
        if self.state == DhtState::Stopped {
            return Err(DhtError::Stopped);
        }

        let family = Family::of(&remote);
        if let Some(endpoint) = self.endpoints.iter().find(|e| e.family() == family) {
            return Ok(Arc::clone(endpoint));
        }
        if !self.config.autoroute {
            return Err(DhtError::NoEndpoint(remote));
        }

        let local = self.autoroute_bind(family)?.local_addr();
        self.endpoints_by_addr
            .get(&local)
            .cloned()
            .ok_or(DhtError::NoEndpoint(remote))
    }

    fn reply_endpoint(&self, query: &Message) -> Result<Arc<Endpoint>, DhtError> {
        self.endpoints_by_addr
            .get(&query.local)
            .cloned()
            .ok_or(DhtError::NoEndpoint(query.remote))
    }

    fn enqueue(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        data: Bytes,
    ) -> Result<(), DhtError> {
        if self.send_queue.len() >= self.config.send_queue_limit {
            debug!(
                "Send queue full ({} datagrams), dropping datagram to {}",
                self.send_queue.len(),
                remote
            );
            return Err(DhtError::QueueFull(remote));
        }

        self.send_queue.push_back(Outbound {
            local,
            remote,
            data,
        });
        Ok(())
    }

    /// Sends the head of the queue if its socket takes it right away.
    fn flush_one(&mut self) {
        let Some(head) = self.send_queue.front() else {
            return;
        };
        let (local, remote) = (head.local, head.remote);

        let Some(endpoint) = self.endpoints_by_addr.get(&local) else {
            debug!("Dropping datagram for {}: endpoint {} is gone", remote, local);
            self.send_queue.pop_front();
            return;
        };

        match endpoint.socket().try_send_to(&head.data, remote) {
            Ok(sent) => {
                trace!("{} -> {} ({} bytes)", local, remote, sent);
                self.send_queue.pop_front();
            }
            // still at the head, retried next pulse
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!("Send to {} would block", remote)
            }
            Err(e) => {
                warn!("Send from {} to {} failed: {}", local, remote, e);
                self.send_queue.pop_front();
            }
        }
    }
}

impl Default for Dht {
    fn default() -> Self {
        Self::new(DhtConfig::default())
    }
}

fn insert_id(args: &mut Dict, id: &NodeId) {
    args.entry(Bytes::from_static(b"id"))
        .or_insert_with(|| Value::bytes(id.as_bytes()));
}

async fn wait_readable(endpoints: &[Arc<Endpoint>], timeout: Duration) {
    let readiness = endpoints
        .iter()
        .map(|endpoint| Box::pin(endpoint.socket().readable()));

    if let Ok((Err(e), idx, _)) = tokio::time::timeout(timeout, select_all(readiness)).await {
        warn!(
            "Readiness wait on {} failed: {}",
            endpoints[idx].local_addr(),
            e
        );
    }
}
