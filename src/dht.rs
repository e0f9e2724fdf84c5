//! Pulse-driven DHT node engine.
//!
//! A [`Dht`] owns one or more UDP [`Endpoint`]s (any mix of IPv4 and IPv6),
//! decodes every inbound datagram into a [`Message`] and routes it:
//!
//! - queries go to the handler registered for their method name, and an
//!   unknown method is answered with a `204 Method Unknown` error;
//! - responses and errors are matched against the [`TransactionTable`] of
//!   queries this node sent, by transaction id and source address;
//! - every message first passes the hook registered for its type tag.
//!
//! Nothing runs in the background. The caller drives the node by awaiting
//! [`Dht::pulse`] in a loop; each pulse receives, sweeps expired
//! transactions and sends at most one queued datagram.
//!
//! ```no_run
//! use dht_engine::bencode::Dict;
//! use dht_engine::dht::{Dht, DhtConfig, Outcome};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut dht = Dht::new(DhtConfig::default());
//! dht.bind(None, "127.0.0.1:5309".parse()?)?;
//!
//! dht.register_query("echo", |dht, query| {
//!     let args = query.args().cloned().unwrap_or_default();
//!     dht.send_response(query, args)
//! });
//!
//! dht.send_query("127.0.0.1:5310".parse()?, "echo", Dict::new(), |_, outcome| {
//!     if let Outcome::Timeout = outcome {
//!         eprintln!("peer did not answer");
//!     }
//! })?;
//!
//! loop {
//!     dht.pulse(Duration::from_millis(100)).await?;
//! }
//! # }
//! ```

mod config;
mod endpoint;
mod engine;
mod error;
mod handlers;
mod message;
mod node;
mod registry;
mod routing;
mod transaction;

pub use config::{
    DhtConfig, DEFAULT_PORT, DEFAULT_PULSE_TIMEOUT, RECV_BUFFER_SIZE, SEND_QUEUE_LIMIT,
    TRANSACTION_EXPIRATION,
};
pub use endpoint::{Endpoint, Family};
pub use engine::{Dht, DhtState};
pub use error::DhtError;
pub use message::{
    ErrorCode, Message, MessageKind, TransactionId, ERROR_MAX_LEN, QUERY_MAX_LEN,
    TRANSACTION_ID_MAX_LEN, TYPE_MAX_LEN,
};
pub use node::{
    parse_compact_nodes, Node, NodeId, COMPACT_NODE_V4_LEN, COMPACT_NODE_V6_LEN, NODE_ID_LEN,
};
pub use registry::{Handler, Registry};
pub use routing::{RoutingTable, K};
pub use transaction::{Outcome, Transaction, TransactionCallback, TransactionTable};

#[cfg(test)]
mod tests;
