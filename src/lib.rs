//! dht-engine - A DHT node engine over UDP
//!
//! This crate implements the message, transaction and endpoint core of a
//! Kademlia-style DHT: bencoded query/response/error RPCs, per-query
//! transaction tracking with expiry, and dual-stack socket multiplexing
//! inside a caller-driven pulse loop.
//!
//! # Modules
//!
//! - [`bencode`] - Bencode values, encoding and decoding
//! - [`dht`] - Node engine: endpoints, dispatch registries, transactions,
//!   routing table

pub mod bencode;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Dict, Value};
pub use dht::{
    Dht, DhtConfig, DhtError, DhtState, Endpoint, Family, Message, MessageKind, NodeId, Outcome,
    Registry, RoutingTable, TransactionId,
};
