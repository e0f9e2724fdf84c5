//! Query handlers every node answers out of the box.
//!
//! Both are ordinary registry entries and can be replaced with
//! [`Dht::register_query`].

use super::endpoint::Family;
use super::engine::Dht;
use super::error::DhtError;
use super::message::Message;
use super::node::NodeId;
use super::registry::Registry;
use super::routing::K;
use crate::bencode::{Dict, Value};
use bytes::Bytes;

pub(crate) fn register_builtin(registry: &Registry) {
    registry.register_query("ping", handle_ping);
    registry.register_query("find_node", handle_find_node);
}

fn handle_ping(dht: &mut Dht, query: &Message) -> Result<(), DhtError> {
    dht.learn_sender(query);
    dht.send_response(query, Dict::new())
}

/// Answers with the closest known nodes of the querying node's family, as
/// `nodes` (IPv4) or `nodes6` (IPv6).
fn handle_find_node(dht: &mut Dht, query: &Message) -> Result<(), DhtError> {
    let target = query
        .args()
        .and_then(|args| args.get(b"target".as_slice()))
        .and_then(Value::as_bytes)
        .ok_or_else(|| DhtError::InvalidMessage("missing target".into()))?;
    let target = NodeId::from_bytes(target)?;

    dht.learn_sender(query);

    let family = Family::of(&query.remote);
    let mut compact = Vec::new();
    if let Some(table) = dht.routing_table(family) {
        for node in table.closest(&target, K) {
            node.write_compact(&mut compact);
        }
    }

    let key = match family {
        Family::V4 => Bytes::from_static(b"nodes"),
        Family::V6 => Bytes::from_static(b"nodes6"),
    };
    let mut args = Dict::new();
    args.insert(key, Value::Bytes(Bytes::from(compact)));
    dht.send_response(query, args)
}
