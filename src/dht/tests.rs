use super::*;
use crate::bencode::{Dict, Value};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PING: &[u8] = b"d1:ad2:id20:12345678901234567890e1:q4:ping1:t2:421:y1:qe";

fn v4(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn feed(dht: &mut Dht, local: SocketAddr, remote: SocketAddr, data: &[u8]) -> Result<(), DhtError> {
    dht.recv_buffer_mut()[..data.len()].copy_from_slice(data);
    dht.process(local, remote, data.len())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn callback<F>(f: F) -> TransactionCallback
where
    F: FnOnce(&mut Dht, Outcome<'_>) + Send + 'static,
{
    Box::new(f)
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (Arc::clone(&count), count)
}

#[test]
fn test_node_id_generate() {
    let id1 = NodeId::generate();
    let id2 = NodeId::generate();
    assert_ne!(id1, id2);
    assert_ne!(id1, NodeId::ZERO);
}

#[test]
fn test_node_id_from_bytes() {
    let bytes = [1u8; 20];
    let id = NodeId::from_bytes(&bytes).unwrap();
    assert_eq!(id.0, bytes);

    assert!(matches!(
        NodeId::from_bytes(&[1u8; 10]),
        Err(DhtError::InvalidNodeId)
    ));
}

#[test]
fn test_node_id_distance() {
    let id1 = NodeId([0u8; 20]);
    let id2 = NodeId([0xFF; 20]);

    assert_eq!(id1.distance(&id2), [0xFF; 20]);
    assert_eq!(id1.distance(&id1), [0u8; 20]);
}

#[test]
fn test_node_id_bucket_index() {
    let id1 = NodeId([0u8; 20]);
    let mut id2 = [0u8; 20];
    id2[0] = 0x80;
    assert_eq!(id1.bucket_index(&NodeId(id2)), 0);

    let mut id3 = [0u8; 20];
    id3[1] = 0x01;
    assert_eq!(id1.bucket_index(&NodeId(id3)), 15);
}

#[test]
fn test_node_compact_v4() {
    let id = NodeId([1u8; 20]);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881);

    let mut compact = Vec::new();
    Node::new(id, addr).write_compact(&mut compact);
    assert_eq!(compact.len(), COMPACT_NODE_V4_LEN);

    let parsed = Node::from_compact(&compact).unwrap();
    assert_eq!(parsed.id, id);
    assert_eq!(parsed.addr, addr);
    assert!(!parsed.is_verified());
    assert!(!parsed.is_good());
}

#[test]
fn test_node_compact_v6() {
    let id = NodeId([2u8; 20]);
    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5309);

    let mut compact = Vec::new();
    Node::new(id, addr).write_compact(&mut compact);
    assert_eq!(compact.len(), COMPACT_NODE_V6_LEN);

    let nodes = parse_compact_nodes(&compact, COMPACT_NODE_V6_LEN);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].addr, addr);
}

#[test]
fn test_parse_compact_nodes_skips_ragged_tail() {
    let mut compact = Vec::new();
    Node::new(NodeId([3u8; 20]), v4(1, 1000)).write_compact(&mut compact);
    Node::new(NodeId([4u8; 20]), v4(2, 2000)).write_compact(&mut compact);
    compact.extend_from_slice(&[0xAA; 7]);

    let nodes = parse_compact_nodes(&compact, COMPACT_NODE_V4_LEN);
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[1].id, NodeId([4u8; 20]));
}

#[test]
fn test_node_state() {
    let mut node = Node::new(NodeId::generate(), v4(1, 6881));

    assert!(node.is_good());
    assert!(!node.is_bad());

    node.fail();
    node.fail();
    node.fail();
    assert!(node.is_bad());

    node.touch();
    assert!(node.is_good());
}

#[test]
fn test_routing_table_insert() {
    let our_id = NodeId::generate();
    let mut table = RoutingTable::new(our_id);

    for i in 0..10 {
        table.insert(Node::new(NodeId::generate(), v4(i, 6881)));
    }
    assert!(!table.is_empty());

    assert!(!table.insert(Node::new(our_id, v4(99, 6881))));
}

#[test]
fn test_routing_table_bucket_overflow() {
    let mut table = RoutingTable::new(NodeId([0u8; 20]));

    // all land in bucket 0
    for i in 0..(K as u8 + 2) {
        let mut id = [0u8; 20];
        id[0] = 0x80;
        id[19] = i;
        let accepted = table.insert(Node::new(NodeId(id), v4(i, 6881)));
        assert_eq!(accepted, (i as usize) < K);
    }
    assert_eq!(table.len(), K);

    let mut first = [0u8; 20];
    first[0] = 0x80;
    assert!(table.remove(&NodeId(first)).is_some());
    // a replacement moved up
    assert_eq!(table.len(), K);
}

#[test]
fn test_routing_table_closest() {
    let mut table = RoutingTable::new(NodeId::generate());

    for i in 1..20u8 {
        let mut id = [0u8; 20];
        id[0] = i;
        table.insert(Node::new(NodeId(id), v4(i, 6881)));
    }

    let target = NodeId([0u8; 20]);
    let closest = table.closest(&target, 8);
    assert_eq!(closest.len(), 8);
    assert_eq!(closest[0].id.0[0], 1);
    assert!(closest
        .windows(2)
        .all(|w| w[0].id.distance(&target) <= w[1].id.distance(&target)));
}

#[test]
fn test_routing_table_hides_unverified_nodes() {
    let mut table = RoutingTable::new(NodeId([0u8; 20]));
    let id = NodeId([0x40; 20]);

    let mut compact = Vec::new();
    Node::new(id, v4(8, 8000)).write_compact(&mut compact);
    assert!(table.insert(Node::from_compact(&compact).unwrap()));

    assert_eq!(table.len(), 1);
    assert!(table.closest(&id, K).is_empty());

    table.insert(Node::new(id, v4(8, 8000)));
    assert_eq!(table.closest(&id, K).len(), 1);

    // a later third-party report must not move it
    table.insert(Node::unverified(id, v4(9, 9000)));
    assert_eq!(table.get(&id).unwrap().addr, v4(8, 8000));
}

#[test]
fn test_routing_table_mark_failed_evicts() {
    let mut table = RoutingTable::new(NodeId::generate());
    let id = NodeId::generate();
    let addr = v4(5, 6881);
    table.insert(Node::new(id, addr));

    table.mark_failed(&addr);
    table.mark_failed(&addr);
    assert!(table.get(&id).is_some());

    table.mark_failed(&addr);
    assert!(table.get(&id).is_none());
}

#[test]
fn test_transaction_id_bounds() {
    assert!(matches!(
        TransactionId::from_slice(b""),
        Err(DhtError::InvalidTransactionId(0))
    ));
    assert!(matches!(
        TransactionId::from_slice(&[7u8; 21]),
        Err(DhtError::InvalidTransactionId(21))
    ));

    let tid = TransactionId::from_slice(&[7u8; 20]).unwrap();
    assert_eq!(tid.as_bytes().len(), 20);
    assert_eq!(tid.as_u32(), None);

    let tid = TransactionId::from_u32(0x01020304);
    assert_eq!(tid.as_bytes(), &[1, 2, 3, 4]);
    assert_eq!(tid.as_u32(), Some(0x01020304));
}

#[test]
fn test_message_parse_ping() {
    let local = v4(1, 5309);
    let remote = v4(2, 6881);
    let msg = Message::parse(local, remote, PING).unwrap();

    assert_eq!(msg.local, local);
    assert_eq!(msg.remote, remote);
    assert_eq!(msg.transaction_id.as_bytes(), b"42");
    assert_eq!(msg.kind.type_name(), "q");
    assert_eq!(msg.method(), Some("ping"));
    assert_eq!(
        msg.sender_id(),
        Some(NodeId(*b"12345678901234567890"))
    );
}

#[test]
fn test_message_query_round_trip() {
    let mut args = Dict::new();
    args.insert(Bytes::from_static(b"target"), Value::bytes(&[9u8; 20]));

    let data = Message::encode_query(77, "find_node", args.clone()).unwrap();
    let msg = Message::parse(v4(1, 1), v4(2, 2), &data).unwrap();

    assert_eq!(msg.transaction_id.as_u32(), Some(77));
    assert_eq!(
        msg.kind,
        MessageKind::Query {
            method: "find_node".into(),
            args
        }
    );
}

#[test]
fn test_message_error_round_trip() {
    let tid = TransactionId::from_slice(b"xy").unwrap();
    let data = Message::encode_error(&tid, 204, "Method Unknown").unwrap();
    assert_eq!(&data[..], b"d1:eli204e14:Method Unknowne1:t2:xy1:y1:ee");

    let msg = Message::parse(v4(1, 1), v4(2, 2), &data).unwrap();
    assert_eq!(
        msg.kind,
        MessageKind::Error {
            code: 204,
            description: "Method Unknown".into()
        }
    );
}

#[test]
fn test_message_encode_limits() {
    assert!(Message::encode_query(1, "", Dict::new()).is_err());
    assert!(Message::encode_query(1, &"q".repeat(QUERY_MAX_LEN + 1), Dict::new()).is_err());

    let tid = TransactionId::from_u32(1);
    assert!(Message::encode_error(&tid, 201, &"e".repeat(ERROR_MAX_LEN + 1)).is_err());
    assert!(Message::encode_error(&tid, 201, &"e".repeat(ERROR_MAX_LEN)).is_ok());
}

#[test]
fn test_message_parse_rejects_malformed() {
    let cases: &[&[u8]] = &[
        b"",
        b"d1:t2:42",
        b"li1ee",
        b"d1:y1:qe",
        b"d1:t2:42e",
        b"d1:t0:1:y1:re",
        b"d1:rd2:id20:12345678901234567890e1:t21:1234567890123456789011:y1:re",
        b"d1:t2:421:y21:zzzzzzzzzzzzzzzzzzzzze",
        b"d1:ad2:id20:12345678901234567890e1:t2:421:y1:qe",
        b"d1:q4:ping1:t2:421:y1:qe",
        b"d1:t2:421:y1:re",
        b"d1:eli201ee1:t2:421:y1:ee",
        b"d1:el4:oops10:not a codee1:t2:421:y1:ee",
        b"d1:e4:oops1:t2:421:y1:ee",
    ];

    for data in cases {
        assert!(
            Message::parse(v4(1, 1), v4(2, 2), data).is_err(),
            "accepted {:?}",
            String::from_utf8_lossy(data)
        );
    }
}

#[test]
fn test_message_parse_custom_type() {
    let msg = Message::parse(v4(1, 1), v4(2, 2), b"d1:t2:aa1:v3:abc1:y1:ze").unwrap();

    assert_eq!(msg.kind.type_name(), "z");
    assert!(msg.method().is_none());
    assert!(msg.args().is_none());
    match msg.kind {
        MessageKind::Other { tag, body } => {
            assert_eq!(tag, "z");
            assert_eq!(body.get(&b"v"[..]).and_then(Value::as_str), Some("abc"));
        }
        other => panic!("unexpected kind {:?}", other),
    }
}

#[test]
fn test_transaction_ids_unique_per_remote() {
    let mut dht = Dht::default();

    let a = dht.transaction_begin(v4(1, 1000), callback(|_, _| {}));
    let b = dht.transaction_begin(v4(2, 2000), callback(|_, _| {}));

    assert_ne!(a, b);
    assert_eq!(dht.transactions().len(), 2);
    assert_eq!(dht.transactions().get(a).unwrap().remote(), v4(1, 1000));
    assert_eq!(dht.transactions().get(b).unwrap().remote(), v4(2, 2000));
}

#[test]
fn test_transaction_id_wrap_skips_in_flight() {
    let mut table = TransactionTable::new();
    let expiration = Instant::now() + TRANSACTION_EXPIRATION;

    let first = table.begin(v4(1, 1), expiration, callback(|_, _| {}));
    assert_eq!(first, 1);

    table.rewind_to(u32::MAX);
    assert_eq!(table.begin(v4(1, 1), expiration, callback(|_, _| {})), u32::MAX);
    assert_eq!(table.begin(v4(1, 1), expiration, callback(|_, _| {})), 0);
    // 1 is still outstanding
    assert_eq!(table.begin(v4(1, 1), expiration, callback(|_, _| {})), 2);
    assert_eq!(table.len(), 4);
}

#[test]
fn test_transaction_match_checks_address() {
    let mut table = TransactionTable::new();
    let id = table.begin(
        v4(1, 1000),
        Instant::now() + TRANSACTION_EXPIRATION,
        callback(|_, _| {}),
    );
    let tid = TransactionId::from_u32(id);

    assert!(table.take_match(&tid, v4(9, 1000)).is_none());
    assert!(table.contains(id));

    assert!(table
        .take_match(&TransactionId::from_slice(b"xx").unwrap(), v4(1, 1000))
        .is_none());

    let transaction = table.take_match(&tid, v4(1, 1000)).unwrap();
    assert_eq!(transaction.id(), id);
    assert!(table.is_empty());
}

#[test]
fn test_transaction_sweep_times_out() {
    let mut dht = Dht::default();
    let remote = v4(3, 3000);
    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);

    let now = Instant::now();
    let past = now.checked_sub(Duration::from_secs(5)).unwrap_or(now);
    dht.transactions_mut().begin(
        remote,
        past,
        callback(move |_, outcome| {
            *seen.lock() = Some(matches!(outcome, Outcome::Timeout));
        }),
    );
    let later = dht.transactions_mut().begin(
        remote,
        now + Duration::from_secs(60),
        callback(|_, _| panic!("not due yet")),
    );

    assert_eq!(dht.transaction_sweep(now), 1);
    assert_eq!(*outcome.lock(), Some(true));
    assert_eq!(dht.transactions().len(), 1);
    assert!(dht.transactions().contains(later));
}

#[test]
fn test_transaction_sweep_oldest_first() {
    let mut table = TransactionTable::new();
    let now = Instant::now();

    let late = table.begin(v4(1, 1), now + Duration::from_secs(2), callback(|_, _| {}));
    let early = table.begin(v4(1, 1), now + Duration::from_secs(1), callback(|_, _| {}));

    let swept: Vec<u32> = table
        .sweep(now + Duration::from_secs(5))
        .iter()
        .map(Transaction::id)
        .collect();
    assert_eq!(swept, vec![early, late]);
}

#[test]
fn test_response_completes_transaction_once() {
    let mut dht = Dht::default();
    let local = v4(1, 5309);
    let remote = v4(2, 6881);
    let (calls, seen) = counter();

    let id = dht.transaction_begin(
        remote,
        callback(move |_, outcome| {
            assert!(matches!(outcome, Outcome::Response(_)));
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let mut args = Dict::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(&[5u8; 20]));
    let data = Message::encode_response(&TransactionId::from_u32(id), args).unwrap();

    feed(&mut dht, local, remote, &data).unwrap();
    feed(&mut dht, local, remote, &data).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(dht.transactions().is_empty());
    assert_eq!(dht.transaction_sweep(Instant::now() + Duration::from_secs(3600)), 0);
}

#[test]
fn test_response_from_wrong_address_ignored() {
    let mut dht = Dht::default();
    let (calls, seen) = counter();

    let id = dht.transaction_begin(
        v4(2, 6881),
        callback(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let data = Message::encode_response(&TransactionId::from_u32(id), Dict::new()).unwrap();

    feed(&mut dht, v4(1, 5309), v4(3, 6881), &data).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(dht.transactions().contains(id));
}

#[test]
fn test_error_reply_runs_callback_and_error_handler() {
    let mut dht = Dht::default();
    let remote = v4(2, 6881);
    let (handled, seen_handler) = counter();
    let code = Arc::new(Mutex::new(None));
    let seen_code = Arc::clone(&code);

    dht.register_error("Generic Error", move |_, msg| {
        assert_eq!(msg.remote, v4(2, 6881));
        seen_handler.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let id = dht.transaction_begin(
        remote,
        callback(move |_, outcome| {
            if let Outcome::Error(msg) = outcome {
                if let MessageKind::Error { code, .. } = msg.kind {
                    *seen_code.lock() = Some(code);
                }
            }
        }),
    );

    let data = Message::encode_error(&TransactionId::from_u32(id), 201, "Generic Error").unwrap();
    feed(&mut dht, v4(1, 5309), remote, &data).unwrap();

    assert_eq!(*code.lock(), Some(201));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(dht.transactions().is_empty());
}

#[test]
fn test_unmatched_error_skips_error_handler() {
    let mut dht = Dht::default();
    let (handled, seen) = counter();
    dht.register_error("Generic Error", move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let data = Message::encode_error(&TransactionId::from_u32(99), 201, "Generic Error").unwrap();
    feed(&mut dht, v4(1, 5309), v4(2, 6881), &data).unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_skips_callback() {
    let mut dht = Dht::default();
    let (calls, seen) = counter();

    let id = dht.transaction_begin(
        v4(2, 6881),
        callback(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(dht.cancel_transaction(id));
    assert!(!dht.cancel_transaction(id));
    assert_eq!(dht.transaction_sweep(Instant::now() + Duration::from_secs(3600)), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_registry_replace_and_unregister() {
    let registry = Registry::new();

    assert!(registry.register_query("echo", |_, _| Ok(())).is_none());
    assert!(registry.register_query("echo", |_, _| Ok(())).is_some());
    assert!(registry.query_handler("echo").is_some());
    assert!(registry.type_handler("echo").is_none());

    assert!(registry.unregister_query("echo").is_some());
    assert!(registry.unregister_query("echo").is_none());
    assert!(registry.query_handler("echo").is_none());
}

#[test]
fn test_builtin_handlers_registered() {
    let dht = Dht::default();
    let registry = dht.registry();

    assert!(registry.query_handler("ping").is_some());
    assert!(registry.query_handler("find_node").is_some());
    assert!(registry.query_handler("get_peers").is_none());
}

#[test]
fn test_type_handler_sees_custom_message() {
    let mut dht = Dht::default();
    let body = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&body);

    dht.register_type("z", move |_, msg| {
        if let MessageKind::Other { body, .. } = &msg.kind {
            *seen.lock() = body.get(&b"v"[..]).and_then(Value::as_str).map(str::to_owned);
        }
        Ok(())
    });

    feed(&mut dht, v4(1, 5309), v4(2, 6881), b"d1:t2:aa1:v3:abc1:y1:ze").unwrap();

    assert_eq!(body.lock().as_deref(), Some("abc"));
    assert_eq!(dht.queued(), 0);
}

#[test]
fn test_process_rejects_garbage_without_side_effects() {
    let mut dht = Dht::default();

    assert!(feed(&mut dht, v4(1, 5309), v4(2, 6881), b"d1:t2:42").is_err());
    assert!(feed(&mut dht, v4(1, 5309), v4(2, 6881), b"i42e").is_err());
    assert_eq!(dht.queued(), 0);
    assert!(dht.transactions().is_empty());
}

#[test]
fn test_bind_family_disabled() {
    let mut dht = Dht::new(DhtConfig::default().with_ipv6(false));
    let addr: SocketAddr = "[::1]:0".parse().unwrap();

    assert!(matches!(
        dht.bind(None, addr),
        Err(DhtError::FamilyDisabled(a)) if a == addr
    ));
    assert_eq!(dht.state(), DhtState::Unbound);
}

#[test]
fn test_send_query_without_endpoint() {
    let mut dht = Dht::default();
    let remote = v4(2, 6881);

    assert!(matches!(
        dht.send_ping(remote),
        Err(DhtError::NoEndpoint(a)) if a == remote
    ));
    assert!(dht.transactions().is_empty());
}

#[tokio::test]
async fn test_pulse_before_bind() {
    let mut dht = Dht::default();
    assert!(matches!(
        dht.pulse(Duration::from_millis(10)).await,
        Err(DhtError::NotBound)
    ));
}

#[tokio::test]
async fn test_bind_and_rebind() {
    let mut dht = Dht::default();
    let id = NodeId::generate();

    let local = dht.bind(Some(id), loopback()).unwrap().local_addr();
    assert_ne!(local.port(), 0);
    assert_eq!(dht.state(), DhtState::Bound);
    assert_eq!(dht.endpoint(&local).unwrap().id(), &id);
    assert_eq!(dht.routing_table(Family::V4).unwrap().our_id(), &id);

    assert!(matches!(
        dht.bind(None, local),
        Err(DhtError::AddressInUse(a)) if a == local
    ));
    assert_eq!(dht.endpoints().count(), 1);

    dht.unbind(local).unwrap();
    assert_eq!(dht.state(), DhtState::Unbound);
    assert!(matches!(dht.unbind(local), Err(DhtError::NoEndpoint(_))));
}

#[tokio::test]
async fn test_process_dispatches_to_query_handler() {
    let mut dht = Dht::default();
    let local = dht.bind(None, loopback()).unwrap().local_addr();
    let remote = v4(2, 6881);
    let seen = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);

    dht.register_query("ping", move |_, msg| {
        *record.lock() = Some((
            msg.method().map(str::to_owned),
            msg.transaction_id.as_bytes().to_vec(),
        ));
        Ok(())
    });

    feed(&mut dht, local, remote, PING).unwrap();

    let (method, tid) = seen.lock().take().unwrap();
    assert_eq!(method.as_deref(), Some("ping"));
    assert_eq!(tid, b"42");
    assert_eq!(dht.queued(), 0);
}

#[tokio::test]
async fn test_builtin_ping_replies_and_learns_sender() {
    let mut dht = Dht::default();
    let local = dht.bind(None, loopback()).unwrap().local_addr();
    let remote = v4(2, 6881);

    feed(&mut dht, local, remote, PING).unwrap();

    assert_eq!(dht.queued(), 1);
    let table = dht.routing_table(Family::V4).unwrap();
    assert!(table.get(&NodeId(*b"12345678901234567890")).is_some());
}

#[tokio::test]
async fn test_unknown_method_gets_204() {
    init_tracing();
    let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let remote = peer.local_addr().unwrap();

    let mut dht = Dht::default();
    let local = dht.bind(None, loopback()).unwrap().local_addr();

    feed(
        &mut dht,
        local,
        remote,
        b"d1:ad2:id20:12345678901234567890e1:q3:foo1:t2:xx1:y1:qe",
    )
    .unwrap();
    assert_eq!(dht.queued(), 1);

    dht.pulse(Duration::from_millis(50)).await.unwrap();
    assert_eq!(dht.queued(), 0);

    let mut buf = [0u8; 512];
    let (len, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(from, local);

    let reply = Message::parse(remote, from, &buf[..len]).unwrap();
    assert_eq!(reply.transaction_id.as_bytes(), b"xx");
    assert_eq!(
        reply.kind,
        MessageKind::Error {
            code: ErrorCode::MethodUnknown.code(),
            description: "Method Unknown".into()
        }
    );
}

#[tokio::test]
async fn test_find_node_without_target_gets_203() {
    let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let remote = peer.local_addr().unwrap();

    let mut dht = Dht::default();
    let local = dht.bind(None, loopback()).unwrap().local_addr();

    feed(
        &mut dht,
        local,
        remote,
        b"d1:ad2:id20:12345678901234567890e1:q9:find_node1:t2:ff1:y1:qe",
    )
    .unwrap();
    dht.pulse(Duration::from_millis(50)).await.unwrap();

    let mut buf = [0u8; 512];
    let (len, from) = peer.recv_from(&mut buf).unwrap();
    let reply = Message::parse(remote, from, &buf[..len]).unwrap();
    assert!(matches!(
        reply.kind,
        MessageKind::Error { code: 203, .. }
    ));
}

#[tokio::test]
async fn test_shutdown_discards_transactions() {
    let mut dht = Dht::default();
    dht.bind(None, loopback()).unwrap();
    let (calls, seen) = counter();

    dht.send_query(v4(2, 6881), "ping", Dict::new(), move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(dht.queued(), 1);

    assert_eq!(dht.shutdown(), 1);
    assert_eq!(dht.state(), DhtState::Stopped);
    assert_eq!(dht.queued(), 0);
    assert_eq!(dht.endpoints().count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(dht.shutdown(), 0);

    assert!(matches!(
        dht.pulse(Duration::from_millis(10)).await,
        Err(DhtError::Stopped)
    ));
    assert!(matches!(dht.bind(None, loopback()), Err(DhtError::Stopped)));
}

#[tokio::test]
async fn test_ping_between_nodes() {
    init_tracing();
    let mut a = Dht::default();
    let mut b = Dht::default();
    a.bind(None, loopback()).unwrap();
    let b_id = NodeId::generate();
    let b_addr = b.bind(Some(b_id), loopback()).unwrap().local_addr();

    let answered = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&answered);
    a.send_query(b_addr, "ping", Dict::new(), move |dht, outcome| {
        if let Outcome::Response(reply) = outcome {
            dht.learn_sender(reply);
            *seen.lock() = reply.sender_id();
        }
    })
    .unwrap();

    for _ in 0..100 {
        a.pulse(Duration::from_millis(10)).await.unwrap();
        b.pulse(Duration::from_millis(10)).await.unwrap();
        if answered.lock().is_some() {
            break;
        }
    }

    assert_eq!(*answered.lock(), Some(b_id));
    assert!(a.transactions().is_empty());
    assert!(a.routing_table(Family::V4).unwrap().get(&b_id).is_some());
    assert_eq!(b.routing_table(Family::V4).unwrap().len(), 1);
}

#[tokio::test]
async fn test_find_node_between_nodes() {
    init_tracing();
    let mut a = Dht::default();
    let mut b = Dht::default();
    a.bind(None, loopback()).unwrap();
    let b_addr = b.bind(None, loopback()).unwrap().local_addr();

    let known = NodeId::generate();
    b.routing_table_mut(Family::V4)
        .unwrap()
        .insert(Node::new(known, v4(7, 7777)));

    a.send_find_node(b_addr, NodeId::generate()).unwrap();

    for _ in 0..100 {
        a.pulse(Duration::from_millis(10)).await.unwrap();
        b.pulse(Duration::from_millis(10)).await.unwrap();
        if a.transactions().is_empty() {
            break;
        }
    }

    let table = a.routing_table(Family::V4).unwrap();
    let learned = table.get(&known).unwrap();
    assert_eq!(learned.addr, v4(7, 7777));
    assert_eq!(table.len(), 2);
}

#[tokio::test]
async fn test_send_queue_limit() {
    let mut dht = Dht::new(DhtConfig::default().with_send_queue_limit(2));
    let local = dht.bind(None, loopback()).unwrap().local_addr();
    let remote = v4(2, 6881);
    let unknown = b"d1:ad2:id20:12345678901234567890e1:q3:foo1:t2:xx1:y1:qe";

    for _ in 0..5 {
        feed(&mut dht, local, remote, unknown).unwrap();
    }
    assert_eq!(dht.queued(), 2);

    assert!(matches!(
        dht.send_ping(remote),
        Err(DhtError::QueueFull(a)) if a == remote
    ));
    assert!(dht.transactions().is_empty());

    let query = Message::parse(local, remote, PING).unwrap();
    assert!(matches!(
        dht.send_response(&query, Dict::new()),
        Err(DhtError::QueueFull(_))
    ));
    assert_eq!(dht.queued(), 2);
}

#[tokio::test]
async fn test_pulse_sends_one_datagram() {
    let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let remote = peer.local_addr().unwrap();

    let mut dht = Dht::default();
    let local = dht.bind(None, loopback()).unwrap().local_addr();

    let first = b"d1:ad2:id20:12345678901234567890e1:q3:foo1:t2:aa1:y1:qe";
    let second = b"d1:ad2:id20:12345678901234567890e1:q3:bar1:t2:bb1:y1:qe";
    feed(&mut dht, local, remote, first).unwrap();
    feed(&mut dht, local, remote, second).unwrap();
    assert_eq!(dht.queued(), 2);

    dht.pulse(Duration::from_millis(20)).await.unwrap();
    assert_eq!(dht.queued(), 1);

    let mut buf = [0u8; 512];
    let (len, _) = peer.recv_from(&mut buf).unwrap();
    let sent = Message::parse(remote, local, &buf[..len]).unwrap();
    assert_eq!(sent.transaction_id.as_bytes(), b"aa");

    dht.pulse(Duration::from_millis(20)).await.unwrap();
    assert_eq!(dht.queued(), 0);
}

#[tokio::test]
async fn test_pulse_expires_overdue_transactions() {
    let mut dht = Dht::new(DhtConfig::default().with_transaction_expiration(Duration::ZERO));
    dht.bind(None, loopback()).unwrap();
    let (timeouts, seen) = counter();

    let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
    dht.send_query(remote, "ping", Dict::new(), move |_, outcome| {
        if let Outcome::Timeout = outcome {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    })
    .unwrap();

    dht.pulse(Duration::from_millis(10)).await.unwrap();

    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert!(dht.transactions().is_empty());
}

#[tokio::test]
async fn test_pulse_matches_reply_before_expiring() {
    let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let mut dht =
        Dht::new(DhtConfig::default().with_transaction_expiration(Duration::from_millis(200)));
    let local = dht.bind(None, loopback()).unwrap().local_addr();

    let outcome = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&outcome);
    dht.send_query(peer_addr, "ping", Dict::new(), move |_, outcome| {
        *seen.lock() = Some(match outcome {
            Outcome::Response(_) => "response",
            Outcome::Error(_) => "error",
            Outcome::Timeout => "timeout",
        });
    })
    .unwrap();
    dht.pulse(Duration::from_millis(20)).await.unwrap();

    let mut buf = [0u8; 512];
    let (len, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(from, local);
    let query = Message::parse(peer_addr, from, &buf[..len]).unwrap();

    let mut args = Dict::new();
    args.insert(Bytes::from_static(b"id"), Value::bytes(&[6u8; 20]));
    let reply = Message::encode_response(&query.transaction_id, args).unwrap();
    peer.send_to(&reply, local).unwrap();

    // the reply is waiting once the deadline has passed
    tokio::time::sleep(Duration::from_millis(300)).await;
    dht.pulse(Duration::from_millis(20)).await.unwrap();

    assert_eq!(*outcome.lock(), Some("response"));
    assert!(dht.transactions().is_empty());
}
