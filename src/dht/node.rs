use super::error::DhtError;
use rand::Rng as _;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

pub const NODE_ID_LEN: usize = 20;

/// Compact node info: 20-byte id, 4-byte IPv4 address, 2-byte port.
pub const COMPACT_NODE_V4_LEN: usize = NODE_ID_LEN + 6;
/// Compact node info: 20-byte id, 16-byte IPv6 address, 2-byte port.
pub const COMPACT_NODE_V6_LEN: usize = NODE_ID_LEN + 18;

const MAX_FAILURES: u8 = 3;
const GOOD_NODE_WINDOW_SECS: u64 = 15 * 60;

/// 160-bit identifier for a DHT node or lookup target.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; NODE_ID_LEN]);

    /// Random identifier. The all-zero id is reserved and never returned.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        loop {
            let mut id = [0u8; NODE_ID_LEN];
            rng.fill(&mut id);
            if id != Self::ZERO.0 {
                return Self(id);
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut dist = self.0;
        for (d, o) in dist.iter_mut().zip(other.0.iter()) {
            *d ^= o;
        }
        dist
    }

    /// Index of the first differing bit, i.e. the k-bucket `other` falls in.
    pub fn bucket_index(&self, other: &NodeId) -> usize {
        let dist = self.distance(other);
        match dist.iter().position(|&b| b != 0) {
            Some(i) => i * 8 + dist[i].leading_zeros() as usize,
            None => NODE_ID_LEN * 8 - 1,
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A remote node as known to the routing table.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Last time the node itself talked to us; `None` for nodes only heard
    /// of through another node's reply.
    pub last_seen: Option<Instant>,
    pub failures: u8,
}

impl Node {
    /// A node we just heard from directly.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Some(Instant::now()),
            failures: 0,
        }
    }

    /// A node reported by someone else, not yet contacted.
    pub fn unverified(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: None,
            failures: 0,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Some(Instant::now());
        self.failures = 0;
    }

    pub fn is_verified(&self) -> bool {
        self.last_seen.is_some()
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn is_good(&self) -> bool {
        self.failures == 0
            && self
                .last_seen
                .is_some_and(|seen| seen.elapsed().as_secs() < GOOD_NODE_WINDOW_SECS)
    }

    pub fn is_bad(&self) -> bool {
        self.failures >= MAX_FAILURES
    }

    /// Parses one compact node entry; the length selects the address family.
    ///
    /// The result is unverified: compact entries come from third parties.
    pub fn from_compact(data: &[u8]) -> Option<Self> {
        let (id, addr) = data.split_at_checked(NODE_ID_LEN)?;
        let id = NodeId::from_bytes(id).ok()?;

        let ip = match addr.len() {
            6 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(&addr[..4]).ok()?)),
            18 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&addr[..16]).ok()?)),
            _ => return None,
        };
        let port = u16::from_be_bytes([addr[addr.len() - 2], addr[addr.len() - 1]]);

        Some(Self::unverified(id, SocketAddr::new(ip, port)))
    }

    /// Appends this node's compact form to `out`.
    pub fn write_compact(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.0);
        match self.addr.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&self.addr.port().to_be_bytes());
    }
}

/// Splits a compact `nodes`/`nodes6` string into nodes, skipping a ragged tail.
pub fn parse_compact_nodes(data: &[u8], entry_len: usize) -> Vec<Node> {
    data.chunks_exact(entry_len)
        .filter_map(Node::from_compact)
        .collect()
}
