use std::collections::VecDeque;
use std::net::SocketAddr;

use super::node::{Node, NodeId, NODE_ID_LEN};

/// Bucket capacity, also the default reply size for `find_node`.
pub const K: usize = 8;
const NUM_BUCKETS: usize = NODE_ID_LEN * 8;

#[derive(Debug, Default)]
struct Bucket {
    nodes: VecDeque<Node>,
    replacements: VecDeque<Node>,
}

impl Bucket {
    fn insert(&mut self, node: Node) -> bool {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == node.id) {
            // hearsay neither moves nor refreshes a known node
            if node.is_verified() {
                existing.addr = node.addr;
                existing.touch();
            }
            return true;
        }

        if self.nodes.len() < K {
            self.nodes.push_back(node);
            return true;
        }

        self.replacements.retain(|n| n.id != node.id);
        if self.replacements.len() == K {
            self.replacements.pop_front();
        }
        self.replacements.push_back(node);
        false
    }

    fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| &n.id == id)?;
        let removed = self.nodes.remove(pos);

        if let Some(replacement) = self.replacements.pop_back() {
            self.nodes.push_back(replacement);
        }

        removed
    }
}

/// Kademlia k-bucket table for one address family.
///
/// The engine core never touches it; query handlers insert senders and
/// answer `find_node` from it.
#[derive(Debug)]
pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        Self {
            our_id,
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::default()).collect(),
        }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    /// Adds or refreshes `node`. Returns false if its bucket was full and the
    /// node went to the replacement cache instead.
    pub fn insert(&mut self, node: Node) -> bool {
        if node.id == self.our_id {
            return false;
        }
        let idx = self.our_id.bucket_index(&node.id);
        self.buckets[idx].insert(node)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let idx = self.our_id.bucket_index(id);
        self.buckets[idx].remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        let idx = self.our_id.bucket_index(id);
        self.buckets[idx].nodes.iter().find(|n| &n.id == id)
    }

    /// Records a failed exchange with whatever node lives at `addr`, evicting
    /// it once it has failed too often.
    pub fn mark_failed(&mut self, addr: &SocketAddr) {
        for bucket in &mut self.buckets {
            if let Some(node) = bucket.nodes.iter_mut().find(|n| &n.addr == addr) {
                node.fail();
                if node.is_bad() {
                    let id = node.id;
                    bucket.remove(&id);
                }
                return;
            }
        }
    }

    /// Up to `k` good nodes ordered by XOR distance to `target`.
    ///
    /// Unverified nodes are left out until they answer us themselves.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Node> {
        let mut nodes: Vec<&Node> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.is_good())
            .collect();

        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.into_iter().take(k).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
