//! Consistent hashing of metric keys onto global aggregator nodes.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hasher as _;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use hash32::{FnvHasher, Hasher as _};
use serde::{Deserialize, Serialize};
use tally_statsd::metric;

use crate::protocol::MetricKey;
use crate::statsd::{MetricCounters, MetricGauges};

/// The default number of positions each node occupies on the ring.
pub const DEFAULT_VIRTUAL_NODES: usize = 128;

/// The identity of a global aggregator, which is the `host:port` of its HTTP API.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An error building a [`HashRing`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RingError {
    /// The peer list is empty.
    #[error("the ring has no nodes")]
    Empty,
    /// A peer has an empty identifier.
    #[error("a node has an empty identifier")]
    EmptyNodeId,
    /// A peer appears more than once.
    #[error("node {0} is listed more than once")]
    DuplicateNode(NodeId),
    /// Nodes must occupy at least one position.
    #[error("the number of virtual nodes must be positive")]
    ZeroVirtualNodes,
}

/// Finalizes a 32 bit hash so that similar inputs spread over the whole ring.
fn fmix32(mut hash: u32) -> u32 {
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}

/// Returns the position of a metric key on the ring.
///
/// The position only depends on the bytes of the key, so it is the same on every host.
pub fn key_position(key: &MetricKey) -> u32 {
    let mut hasher = FnvHasher::default();
    key.write_bytes(|bytes| hasher.write(bytes));
    fmix32(hasher.finish32())
}

fn node_position(node: &NodeId, replica: usize) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(node.as_str().as_bytes());
    hasher.write(b"#");
    hasher.write(replica.to_string().as_bytes());
    fmix32(hasher.finish32())
}

/// An immutable ring of nodes on a 32 bit hash space.
///
/// Every node occupies a number of virtual positions. A key is owned by the first node at or
/// after its position, wrapping around at the end of the ring. Adding a node only moves keys to
/// that node, and removing a node only moves the keys it owned.
#[derive(Clone, Debug)]
pub struct HashRing {
    nodes: Vec<NodeId>,
    points: Vec<(u32, usize)>,
}

impl HashRing {
    /// Builds a ring from a list of distinct nodes.
    pub fn new(nodes: &[NodeId], virtual_nodes: usize) -> Result<Self, RingError> {
        if nodes.is_empty() {
            return Err(RingError::Empty);
        }
        if virtual_nodes == 0 {
            return Err(RingError::ZeroVirtualNodes);
        }

        let mut seen = BTreeSet::new();
        for node in nodes {
            if node.as_str().is_empty() {
                return Err(RingError::EmptyNodeId);
            }
            if !seen.insert(node) {
                return Err(RingError::DuplicateNode(node.clone()));
            }
        }

        let mut points = Vec::with_capacity(nodes.len() * virtual_nodes);
        for (index, node) in nodes.iter().enumerate() {
            for replica in 0..virtual_nodes {
                points.push((node_position(node, replica), index));
            }
        }

        // Colliding positions are ordered by node identity, independent of the list order.
        points.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| nodes[a.1].cmp(&nodes[b.1])));

        Ok(Self {
            nodes: nodes.to_vec(),
            points,
        })
    }

    /// Returns the nodes of this ring in their configured order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Returns the node owning `key`.
    pub fn owner(&self, key: &MetricKey) -> &NodeId {
        self.owner_at(key_position(key))
    }

    /// Returns the node owning the given ring position.
    pub fn owner_at(&self, position: u32) -> &NodeId {
        let index = self.points.partition_point(|&(point, _)| point < position);
        let (_, node) = self.points.get(index).unwrap_or(&self.points[0]);
        &self.nodes[*node]
    }
}

/// The owner of a metric key in a global deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Owner {
    /// This agent aggregates the key.
    Local,
    /// Another node aggregates the key.
    Remote(NodeId),
}

/// Resolves the global owner of metric keys against a replaceable ring.
///
/// The ring is swapped atomically when the peer list changes, so concurrent lookups see either
/// the old or the new ring. If the peers cannot form a ring, this agent considers itself the
/// owner of every key until a valid peer list arrives.
#[derive(Debug)]
pub struct GlobalRouter {
    local: NodeId,
    virtual_nodes: usize,
    ring: ArcSwapOption<HashRing>,
}

impl GlobalRouter {
    /// Creates a router for the local node and builds the initial ring.
    pub fn new(local: NodeId, peers: &[NodeId], virtual_nodes: usize) -> Self {
        let router = Self {
            local,
            virtual_nodes,
            ring: ArcSwapOption::empty(),
        };

        // Failures are logged and leave the router in local-owner mode.
        let _ = router.update_peers(peers);
        router
    }

    /// Returns the identity of this agent.
    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Returns the current ring, or `None` in local-owner mode.
    pub fn ring(&self) -> Option<Arc<HashRing>> {
        self.ring.load_full()
    }

    /// Replaces the ring with one built from `peers`.
    ///
    /// On error, the router switches to local-owner mode and the error is returned.
    pub fn update_peers(&self, peers: &[NodeId]) -> Result<(), RingError> {
        match HashRing::new(peers, self.virtual_nodes) {
            Ok(ring) => {
                if !peers.contains(&self.local) {
                    tally_log::warn!(node = %self.local, "local node is not part of the global ring");
                }

                metric!(gauge(MetricGauges::RingNodes) = peers.len() as u64);
                tally_log::info!("global ring updated with {} nodes", peers.len());
                self.ring.store(Some(Arc::new(ring)));
                Ok(())
            }
            Err(error) => {
                tally_log::error!(
                    error = &error as &dyn std::error::Error,
                    "invalid global peers, aggregating all metrics locally"
                );
                metric!(counter(MetricCounters::RingFallback) += 1);
                self.ring.store(None);
                Err(error)
            }
        }
    }

    /// Returns the owner of `key`.
    pub fn owner(&self, key: &MetricKey) -> Owner {
        let guard = self.ring.load();
        match guard.as_deref() {
            Some(ring) => {
                let node = ring.owner(key);
                if *node == self.local {
                    Owner::Local
                } else {
                    Owner::Remote(node.clone())
                }
            }
            None => Owner::Local,
        }
    }

    /// Returns `true` if this agent owns `key`.
    pub fn owns(&self, key: &MetricKey) -> bool {
        self.owner(key) == Owner::Local
    }
}
