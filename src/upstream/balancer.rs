//! Node selection policies
//!
//! Two policies: smooth weighted round-robin (state persists across
//! requests of the same node set) and a consistent-hash ring with 160
//! virtual points per unit of weight. Both accept an exclusion set so
//! the selector can remove unhealthy and already-tried nodes; the
//! fallback cascade lives in the selector, not here.

use crate::store::{BalanceKind, Upstream, UpstreamNode};
use std::collections::HashSet;
use std::sync::Mutex;

/// Virtual ring points per unit of node weight
const POINTS_PER_WEIGHT: u32 = 160;

struct Peer {
    node: UpstreamNode,
    effective_weight: i64,
    current_weight: i64,
}

/// Smooth weighted round-robin.
///
/// Every pick adds each eligible peer's weight to its running score,
/// selects the highest score, then subtracts the eligible total from the
/// winner. Equal weights degrade to plain alternation; unequal weights
/// interleave instead of bursting.
pub struct SmoothRoundRobin {
    peers: Mutex<Vec<Peer>>,
}

impl SmoothRoundRobin {
    pub fn new(nodes: &[UpstreamNode]) -> Self {
        let peers = nodes
            .iter()
            .map(|node| Peer {
                effective_weight: i64::from(node.weight.max(1)),
                current_weight: 0,
                node: node.clone(),
            })
            .collect();
        Self {
            peers: Mutex::new(peers),
        }
    }

    pub fn pick(&self, exclude: &HashSet<String>) -> Option<UpstreamNode> {
        let mut peers = self.peers.lock().unwrap();

        let mut total = 0i64;
        for peer in peers.iter_mut() {
            if exclude.contains(&peer.node.address()) {
                continue;
            }
            peer.current_weight += peer.effective_weight;
            total += peer.effective_weight;
        }

        let mut best: Option<usize> = None;
        for (i, peer) in peers.iter().enumerate() {
            if exclude.contains(&peer.node.address()) {
                continue;
            }
            match best {
                Some(b) if peers[b].current_weight >= peer.current_weight => {}
                _ => best = Some(i),
            }
        }

        let best = best?;
        peers[best].current_weight -= total;
        Some(peers[best].node.clone())
    }
}

/// Consistent-hash ring over the node set
pub struct ConsistentHash {
    /// (point, node index), sorted by point
    points: Vec<(u64, usize)>,
    nodes: Vec<UpstreamNode>,
}

impl ConsistentHash {
    pub fn new(nodes: &[UpstreamNode]) -> Self {
        let nodes: Vec<UpstreamNode> = nodes.to_vec();
        let mut points = Vec::new();
        for (i, node) in nodes.iter().enumerate() {
            let count = POINTS_PER_WEIGHT * node.weight.max(1);
            for v in 0..count {
                points.push((point_hash(&format!("{}#{}", node.address(), v)), i));
            }
        }
        points.sort_unstable();
        Self { points, nodes }
    }

    /// Walk the ring clockwise from the key's position to the first node
    /// not excluded.
    pub fn pick(&self, key: &str, exclude: &HashSet<String>) -> Option<UpstreamNode> {
        if self.points.is_empty() {
            return None;
        }

        let hash = point_hash(key);
        let start = self
            .points
            .partition_point(|(point, _)| *point < hash)
            % self.points.len();

        let mut seen = HashSet::new();
        for offset in 0..self.points.len() {
            let (_, idx) = self.points[(start + offset) % self.points.len()];
            if !seen.insert(idx) {
                continue;
            }
            let node = &self.nodes[idx];
            if !exclude.contains(&node.address()) {
                return Some(node.clone());
            }
            if seen.len() == self.nodes.len() {
                break;
            }
        }
        None
    }
}

/// Hash a key to a ring position
fn point_hash(key: &str) -> u64 {
    let digest = md5::compute(key.as_bytes());
    u64::from_be_bytes(digest.0[..8].try_into().unwrap())
}

/// A policy instance bound to one node set
pub enum Balancer {
    RoundRobin(SmoothRoundRobin),
    ConsistentHash(ConsistentHash),
}

impl Balancer {
    pub fn new(upstream: &Upstream) -> Self {
        match upstream.kind {
            BalanceKind::RoundRobin => Balancer::RoundRobin(SmoothRoundRobin::new(&upstream.nodes)),
            BalanceKind::Chash => Balancer::ConsistentHash(ConsistentHash::new(&upstream.nodes)),
        }
    }

    /// Pick a node; `hash_key` is only consulted by the consistent-hash
    /// policy.
    pub fn pick(&self, hash_key: Option<&str>, exclude: &HashSet<String>) -> Option<UpstreamNode> {
        match self {
            Balancer::RoundRobin(rr) => rr.pick(exclude),
            Balancer::ConsistentHash(ring) => ring.pick(hash_key.unwrap_or(""), exclude),
        }
    }
}
