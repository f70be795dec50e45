//! # Primary Routing Table
//!
//! In-memory index of the peers this node routes through, partitioned into
//! buckets by common-prefix length with the local identifier and capped at
//! `max_routing_table_size` entries. The *close set* is the
//! `closest_set_size` peers of minimum XOR distance to the local id and is
//! always kept exact, even when that crosses bucket boundaries.
//!
//! The table is plain data owned by the engine actor: every operation returns
//! its side effects (evictions, close-set changes) as values, and the actor
//! turns those into transport removals and embedder callbacks. No callback is
//! ever invoked from inside the table.
//!
//! ## Admission policy
//!
//! A candidate is admitted when
//! 1. its bucket is below `bucket_k` and the table is below capacity, or
//! 2. it would enter the close set (bucket capacity is waived; the table's
//!    furthest peer is evicted if the table is full), or
//! 3. it is strictly closer than the furthest member of its full bucket,
//!    which is then evicted.

use tracing::debug;

use crate::id::{distance_cmp, NodeId};
use crate::node_info::{ConnectionId, NodeInfo};

/// Why a candidate was not admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddError {
    /// The candidate carries the zero sentinel as its id.
    ZeroId,
    /// The candidate is this node.
    SelfId,
    /// A peer with this id is already stored.
    Duplicate,
    /// Bucket and table policy both reject the candidate. Not fatal.
    Full,
}

/// Side effects of a successful admission.
#[derive(Clone, Debug, Default)]
pub struct AddOutcome {
    /// The close set is different from before the add.
    pub close_set_changed: bool,
    /// Peer displaced to make room; its session must be closed.
    pub evicted: Option<NodeInfo>,
}

/// Side effects of a removal.
#[derive(Clone, Debug)]
pub struct DropOutcome {
    pub node: NodeInfo,
    /// The removed peer was in the close set.
    pub close_set_changed: bool,
}

pub struct RoutingTable {
    self_id: NodeId,
    bucket_k: usize,
    closest_set_size: usize,
    max_size: usize,
    /// All known peers, sorted by XOR distance from `self_id` ascending.
    /// The close set is the first `closest_set_size` entries.
    nodes: Vec<NodeInfo>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, bucket_k: usize, closest_set_size: usize, max_size: usize) -> Self {
        debug_assert!(closest_set_size <= bucket_k);
        Self {
            self_id,
            bucket_k,
            closest_set_size,
            max_size,
            nodes: Vec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.id == *id)
    }

    /// The current close set: the `closest_set_size` nearest peers.
    pub fn close_set(&self) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .take(self.closest_set_size)
            .cloned()
            .collect()
    }

    /// Admit a peer under the bucket policy.
    pub fn add_node(&mut self, peer: NodeInfo) -> Result<AddOutcome, AddError> {
        if peer.id.is_zero() {
            return Err(AddError::ZeroId);
        }
        if peer.id == self.self_id {
            return Err(AddError::SelfId);
        }
        if self.contains(&peer.id) {
            return Err(AddError::Duplicate);
        }

        let close_before = self.close_ids();
        let enters_close_set = self.would_enter_close_set(&peer.id);

        let evicted = if enters_close_set {
            // Close-set candidates bypass bucket capacity; displace the
            // table-furthest peer when at the size cap.
            if self.nodes.len() >= self.max_size {
                self.nodes.pop()
            } else {
                None
            }
        } else if self.bucket_len(&peer.id) >= self.bucket_k {
            // Full bucket: only a strictly closer peer displaces the
            // bucket's furthest member.
            let furthest = self
                .furthest_in_bucket(&peer.id)
                .expect("bucket length >= bucket_k implies a furthest member");
            if self.closer_to_self(&peer.id, &self.nodes[furthest].id) {
                Some(self.nodes.remove(furthest))
            } else {
                return Err(AddError::Full);
            }
        } else if self.nodes.len() >= self.max_size {
            // Bucket has room but the table is at capacity; displace the
            // overall furthest peer if the candidate beats it.
            let last = self.nodes.last().expect("table at capacity is non-empty");
            if self.closer_to_self(&peer.id, &last.id) {
                self.nodes.pop()
            } else {
                return Err(AddError::Full);
            }
        } else {
            None
        };

        self.insert_sorted(peer);
        let close_set_changed = close_before != self.close_ids();

        if let Some(out) = &evicted {
            debug!(
                evicted = %short(&out.id),
                size = self.nodes.len(),
                "routing table evicted peer on admission"
            );
        }

        Ok(AddOutcome {
            close_set_changed,
            evicted,
        })
    }

    /// Remove a peer by node id.
    pub fn drop_node_by_id(&mut self, id: &NodeId) -> Option<DropOutcome> {
        let pos = self.nodes.iter().position(|n| n.id == *id)?;
        Some(self.remove_at(pos))
    }

    /// Remove a peer by transport session id.
    pub fn drop_node_by_connection(&mut self, connection_id: &ConnectionId) -> Option<DropOutcome> {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.connection_id == *connection_id)?;
        Some(self.remove_at(pos))
    }

    /// Up to `n` peers sorted by distance from `target`, ties broken by id.
    pub fn closest_nodes(&self, target: &NodeId, n: usize) -> Vec<NodeInfo> {
        if n == 0 {
            return Vec::new();
        }
        let mut sorted: Vec<&NodeInfo> = self.nodes.iter().collect();
        sorted.sort_by(|a, b| {
            let da = a.id.xor_distance(target);
            let db = b.id.xor_distance(target);
            distance_cmp(&da, &db).then_with(|| a.id.cmp(&b.id))
        });
        sorted.into_iter().take(n).cloned().collect()
    }

    /// True iff fewer than `range` known peers are closer to `target` than
    /// this node is.
    pub fn is_this_node_in_range(&self, target: &NodeId, range: usize) -> bool {
        let own = self.self_id.xor_distance(target);
        let closer = self
            .nodes
            .iter()
            .filter(|n| {
                let d = n.id.xor_distance(target);
                distance_cmp(&d, &own) == std::cmp::Ordering::Less
            })
            .count();
        closer < range
    }

    /// Verify a claim that `a` and `b` belong to this node's close group.
    ///
    /// The local id passes trivially; all other ids must be in the close set.
    pub fn confirm_group_members(&self, a: &NodeId, b: &NodeId) -> bool {
        let close: Vec<NodeId> = self.close_ids();
        let member = |id: &NodeId| *id == self.self_id || close.contains(id);
        member(a) && member(b)
    }

    pub fn get_node_info(&self, connection_id: &ConnectionId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.connection_id == *connection_id)
    }

    pub fn node_by_id(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Remove everything, returning the former contents. Used when the
    /// engine re-bootstraps from scratch.
    pub fn drain_all(&mut self) -> Vec<NodeInfo> {
        std::mem::take(&mut self.nodes)
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn close_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .take(self.closest_set_size)
            .map(|n| n.id)
            .collect()
    }

    fn closer_to_self(&self, a: &NodeId, b: &NodeId) -> bool {
        let da = a.xor_distance(&self.self_id);
        let db = b.xor_distance(&self.self_id);
        distance_cmp(&da, &db) == std::cmp::Ordering::Less
    }

    fn would_enter_close_set(&self, id: &NodeId) -> bool {
        if self.nodes.len() < self.closest_set_size {
            return true;
        }
        let edge = &self.nodes[self.closest_set_size - 1];
        self.closer_to_self(id, &edge.id)
    }

    fn bucket_len(&self, id: &NodeId) -> usize {
        let bucket = self.self_id.common_prefix_len(id);
        self.nodes
            .iter()
            .filter(|n| self.self_id.common_prefix_len(&n.id) == bucket)
            .count()
    }

    /// Index of the furthest-from-self peer in `id`'s bucket.
    fn furthest_in_bucket(&self, id: &NodeId) -> Option<usize> {
        let bucket = self.self_id.common_prefix_len(id);
        // `nodes` is sorted by distance from self, so the last matching
        // index is the furthest bucket member.
        self.nodes
            .iter()
            .rposition(|n| self.self_id.common_prefix_len(&n.id) == bucket)
    }

    fn insert_sorted(&mut self, peer: NodeInfo) {
        let dist = peer.id.xor_distance(&self.self_id);
        let pos = self
            .nodes
            .partition_point(|n| {
                let d = n.id.xor_distance(&self.self_id);
                distance_cmp(&d, &dist) == std::cmp::Ordering::Less
            });
        self.nodes.insert(pos, peer);
    }

    fn remove_at(&mut self, pos: usize) -> DropOutcome {
        let node = self.nodes.remove(pos);
        DropOutcome {
            close_set_changed: pos < self.closest_set_size,
            node,
        }
    }
}

fn short(id: &NodeId) -> String {
    hex::encode(&id.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Keypair, ID_LEN};

    fn table(self_id: NodeId) -> RoutingTable {
        RoutingTable::new(self_id, 8, 8, 64)
    }

    /// The id one bit away from zero, so distances from it and raw id bytes
    /// order almost identically.
    fn near_zero() -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 1] = 1;
        NodeId::from_bytes(bytes)
    }

    fn id_with_prefix(first: u8, tag: u8) -> NodeId {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = first;
        bytes[ID_LEN - 1] = tag;
        NodeId::from_bytes(bytes)
    }

    fn info(id: NodeId) -> NodeInfo {
        // The table never inspects keys; one shared key keeps tests fast.
        use std::sync::OnceLock;
        static KEY: OnceLock<ed25519_dalek::VerifyingKey> = OnceLock::new();
        let key = *KEY.get_or_init(|| Keypair::generate().public_key());
        NodeInfo::new(id, id, key)
    }

    fn brute_force_closest(
        nodes: &[NodeInfo],
        target: &NodeId,
        n: usize,
    ) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = nodes.iter().map(|i| i.id).collect();
        ids.sort_by(|a, b| {
            let da = a.xor_distance(target);
            let db = b.xor_distance(target);
            distance_cmp(&da, &db).then_with(|| a.cmp(b))
        });
        ids.truncate(n);
        ids
    }

    #[test]
    fn rejects_self_zero_and_duplicates() {
        let self_id = id_with_prefix(0x00, 1);
        let mut table = table(self_id);

        assert_eq!(table.add_node(info(NodeId::ZERO)).unwrap_err(), AddError::ZeroId);
        assert_eq!(table.add_node(info(self_id)).unwrap_err(), AddError::SelfId);

        let peer = info(id_with_prefix(0x80, 1));
        assert!(table.add_node(peer.clone()).is_ok());
        assert_eq!(table.add_node(peer).unwrap_err(), AddError::Duplicate);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn full_bucket_admits_only_closer_peers() {
        let self_id = near_zero();
        let mut table = RoutingTable::new(self_id, 4, 2, 64);

        // Fill bucket 0 (top bit differs) with distances 0x90..0x93.
        for tag in 0..4u8 {
            let peer = info(id_with_prefix(0x90 + tag, tag));
            assert!(table.add_node(peer).is_ok());
        }

        // Same bucket, further than every member: rejected.
        let far = info(id_with_prefix(0xf0, 9));
        assert_eq!(table.add_node(far).unwrap_err(), AddError::Full);
        assert_eq!(table.len(), 4);

        // Same bucket, outside the close set but closer than the furthest
        // member: admitted, furthest member reported as evicted.
        let near = info(id_with_prefix(0x92, 9));
        let outcome = table.add_node(near).unwrap();
        let evicted = outcome.evicted.expect("furthest bucket member evicted");
        assert_eq!(evicted.id, id_with_prefix(0x93, 3));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn close_set_crosses_bucket_capacity() {
        // bucket_k 2, close set 2: a candidate belonging to a full bucket is
        // still admitted when it would enter the close set.
        let self_id = near_zero();
        let mut table = RoutingTable::new(self_id, 2, 2, 64);

        table.add_node(info(id_with_prefix(0x90, 1))).unwrap();
        table.add_node(info(id_with_prefix(0xa0, 2))).unwrap();
        assert_eq!(table.bucket_len(&id_with_prefix(0x80, 0)), 2);

        let close_candidate = info(id_with_prefix(0x81, 3));
        let outcome = table.add_node(close_candidate).unwrap();
        assert!(outcome.close_set_changed);
        assert_eq!(table.len(), 3, "bucket cap waived for close-set entrant");
    }

    #[test]
    fn table_at_capacity_evicts_furthest() {
        let self_id = near_zero();
        let mut table = RoutingTable::new(self_id, 64, 4, 8);

        for tag in 0..8u8 {
            table.add_node(info(id_with_prefix(0x40 + tag, tag))).unwrap();
        }
        assert_eq!(table.len(), 8);

        // Further than everything stored: rejected at capacity.
        assert_eq!(
            table.add_node(info(id_with_prefix(0xff, 0))).unwrap_err(),
            AddError::Full
        );

        let outcome = table.add_node(info(id_with_prefix(0x20, 0))).unwrap();
        assert_eq!(outcome.evicted.unwrap().id, id_with_prefix(0x47, 7));
        assert_eq!(table.len(), 8);
    }

    #[test]
    fn add_then_drop_restores_prior_state() {
        let self_id = near_zero();
        let mut table = table(self_id);
        for tag in 0..6u8 {
            table.add_node(info(id_with_prefix(0x40 + tag, tag))).unwrap();
        }
        let size_before = table.len();
        let close_before: Vec<NodeId> = table.close_set().iter().map(|n| n.id).collect();

        let extra = id_with_prefix(0x20, 9);
        table.add_node(info(extra)).unwrap();
        let dropped = table.drop_node_by_id(&extra).unwrap();
        assert_eq!(dropped.node.id, extra);

        assert_eq!(table.len(), size_before);
        let close_after: Vec<NodeId> = table.close_set().iter().map(|n| n.id).collect();
        assert_eq!(close_before, close_after);
    }

    #[test]
    fn closest_nodes_matches_brute_force() {
        let self_id = near_zero();
        let mut table = RoutingTable::new(self_id, 8, 8, 64);
        let mut stored: Vec<NodeInfo> = Vec::new();
        for i in 0..40u8 {
            let peer = info(id_with_prefix(i.wrapping_mul(37), i));
            if let Ok(outcome) = table.add_node(peer.clone()) {
                if let Some(evicted) = outcome.evicted {
                    stored.retain(|p| p.id != evicted.id);
                }
                stored.push(peer);
            }
        }
        assert_eq!(stored.len(), table.len());

        let target = id_with_prefix(0x55, 0);
        for n in [1usize, 4, 8, 16] {
            let got: Vec<NodeId> = table
                .closest_nodes(&target, n)
                .iter()
                .map(|i| i.id)
                .collect();
            assert_eq!(got, brute_force_closest(&stored, &target, n));
        }
    }

    #[test]
    fn closest_nodes_prefix_law() {
        let self_id = near_zero();
        let mut table = table(self_id);
        for i in 1..20u8 {
            table.add_node(info(id_with_prefix(i, i))).ok();
        }
        let target = self_id;
        let small = table.closest_nodes(&target, 5);
        let large = table.closest_nodes(&target, 12);
        assert_eq!(&large[..small.len()], &small[..]);
    }

    #[test]
    fn in_range_counts_closer_peers() {
        let self_id = near_zero();
        let mut table = table(self_id);
        // Everything stored is closer to target 0x80.. than self is.
        for tag in 0..4u8 {
            table.add_node(info(id_with_prefix(0x80 + tag, tag))).unwrap();
        }
        let target = id_with_prefix(0x80, 0xff);
        assert!(!table.is_this_node_in_range(&target, 3));
        assert!(table.is_this_node_in_range(&target, 5));
        // The node is trivially in range of its own id.
        assert!(table.is_this_node_in_range(&self_id, 1));
    }

    #[test]
    fn confirm_group_members_is_symmetric() {
        let self_id = near_zero();
        let mut table = RoutingTable::new(self_id, 8, 2, 64);
        let a = id_with_prefix(0x02, 1);
        let b = id_with_prefix(0x03, 2);
        let outsider = id_with_prefix(0xf0, 3);
        for id in [a, b, outsider] {
            table.add_node(info(id)).unwrap();
        }

        assert!(table.confirm_group_members(&a, &b));
        assert!(table.confirm_group_members(&b, &a));
        assert_eq!(
            table.confirm_group_members(&a, &outsider),
            table.confirm_group_members(&outsider, &a)
        );
        assert!(!table.confirm_group_members(&a, &outsider));
        assert!(table.confirm_group_members(&self_id, &a));
    }

    #[test]
    fn drop_by_connection_and_lookup() {
        let self_id = near_zero();
        let mut table = table(self_id);
        let peer = info(id_with_prefix(0x42, 1));
        let connection = peer.connection_id;
        table.add_node(peer).unwrap();

        assert!(table.get_node_info(&connection).is_some());
        let dropped = table.drop_node_by_connection(&connection).unwrap();
        assert!(dropped.close_set_changed);
        assert!(table.get_node_info(&connection).is_none());
        assert!(table.is_empty());
    }
}

