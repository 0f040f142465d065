//! Segment ownership maps and versioned cache topologies.
//!
//! A [`ConsistentHash`] maps every segment to an ordered owner list; the first
//! owner is the primary, the rest are backups. A [`CacheTopology`] pairs the
//! current map with an optional pending map while a rebalance is running and
//! is never mutated once built: every change produces a new topology with a
//! higher id.

use crate::types::{NodeId, SegmentId, SegmentSet, TopologyId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mapping from segments to ordered owner lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    /// Configured number of owners per segment.
    num_owners: usize,

    /// Members this hash was built for, in join order.
    members: Vec<NodeId>,

    /// Owner list per segment, indexed by segment id.
    owners: Vec<Vec<NodeId>>,
}

impl ConsistentHash {
    /// Create a hash from explicit owner lists.
    pub fn new(num_owners: usize, members: Vec<NodeId>, owners: Vec<Vec<NodeId>>) -> Self {
        Self {
            num_owners: num_owners.max(1),
            members,
            owners,
        }
    }

    /// Create a hash where every segment has no owner.
    pub fn empty(num_segments: u32, num_owners: usize) -> Self {
        Self::new(num_owners, Vec::new(), vec![Vec::new(); num_segments as usize])
    }

    /// Spread segments round-robin over the members.
    ///
    /// Segment `s` is owned by `members[s % n], members[(s + 1) % n], ...`.
    pub fn balanced(num_segments: u32, num_owners: usize, members: &[NodeId]) -> Self {
        let n = members.len();
        let k = num_owners.max(1).min(n);
        let owners = (0..num_segments as usize)
            .map(|s| (0..k).map(|i| members[(s + i) % n]).collect())
            .collect();
        Self::new(num_owners, members.to_vec(), owners)
    }

    /// Compute a balanced hash for `members` that keeps as many of the
    /// current owners as the per-node capacity allows.
    pub fn rebalance(&self, members: &[NodeId]) -> Self {
        let num_segments = self.owners.len();
        let n = members.len();
        if n == 0 {
            return Self::empty(num_segments as u32, self.num_owners);
        }

        let k = self.num_owners.min(n);
        let max_owned = (num_segments * k + n - 1) / n;
        let max_primary = (num_segments + n - 1) / n;

        let mut owned: HashMap<NodeId, usize> = members.iter().map(|m| (*m, 0)).collect();
        let mut owners: Vec<Vec<NodeId>> = vec![Vec::new(); num_segments];

        // Keep one surviving owner per segment first, then extra survivors,
        // both bounded by the per-node capacity.
        for keep_all in [false, true] {
            for (segment, current) in self.owners.iter().enumerate() {
                if !keep_all && !owners[segment].is_empty() {
                    continue;
                }
                for node in current {
                    if owners[segment].len() >= k || (!keep_all && !owners[segment].is_empty()) {
                        break;
                    }
                    if owners[segment].contains(node) {
                        continue;
                    }
                    if let Some(count) = owned.get_mut(node) {
                        if *count < max_owned {
                            owners[segment].push(*node);
                            *count += 1;
                        }
                    }
                }
            }
        }

        // Fill the gaps with the least loaded members.
        for segment_owners in owners.iter_mut() {
            while segment_owners.len() < k {
                let candidate = members
                    .iter()
                    .filter(|m| !segment_owners.contains(*m))
                    .min_by_key(|m| owned.get(*m).copied().unwrap_or(0))
                    .copied();
                match candidate {
                    Some(node) => {
                        segment_owners.push(node);
                        *owned.entry(node).or_insert(0) += 1;
                    }
                    None => break,
                }
            }
        }

        // Spread primaries by promoting an under-loaded backup.
        let mut primaries: HashMap<NodeId, usize> = members.iter().map(|m| (*m, 0)).collect();
        for segment_owners in &owners {
            if let Some(primary) = segment_owners.first() {
                *primaries.entry(*primary).or_insert(0) += 1;
            }
        }
        for segment_owners in owners.iter_mut() {
            let Some(&primary) = segment_owners.first() else {
                continue;
            };
            if primaries[&primary] <= max_primary {
                continue;
            }
            let promote = (1..segment_owners.len())
                .find(|&i| primaries[&segment_owners[i]] < max_primary);
            if let Some(pos) = promote {
                let backup = segment_owners[pos];
                segment_owners.swap(0, pos);
                *primaries.entry(primary).or_insert(1) -= 1;
                *primaries.entry(backup).or_insert(0) += 1;
            }
        }

        Self::new(self.num_owners, members.to_vec(), owners)
    }

    /// Drop the given nodes from the member list and every owner list.
    ///
    /// Segments may be left with fewer owners than configured, or none.
    pub fn without_members(&self, leavers: &[NodeId]) -> Self {
        let members = self
            .members
            .iter()
            .copied()
            .filter(|m| !leavers.contains(m))
            .collect();
        let owners = self
            .owners
            .iter()
            .map(|o| o.iter().copied().filter(|n| !leavers.contains(n)).collect())
            .collect();
        Self::new(self.num_owners, members, owners)
    }

    /// Combine two hashes: every segment is owned by this hash's owners
    /// followed by the other's owners that are not already listed.
    pub fn union(&self, other: &ConsistentHash) -> Self {
        let mut members = self.members.clone();
        for m in &other.members {
            if !members.contains(m) {
                members.push(*m);
            }
        }
        let num_segments = self.owners.len().max(other.owners.len());
        let owners = (0..num_segments)
            .map(|s| {
                let mut list = self.owners.get(s).cloned().unwrap_or_default();
                for n in other.owners.get(s).into_iter().flatten() {
                    if !list.contains(n) {
                        list.push(*n);
                    }
                }
                list
            })
            .collect();
        Self::new(self.num_owners.max(other.num_owners), members, owners)
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.owners.len() as u32
    }

    /// Configured number of owners.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    /// Members this hash was built for.
    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    /// Ordered owners of a segment.
    pub fn owners_of(&self, segment: SegmentId) -> &[NodeId] {
        self.owners
            .get(segment as usize)
            .map(|o| o.as_slice())
            .unwrap_or(&[])
    }

    /// Primary owner of a segment.
    pub fn primary_of(&self, segment: SegmentId) -> Option<NodeId> {
        self.owners_of(segment).first().copied()
    }

    /// Whether the node owns the segment (primary or backup).
    pub fn is_owner(&self, node: NodeId, segment: SegmentId) -> bool {
        self.owners_of(segment).contains(&node)
    }

    /// All segments the node owns.
    pub fn segments_owned_by(&self, node: NodeId) -> SegmentSet {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(&node))
            .map(|(s, _)| s as SegmentId)
            .collect()
    }

    /// Segments for which the node is the primary owner.
    pub fn primary_segments_of(&self, node: NodeId) -> SegmentSet {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.first() == Some(&node))
            .map(|(s, _)| s as SegmentId)
            .collect()
    }
}

/// A versioned, immutable view of segment ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTopology {
    /// Topology id, strictly increasing across the cluster.
    pub id: TopologyId,

    /// Members in join order. The first member coordinates rebalances.
    pub members: Vec<NodeId>,

    /// Owners that currently hold the data.
    current: ConsistentHash,

    /// Owners being moved to, present only while rebalancing.
    pending: Option<ConsistentHash>,

    /// Current owners followed by pending ones, present only while
    /// rebalancing.
    union: Option<ConsistentHash>,
}

impl CacheTopology {
    /// Create a topology from its parts.
    pub fn new(
        id: TopologyId,
        members: Vec<NodeId>,
        current: ConsistentHash,
        pending: Option<ConsistentHash>,
    ) -> Self {
        let union = pending.as_ref().map(|p| current.union(p));
        Self {
            id,
            members,
            current,
            pending,
            union,
        }
    }

    /// The first topology of a cache: balanced over the founding members.
    pub fn initial(num_segments: u32, num_owners: usize, members: &[NodeId]) -> Self {
        Self::new(
            1,
            members.to_vec(),
            ConsistentHash::balanced(num_segments, num_owners, members),
            None,
        )
    }

    /// Owners used for reads: the current hash.
    pub fn read_ch(&self) -> &ConsistentHash {
        &self.current
    }

    /// Owners that must receive writes. While rebalancing this is every
    /// current owner plus every pending one, so neither side misses a write.
    pub fn write_ch(&self) -> &ConsistentHash {
        self.union.as_ref().unwrap_or(&self.current)
    }

    /// The pending hash, if a rebalance is in progress.
    pub fn pending_ch(&self) -> Option<&ConsistentHash> {
        self.pending.as_ref()
    }

    /// Whether a rebalance is in progress.
    pub fn is_rebalancing(&self) -> bool {
        self.pending.is_some()
    }

    /// The coordinating member.
    pub fn coordinator(&self) -> Option<NodeId> {
        self.members.first().copied()
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.current.num_segments()
    }

    /// Next topology: start moving to `pending`.
    pub fn with_pending(&self, pending: ConsistentHash) -> Self {
        Self::new(
            self.id + 1,
            pending.members().to_vec(),
            self.current.clone(),
            Some(pending),
        )
    }

    /// Next topology: the pending hash becomes current.
    pub fn committed(&self) -> Self {
        let current = self.pending.clone().unwrap_or_else(|| self.current.clone());
        Self::new(self.id + 1, self.members.clone(), current, None)
    }

    /// Next topology: leavers removed from both hashes and the members.
    pub fn without_members(&self, leavers: &[NodeId]) -> Self {
        Self::new(
            self.id + 1,
            self.members
                .iter()
                .copied()
                .filter(|m| !leavers.contains(m))
                .collect(),
            self.current.without_members(leavers),
            self.pending.as_ref().map(|p| p.without_members(leavers)),
        )
    }

    /// Next topology: any pending rebalance abandoned.
    pub fn without_pending(&self) -> Self {
        Self::new(self.id + 1, self.members.clone(), self.current.clone(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_assignment() {
        let ch = ConsistentHash::balanced(6, 2, &[1, 2, 3]);
        assert_eq!(ch.owners_of(0), &[1, 2]);
        assert_eq!(ch.owners_of(1), &[2, 3]);
        assert_eq!(ch.owners_of(2), &[3, 1]);
        assert_eq!(ch.primary_of(4), Some(2));
        assert_eq!(ch.segments_owned_by(1).len(), 4);
        assert_eq!(ch.primary_segments_of(1), SegmentSet::from([0, 3]));
    }

    #[test]
    fn test_balanced_fewer_members_than_owners() {
        let ch = ConsistentHash::balanced(4, 3, &[7]);
        for s in 0..4 {
            assert_eq!(ch.owners_of(s), &[7]);
        }
        assert_eq!(ch.num_owners(), 3);
    }

    #[test]
    fn test_rebalance_adds_joiner_and_keeps_owners() {
        let old = ConsistentHash::balanced(12, 2, &[1, 2]);
        let new = old.rebalance(&[1, 2, 3]);

        let mut primaries = HashMap::new();
        for s in 0..12 {
            let owners = new.owners_of(s);
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
            *primaries.entry(owners[0]).or_insert(0) += 1;
            // At least one previous owner survives in every segment.
            assert!(owners.iter().any(|o| old.is_owner(*o, s)));
        }
        assert!(new.segments_owned_by(3).len() >= 7);
        assert!(primaries.values().all(|&c| c <= 4), "{:?}", primaries);
    }

    #[test]
    fn test_rebalance_after_leave_refills() {
        let old = ConsistentHash::balanced(8, 2, &[1, 2, 3]).without_members(&[3]);
        let new = old.rebalance(&[1, 2]);
        for s in 0..8 {
            let mut owners = new.owners_of(s).to_vec();
            owners.sort();
            assert_eq!(owners, vec![1, 2]);
        }
    }

    #[test]
    fn test_without_members() {
        let ch = ConsistentHash::balanced(3, 1, &[1, 2, 3]).without_members(&[2]);
        assert_eq!(ch.owners_of(1), &[] as &[NodeId]);
        assert_eq!(ch.primary_of(1), None);
        assert_eq!(ch.members(), &[1, 3]);
    }

    #[test]
    fn test_union() {
        let a = ConsistentHash::balanced(2, 1, &[1]);
        let b = ConsistentHash::balanced(2, 1, &[2]);
        let u = a.union(&b);
        assert_eq!(u.owners_of(0), &[1, 2]);
        assert_eq!(u.members(), &[1, 2]);
    }

    #[test]
    fn test_topology_lifecycle() {
        let t1 = CacheTopology::initial(4, 1, &[1]);
        assert_eq!(t1.id, 1);
        assert!(!t1.is_rebalancing());
        assert_eq!(t1.coordinator(), Some(1));

        let t2 = t1.with_pending(t1.read_ch().rebalance(&[1, 2]));
        assert_eq!(t2.id, 2);
        assert!(t2.is_rebalancing());
        assert_eq!(t2.read_ch(), t1.read_ch());
        assert_eq!(t2.members, vec![1, 2]);

        let t3 = t2.committed();
        assert_eq!(t3.id, 3);
        assert!(!t3.is_rebalancing());
        assert_eq!(Some(t3.read_ch()), t2.pending_ch());
    }

    #[test]
    fn test_write_owners_cover_both_hashes() {
        let t1 = CacheTopology::initial(4, 1, &[1]);
        let t2 = t1.with_pending(t1.read_ch().rebalance(&[1, 2]));
        for s in 0..4 {
            let write = t2.write_ch().owners_of(s);
            assert_eq!(write[0], 1);
            let pending = t2.pending_ch().unwrap();
            assert!(pending.owners_of(s).iter().all(|o| write.contains(o)));
        }
        assert_eq!(t1.write_ch(), t1.read_ch());
    }
}
