//! Ownership changes between two hashes or topologies.
//!
//! Pure functions; they never touch the tracker or the network.

use crate::topology::consistent_hash::{CacheTopology, ConsistentHash};
use crate::types::{NodeId, SegmentSet};
use std::collections::BTreeMap;

/// Per-node segments gained and lost between two ownership maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipDiff {
    gained: BTreeMap<NodeId, SegmentSet>,
    lost: BTreeMap<NodeId, SegmentSet>,
}

impl OwnershipDiff {
    /// Segments the node owns in the new map but not in the old one.
    pub fn gained_by(&self, node: NodeId) -> SegmentSet {
        self.gained.get(&node).cloned().unwrap_or_default()
    }

    /// Segments the node owned in the old map but not in the new one.
    pub fn lost_by(&self, node: NodeId) -> SegmentSet {
        self.lost.get(&node).cloned().unwrap_or_default()
    }

    /// Every node with at least one gained segment.
    pub fn gaining_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.gained.keys().copied()
    }

    /// Every node with at least one lost segment.
    pub fn losing_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.lost.keys().copied()
    }

    /// Total number of (node, segment) ownership changes.
    pub fn total_changes(&self) -> usize {
        self.gained.values().map(|s| s.len()).sum::<usize>()
            + self.lost.values().map(|s| s.len()).sum::<usize>()
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.gained.is_empty() && self.lost.is_empty()
    }
}

/// Compare two ownership maps segment by segment.
pub fn diff(old: &ConsistentHash, new: &ConsistentHash) -> OwnershipDiff {
    let mut result = OwnershipDiff::default();
    let num_segments = old.num_segments().max(new.num_segments());

    for segment in 0..num_segments {
        let before = old.owners_of(segment);
        let after = new.owners_of(segment);

        for node in after.iter().filter(|n| !before.contains(n)) {
            result.gained.entry(*node).or_default().insert(segment);
        }
        for node in before.iter().filter(|n| !after.contains(n)) {
            result.lost.entry(*node).or_default().insert(segment);
        }
    }

    result
}

/// Compare the write ownership of two topologies.
pub fn topology_diff(old: &CacheTopology, new: &CacheTopology) -> OwnershipDiff {
    diff(old.write_ch(), new.write_ch())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_every_segment_has_one_primary() {
        for members in [vec![1], vec![1, 2], vec![1, 2, 3, 4, 5]] {
            let ch = ConsistentHash::balanced(32, 2, &members);
            let expected_owners = 2.min(members.len());
            for s in 0..32 {
                let owners = ch.owners_of(s);
                assert_eq!(owners.len(), expected_owners);
                let unique: BTreeSet<_> = owners.iter().collect();
                assert_eq!(unique.len(), owners.len());
                assert!(ch.primary_of(s).is_some());
            }
        }
    }

    #[test]
    fn test_diff_matches_symmetric_difference() {
        let old = ConsistentHash::balanced(16, 2, &[1, 2, 3]);
        let new = old.rebalance(&[1, 2, 3, 4]);
        let d = diff(&old, &new);

        let mut expected = 0;
        for s in 0..16 {
            let a: BTreeSet<_> = old.owners_of(s).iter().copied().collect();
            let b: BTreeSet<_> = new.owners_of(s).iter().copied().collect();
            expected += a.symmetric_difference(&b).count();

            for node in b.difference(&a) {
                assert!(d.gained_by(*node).contains(&s));
            }
            for node in a.difference(&b) {
                assert!(d.lost_by(*node).contains(&s));
            }
        }
        assert_eq!(d.total_changes(), expected);
        assert!(!d.gained_by(4).is_empty());
        assert!(d.lost_by(4).is_empty());
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let ch = ConsistentHash::balanced(8, 2, &[1, 2]);
        assert!(diff(&ch, &ch).is_empty());
    }

    #[test]
    fn test_topology_diff_uses_write_owners() {
        let t1 = CacheTopology::initial(4, 1, &[1]);
        let t2 = t1.with_pending(t1.read_ch().rebalance(&[1, 2]));
        let d = topology_diff(&t1, &t2);
        assert_eq!(d.gained_by(2), t2.write_ch().segments_owned_by(2));

        // Committing only drops the owners that were moved away from.
        let t3 = t2.committed();
        let d = topology_diff(&t2, &t3);
        assert!(d.gaining_nodes().next().is_none());
        assert_eq!(d.lost_by(1), t3.read_ch().segments_owned_by(2));
    }
}
