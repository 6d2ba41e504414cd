//! The externally supplied, Hilbert-ordered domain decomposition (§4.5.1,
//! §6). The solver never builds this tree itself; it only ever reads it
//! through [`LoadBalanceTree`]. [`SegmentTree`] is a reference
//! implementation for tests and the CLI demo: a balanced
//! `NUM_SUBDIVISIONS`-ary recursive bisection of the key space, generalized
//! from the original decomposition's binary segment-bisection to an
//! arbitrary branching factor matching the gravity tree's own octant count.

use crate::config::NUM_SUBDIVISIONS;
use crate::morton::SfcKey;

/// Read-only contract for the tree that assigns space-filling-curve ranges
/// to MPI ranks. The solver's top tree is the prefix of this tree common
/// to every rank; its leaves are the per-rank partitions.
pub trait LoadBalanceTree {
    fn root(&self) -> usize {
        0
    }
    fn num_nodes(&self) -> usize;
    fn num_leaves(&self) -> usize;

    /// Index of the first of this node's `NUM_SUBDIVISIONS` children, or
    /// `None` if `node` is itself a leaf.
    fn children_start(&self, node: usize) -> Option<usize>;

    /// Reorders a Z-order (local gravity tree) octant index into the order
    /// this tree's children appear in under the Hilbert curve, so the top
    /// tree the solver replicates visits children in the same order on
    /// every rank regardless of which curve the local tree walks.
    fn zorder_to_hilbert(&self, octant: usize) -> usize;

    /// The owning rank of leaf `leaf` (indexed in depth-first leaf order).
    fn leaf_pid(&self, leaf: usize) -> i32;

    /// The leaf whose key range contains `key`.
    fn find_leaf(&self, key: SfcKey) -> usize;

    fn key_range(&self, leaf: usize) -> (SfcKey, SfcKey);
}

struct LbNode {
    start: SfcKey,
    end: SfcKey,
    children_start: Option<usize>,
    rank: Option<i32>,
}

pub struct SegmentTree {
    nodes: Vec<LbNode>,
    leaves: Vec<usize>,
}

impl SegmentTree {
    /// Build a balanced `NUM_SUBDIVISIONS`-ary tree over
    /// `[SfcKey::MIN, SfcKey::MAX]` deep enough to produce at least
    /// `num_ranks` leaves, then assign leaves to ranks contiguously and
    /// proportionally. A real decomposition would size leaves by measured
    /// particle counts; this reference assumes a uniform key
    /// distribution.
    pub fn new_balanced(num_ranks: i32) -> Self {
        assert!(num_ranks > 0);
        let mut depth = 0usize;
        let mut leaves_total: u64 = 1;
        while leaves_total < num_ranks as u64 {
            leaves_total *= NUM_SUBDIVISIONS as u64;
            depth += 1;
        }

        let mut nodes = vec![LbNode {
            start: SfcKey::MIN,
            end: SfcKey::MAX,
            children_start: None,
            rank: None,
        }];
        let mut leaves = Vec::new();
        let mut next_leaf: i32 = 0;
        build_node(
            &mut nodes,
            &mut leaves,
            0,
            depth,
            &mut next_leaf,
            leaves_total as i32,
            num_ranks,
        );
        Self { nodes, leaves }
    }
}

fn build_node(
    nodes: &mut Vec<LbNode>,
    leaves: &mut Vec<usize>,
    this_index: usize,
    depth_remaining: usize,
    next_leaf: &mut i32,
    leaves_total: i32,
    num_ranks: i32,
) {
    if depth_remaining == 0 {
        let rank = (*next_leaf as i64 * num_ranks as i64 / leaves_total as i64) as i32;
        *next_leaf += 1;
        nodes[this_index].rank = Some(rank);
        leaves.push(this_index);
        return;
    }

    let (start, end) = (nodes[this_index].start, nodes[this_index].end);
    let children_start = nodes.len();
    nodes[this_index].children_start = Some(children_start);
    for _ in 0..NUM_SUBDIVISIONS {
        nodes.push(LbNode {
            start: SfcKey::MIN,
            end: SfcKey::MIN,
            children_start: None,
            rank: None,
        });
    }

    let span = end.0 - start.0;
    for i in 0..NUM_SUBDIVISIONS {
        let child_start = SfcKey(start.0 + span * i as u64 / NUM_SUBDIVISIONS as u64);
        let child_end = SfcKey(start.0 + span * (i as u64 + 1) / NUM_SUBDIVISIONS as u64);
        nodes[children_start + i].start = child_start;
        nodes[children_start + i].end = child_end;
        build_node(
            nodes,
            leaves,
            children_start + i,
            depth_remaining - 1,
            next_leaf,
            leaves_total,
            num_ranks,
        );
    }
}

impl LoadBalanceTree for SegmentTree {
    fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    fn children_start(&self, node: usize) -> Option<usize> {
        self.nodes[node].children_start
    }

    fn zorder_to_hilbert(&self, octant: usize) -> usize {
        // The balanced reference tree enumerates children in the same
        // order the gravity tree's Z-order octants do, so no permutation
        // is needed; a true Hilbert curve would rotate/reflect this per
        // node.
        octant
    }

    fn leaf_pid(&self, leaf: usize) -> i32 {
        self.nodes[self.leaves[leaf]].rank.expect("leaf without assigned rank")
    }

    fn find_leaf(&self, key: SfcKey) -> usize {
        match self.leaves.binary_search_by(|&node_index| {
            let node = &self.nodes[node_index];
            if key < node.start {
                std::cmp::Ordering::Greater
            } else if key >= node.end {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(index) => index,
            Err(index) => index.min(self.leaves.len() - 1),
        }
    }

    fn key_range(&self, leaf: usize) -> (SfcKey, SfcKey) {
        let node = &self.nodes[self.leaves[leaf]];
        (node.start, node.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_tree_has_enough_leaves_for_every_rank() {
        let tree = SegmentTree::new_balanced(5);
        assert!(tree.num_leaves() >= 5);
        for rank in 0..5 {
            assert!((0..tree.num_leaves()).any(|leaf| tree.leaf_pid(leaf) == rank));
        }
    }

    #[test]
    fn leaves_cover_the_whole_key_range_without_gaps() {
        let tree = SegmentTree::new_balanced(3);
        assert_eq!(tree.key_range(0).0, SfcKey::MIN);
        for i in 1..tree.num_leaves() {
            assert_eq!(tree.key_range(i - 1).1, tree.key_range(i).0);
        }
    }

    #[test]
    fn find_leaf_is_monotonic_in_key() {
        let tree = SegmentTree::new_balanced(4);
        let low = tree.find_leaf(SfcKey::MIN);
        let high = tree.find_leaf(SfcKey::MAX);
        assert!(low <= high);
    }

    #[test]
    fn root_has_children_and_leaves_do_not() {
        let tree = SegmentTree::new_balanced(4);
        assert!(tree.children_start(tree.root()).is_some());
        let some_leaf = tree.leaves[0];
        assert!(tree.children_start(some_leaf).is_none());
    }
}
