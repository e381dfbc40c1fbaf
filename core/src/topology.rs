//! Spanning-tree topology shared by the termination detector's 4-counter
//! wave algorithm and the tree-based barrier/reduction/broadcast
//! (SPEC_FULL §2, grounded in `original_source/tree.h` + `barrier.h`:
//! "the same structure the wave termination algorithm needs").
//!
//! A binary tree is used for simplicity and because it is the shape all
//! three consumers actually need: a parent to report up to, and a small,
//! deterministic set of children to wait on or forward to. The tree can
//! be rooted at an arbitrary rank (not just rank 0), since a broadcast's
//! spanning tree is rooted at whichever rank calls `broadcast`.

use crate::types::RankId;

/// This rank's position in a `k`-ary spanning tree over all ranks, rooted
/// at an arbitrary rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    root: RankId,
    this_rank: RankId,
    world_size: u32,
    arity: u32,
}

impl Tree {
    /// Build the tree view for `this_rank` out of `world_size` ranks,
    /// rooted at `root`, with each rank having up to `arity` children (2
    /// for a classic binary tree).
    pub fn new(root: RankId, this_rank: RankId, world_size: u32, arity: u32) -> Self {
        assert!(arity >= 1, "tree arity must be at least 1");
        Tree {
            root,
            this_rank,
            world_size,
            arity,
        }
    }

    fn logical(&self, rank: RankId) -> u32 {
        (rank.as_u32() + self.world_size - self.root.as_u32()) % self.world_size
    }

    fn physical(&self, logical: u32) -> RankId {
        RankId::new((logical + self.root.as_u32()) % self.world_size)
    }

    pub fn is_root(&self) -> bool {
        self.this_rank == self.root
    }

    pub fn root(&self) -> RankId {
        self.root
    }

    pub fn parent(&self) -> Option<RankId> {
        if self.is_root() {
            None
        } else {
            let logical = self.logical(self.this_rank);
            Some(self.physical((logical - 1) / self.arity))
        }
    }

    /// Children of this rank within the spanning tree, bounded by
    /// `world_size`.
    pub fn children(&self) -> Vec<RankId> {
        let logical = self.logical(self.this_rank);
        let base = logical * self.arity + 1;
        (0..self.arity)
            .map(|i| base + i)
            .filter(|&child| child < self.world_size)
            .map(|child| self.physical(child))
            .collect()
    }

    pub fn num_children(&self) -> u32 {
        self.children().len() as u32
    }

    pub fn is_leaf(&self) -> bool {
        self.num_children() == 0
    }
}
