//! Home-rank mapping functions (spec §4.5, enriched per SPEC_FULL §2 from
//! `original_source/topos/mapping/dense/dense.h`).
//!
//! The spec only requires "a pure function of the ID" for home-rank
//! assignment; the original ships concrete 1D/2D/3D index-to-rank map
//! families for collections. This module carries the 1D analogues, since
//! this core's entities are addressed by a flat logical id rather than a
//! multi-dimensional collection index.

use crate::types::RankId;

/// A pluggable map from an entity/element index to an owning rank. Used
/// both as the default home-rank function ([`block_map`]/
/// [`round_robin_map`]) and as the user-supplied map function RDMA's
/// `registerCollective` (spec §4.6) and the collection manager (spec
/// §4.11 via SPEC_FULL) require.
pub trait IndexMap: Fn(u64, u32) -> RankId {}
impl<F: Fn(u64, u32) -> RankId> IndexMap for F {}

/// Contiguous block distribution: index range is split into
/// `world_size` contiguous blocks, one per rank. Ties (fewer indices than
/// ranks) give early ranks the remainder block.
pub fn block_map(total: u64) -> impl Fn(u64, u32) -> RankId + Clone {
    move |index, world_size| {
        let world_size = world_size.max(1) as u64;
        let block = total.div_ceil(world_size).max(1);
        RankId::new(((index / block) as u32).min(world_size as u32 - 1))
    }
}

/// Round-robin distribution: `index % world_size`.
pub fn round_robin_map(index: u64, world_size: u32) -> RankId {
    let world_size = world_size.max(1) as u64;
    RankId::new((index % world_size) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_ranks() {
        assert_eq!(round_robin_map(0, 4), RankId::new(0));
        assert_eq!(round_robin_map(1, 4), RankId::new(1));
        assert_eq!(round_robin_map(4, 4), RankId::new(0));
    }

    #[test]
    fn block_map_splits_contiguous_ranges() {
        let map = block_map(10);
        assert_eq!(map(0, 4), RankId::new(0));
        assert_eq!(map(2, 4), RankId::new(0));
        assert_eq!(map(3, 4), RankId::new(1));
        assert_eq!(map(9, 4), RankId::new(3));
    }
}
