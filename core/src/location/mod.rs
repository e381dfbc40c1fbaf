//! Location manager (spec §4.5): routes messages to migratable entities
//! by logical id rather than physical rank.
//!
//! Sending a message to an entity is split into two steps everywhere else
//! in this crate: [`LocationManager::route`] decides *where the bytes
//! should go next* (deliver here, forward to a cached guess, forward to
//! home, or give up), and the caller (the active messenger) is the one
//! that actually puts bytes on the wire. This keeps the location manager
//! free of any transport dependency, the same way [`crate::event`] keeps
//! its predicates transport-agnostic.

pub mod mapping;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::LocationConfig;
use crate::error::LocationError;
use crate::types::RankId;

pub type EntityId = u64;

/// What [`LocationManager::route`] decided to do with a message headed
/// for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// The entity is here; dispatch locally.
    DeliverLocally,
    /// Forward to `to`, carrying `hop_count` forward (spec §4.5: "annotate
    /// the message with a hop counter").
    Forward { to: RankId, hop_count: u32 },
}

struct LocationManagerInner {
    this_rank: RankId,
    world_size: u32,
    config: LocationConfig,
    map_fn: Rc<dyn Fn(EntityId, u32) -> RankId>,
    /// Authoritative current-location table, populated only for entities
    /// whose home rank is `this_rank` (spec §3: "LocationManager owns the
    /// current-location table for entities whose home is this rank").
    homed: HashMap<EntityId, RankId>,
    /// Non-authoritative cache of guessed current locations, subject to
    /// eviction/staleness (spec §3: "other ranks hold a cache subject to
    /// eviction").
    cache: HashMap<EntityId, RankId>,
}

/// Per-rank entity location tracker (spec §4.5).
#[derive(Clone)]
pub struct LocationManager {
    inner: Rc<RefCell<LocationManagerInner>>,
}

impl LocationManager {
    pub fn new(this_rank: RankId, world_size: u32, config: LocationConfig) -> Self {
        LocationManager {
            inner: Rc::new(RefCell::new(LocationManagerInner {
                this_rank,
                world_size,
                config,
                map_fn: Rc::new(mapping::round_robin_map),
                homed: HashMap::new(),
                cache: HashMap::new(),
            })),
        }
    }

    /// Use a custom home-rank mapping function instead of the default
    /// round-robin (spec §9 dense/round-robin mapping; shared with RDMA
    /// collective handles and the collection manager).
    pub fn with_map_fn(this_rank: RankId, world_size: u32, config: LocationConfig, map_fn: Rc<dyn Fn(EntityId, u32) -> RankId>) -> Self {
        LocationManager {
            inner: Rc::new(RefCell::new(LocationManagerInner {
                this_rank,
                world_size,
                config,
                map_fn,
                homed: HashMap::new(),
                cache: HashMap::new(),
            })),
        }
    }

    /// Deterministic home rank for `id` (spec §3 "Entity identity": "a
    /// home rank (deterministic from the ID)").
    pub fn home_rank(&self, id: EntityId) -> RankId {
        let inner = self.inner.borrow();
        (inner.map_fn)(id, inner.world_size)
    }

    /// Register `id` as materializing on this rank right now (creation,
    /// or the destination side of a migration). If this rank is the
    /// entity's home, the authoritative table is updated directly with no
    /// network round-trip required.
    pub fn register_local(&self, id: EntityId) {
        let mut inner = self.inner.borrow_mut();
        let this_rank = inner.this_rank;
        inner.cache.insert(id, this_rank);
        if self.home_rank(id) == this_rank {
            inner.homed.insert(id, this_rank);
        }
    }

    /// Decide how to route a message addressed to `id`, currently
    /// carrying `hop_count` hops (spec §4.5 "Algorithm").
    pub fn route(&self, id: EntityId, hop_count: u32) -> Result<RouteDecision, LocationError> {
        let inner = self.inner.borrow();
        if hop_count > inner.config.max_hops {
            return Err(LocationError::HopLimitExceeded(id, inner.config.max_hops));
        }

        if let Some(&cached) = inner.cache.get(&id) {
            if cached == inner.this_rank {
                return Ok(RouteDecision::DeliverLocally);
            }
            if hop_count < inner.config.cache_hop_bound {
                return Ok(RouteDecision::Forward {
                    to: cached,
                    hop_count: hop_count + 1,
                });
            }
        }

        let home = (inner.map_fn)(id, inner.world_size);
        if home == inner.this_rank {
            // Authoritative: consult the homed table, defaulting to
            // "delivered here" for an entity never explicitly migrated
            // away from its home.
            let current = inner.homed.get(&id).copied().unwrap_or(inner.this_rank);
            if current == inner.this_rank {
                Ok(RouteDecision::DeliverLocally)
            } else {
                Ok(RouteDecision::Forward {
                    to: current,
                    hop_count: hop_count + 1,
                })
            }
        } else {
            Ok(RouteDecision::Forward {
                to: home,
                hop_count: hop_count + 1,
            })
        }
    }

    /// Record a freshly learned current-rank guess for `id` (spec §4.5:
    /// eager cache). Called whenever a routed message's response reveals
    /// where the entity actually lives.
    pub fn note_current_rank(&self, id: EntityId, rank: RankId) {
        self.inner.borrow_mut().cache.insert(id, rank);
    }

    /// Begin migrating `id`, currently materialized on this rank, to
    /// `dest`. Updates local bookkeeping only; the caller (the collection
    /// manager) is responsible for actually sending `EntityArrive` to
    /// `dest` and `EntityMoved` to home (spec §4.5 "Migration protocol").
    /// Returns the home rank so the caller knows who to notify.
    pub fn begin_migration(&self, id: EntityId, dest: RankId) -> RankId {
        let mut inner = self.inner.borrow_mut();
        let this_rank = inner.this_rank;
        inner.cache.insert(id, dest);
        let home = (inner.map_fn)(id, inner.world_size);
        if home == this_rank {
            inner.homed.insert(id, dest);
        }
        home
    }

    /// Process an `EntityMoved` control message on the home rank,
    /// updating the authoritative table (spec §4.5: "home atomically
    /// updates its table and acknowledges").
    pub fn on_entity_moved(&self, id: EntityId, new_rank: RankId) {
        let mut inner = self.inner.borrow_mut();
        debug_assert_eq!(
            (inner.map_fn)(id, inner.world_size),
            inner.this_rank,
            "on_entity_moved called on a non-home rank for entity {id}"
        );
        inner.homed.insert(id, new_rank);
        inner.cache.insert(id, new_rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_delivers_locally_on_its_home_rank() {
        let loc = LocationManager::new(RankId::new(0), 4, LocationConfig::default());
        let home = loc.home_rank(7);
        if home == RankId::new(0) {
            loc.register_local(7);
            assert_eq!(loc.route(7, 0).unwrap(), RouteDecision::DeliverLocally);
        }
    }

    #[test]
    fn route_forwards_toward_home_absent_a_cache_entry() {
        let loc = LocationManager::new(RankId::new(0), 4, LocationConfig::default());
        // entity id chosen so home != this_rank under round robin
        let id = 1u64; // round_robin_map(1, 4) = rank 1
        match loc.route(id, 0).unwrap() {
            RouteDecision::Forward { to, hop_count } => {
                assert_eq!(to, RankId::new(1));
                assert_eq!(hop_count, 1);
            }
            RouteDecision::DeliverLocally => panic!("expected a forward"),
        }
    }

    #[test]
    fn hop_limit_exceeded_is_an_error() {
        let mut config = LocationConfig::default();
        config.max_hops = 2;
        let loc = LocationManager::new(RankId::new(0), 4, config);
        assert!(loc.route(1, 3).is_err());
    }

    #[test]
    fn migration_updates_home_table_and_cache() {
        let loc = LocationManager::new(RankId::new(0), 4, LocationConfig::default());
        let id = 0u64; // round_robin_map(0, 4) = rank 0, so this rank is home
        loc.register_local(id);
        let home = loc.begin_migration(id, RankId::new(2));
        assert_eq!(home, RankId::new(0));
        match loc.route(id, 0).unwrap() {
            RouteDecision::Forward { to, .. } => assert_eq!(to, RankId::new(2)),
            RouteDecision::DeliverLocally => panic!("entity should have migrated away"),
        }
    }

    #[test]
    fn stale_cache_beyond_hop_bound_reroutes_through_home() {
        let mut config = LocationConfig::default();
        config.cache_hop_bound = 1;
        let loc = LocationManager::with_map_fn(
            RankId::new(0),
            4,
            config,
            Rc::new(|_id: EntityId, _w: u32| RankId::new(0)),
        );
        loc.note_current_rank(5, RankId::new(3));
        // within hop bound: trust cache
        match loc.route(5, 0).unwrap() {
            RouteDecision::Forward { to, .. } => assert_eq!(to, RankId::new(3)),
            _ => panic!("expected forward to cached rank"),
        }
        // at/over hop bound: fall back to home (this rank), delivering locally
        assert_eq!(loc.route(5, 1).unwrap(), RouteDecision::DeliverLocally);
    }
}
