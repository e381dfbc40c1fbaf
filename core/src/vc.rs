//! VirtualContextManager / CollectionManager (SPEC_FULL §3.11, grounded in
//! `original_source/vrt_context.h` + `rdma_collection.h`/`auto_registry_vc.h`).
//!
//! Entity state is kept as a plain `Vec<u8>`, the same representation the
//! rest of this crate uses for anything that might cross a rank boundary
//! (envelope payloads, RDMA regions) — consistent with the no-serde
//! ground rule (SPEC_FULL §1 "Serialization seam"): a migrating entity's
//! state is whatever bytes its owner chose to hand `create`/`migrate`,
//! with no generic (de)serialization machinery imposed on it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::VcError;
use crate::handler_id::HandlerId;
use crate::location::{EntityId, LocationManager};
use crate::message::Message;
use crate::pool::Pool;
use crate::registry::{HandlerKind, Registry};
use crate::types::RankId;

struct VcInner {
    entities: HashMap<EntityId, Vec<u8>>,
    location: LocationManager,
}

/// Owner of every entity materialized on this rank (spec §3: "each entity
/// is exclusively owned by the rank listed as curr_node"). Addressing and
/// the current-location table live in [`LocationManager`]; this type owns
/// the actual state.
#[derive(Clone)]
pub struct VirtualContextManager {
    inner: Rc<RefCell<VcInner>>,
}

impl VirtualContextManager {
    pub fn new(location: LocationManager) -> Self {
        VirtualContextManager {
            inner: Rc::new(RefCell::new(VcInner {
                entities: HashMap::new(),
                location,
            })),
        }
    }

    pub fn location(&self) -> LocationManager {
        self.inner.borrow().location.clone()
    }

    /// Materialize a brand-new entity on this rank (creation, not the
    /// destination side of a migration — use [`Self::materialize_arrived`]
    /// there instead, since it skips the "must not already exist" check
    /// nothing but a fresh id can satisfy).
    pub fn create(&self, id: EntityId, initial_state: Vec<u8>) -> Result<(), VcError> {
        let mut inner = self.inner.borrow_mut();
        if inner.entities.contains_key(&id) {
            return Err(VcError::AlreadyExists(id));
        }
        inner.entities.insert(id, initial_state);
        inner.location.register_local(id);
        Ok(())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.inner.borrow().entities.contains_key(&id)
    }

    /// Clone of this entity's current state.
    pub fn state(&self, id: EntityId) -> Result<Vec<u8>, VcError> {
        self.inner
            .borrow()
            .entities
            .get(&id)
            .cloned()
            .ok_or(VcError::NotFound(id))
    }

    /// Run `f` against this entity's state in place, e.g. from a dispatched
    /// method handler (spec: "dispatch of messages to entity methods via
    /// Registry").
    pub fn with_state_mut<R>(&self, id: EntityId, f: impl FnOnce(&mut Vec<u8>) -> R) -> Result<R, VcError> {
        let mut inner = self.inner.borrow_mut();
        let state = inner.entities.get_mut(&id).ok_or(VcError::NotFound(id))?;
        Ok(f(state))
    }

    /// Remove this entity from this rank, handing its bytes back to the
    /// caller to send onward as part of a migration (spec §4.5 "Migration
    /// protocol"), and returns the entity's home rank so the caller knows
    /// who to send `EntityMoved` to. Returns an error (rather than
    /// removing) if the entity isn't here.
    pub fn begin_migration(&self, id: EntityId, dest: RankId) -> Result<(Vec<u8>, RankId), VcError> {
        let mut inner = self.inner.borrow_mut();
        let state = inner.entities.remove(&id).ok_or(VcError::NotFound(id))?;
        let home = inner.location.begin_migration(id, dest);
        Ok((state, home))
    }

    /// Materialize an entity arriving from a migration (the `EntityArrive`
    /// side, spec §4.5). Overwrites any stale local copy rather than
    /// erroring, since a migration destination legitimately has no prior
    /// record of the entity.
    pub fn materialize_arrived(&self, id: EntityId, state: Vec<u8>) {
        let mut inner = self.inner.borrow_mut();
        inner.entities.insert(id, state);
        inner.location.register_local(id);
    }
}

/// Dispatch target for [`CollectionManager::register_method`]: called with
/// the entity's own state and a message whose payload has the entity-id
/// prefix already stripped.
pub type MethodFn = Rc<dyn Fn(&mut Vec<u8>, &Message)>;

struct CollectionInner {
    this_rank: RankId,
    world_size: u32,
    map_fn: Rc<dyn Fn(EntityId, u32) -> RankId>,
}

/// An indexed collection of same-shaped entities (spec §2/§3.11): owns no
/// state of its own beyond the home-rank mapping — entity state lives in
/// the shared [`VirtualContextManager`], and method dispatch is registered
/// with the shared [`Registry`] so ordinary active messages can target a
/// collection element the same way they target any other handler.
#[derive(Clone)]
pub struct CollectionManager {
    inner: Rc<RefCell<CollectionInner>>,
    vc: VirtualContextManager,
    registry: Registry,
    pool: Pool,
}

impl CollectionManager {
    pub fn new(this_rank: RankId, world_size: u32, vc: VirtualContextManager, registry: Registry, pool: Pool) -> Self {
        CollectionManager {
            inner: Rc::new(RefCell::new(CollectionInner {
                this_rank,
                world_size,
                map_fn: Rc::new(crate::location::mapping::round_robin_map),
            })),
            vc,
            registry,
            pool,
        }
    }

    pub fn with_map_fn(
        this_rank: RankId,
        world_size: u32,
        vc: VirtualContextManager,
        registry: Registry,
        pool: Pool,
        map_fn: Rc<dyn Fn(EntityId, u32) -> RankId>,
    ) -> Self {
        CollectionManager {
            inner: Rc::new(RefCell::new(CollectionInner {
                this_rank,
                world_size,
                map_fn,
            })),
            vc,
            registry,
            pool,
        }
    }

    pub fn home_rank(&self, id: EntityId) -> RankId {
        let inner = self.inner.borrow();
        (inner.map_fn)(id, inner.world_size)
    }

    pub fn this_rank(&self) -> RankId {
        self.inner.borrow().this_rank
    }

    /// Place a new element at `id` on this rank (typically its home rank,
    /// though nothing here enforces that — the caller decides placement
    /// the same way `vt`'s collection construction does).
    pub fn insert(&self, id: EntityId, initial_state: Vec<u8>) -> Result<(), VcError> {
        self.vc.create(id, initial_state)
    }

    /// Move element `id` to `dest`, returning its state bytes and home
    /// rank for the caller (the runtime) to send onward as
    /// `EntityArrive`/`EntityMoved` control messages.
    pub fn migrate(&self, id: EntityId, dest: RankId) -> Result<(Vec<u8>, RankId), VcError> {
        self.vc.begin_migration(id, dest)
    }

    /// Register a method callable on every element of this collection.
    /// Incoming message payloads are expected to be prefixed with the
    /// target element's 8-byte little-endian [`EntityId`]; this wrapper
    /// strips the prefix before handing the remaining bytes to `f`
    /// (a convention local to this module, not the general envelope wire
    /// format in `crate::wire`, since collection addressing is a layer
    /// above plain handler dispatch).
    pub fn register_method(&self, f: impl Fn(&mut Vec<u8>, &Message) + 'static) -> HandlerId {
        let vc = self.vc.clone();
        let pool = self.pool.clone();
        self.registry.register(
            HandlerKind::CollectionMethod,
            move |msg: &Message| {
                let payload = msg.payload();
                if payload.len() < 8 {
                    return;
                }
                let id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                let args = Message::from_bytes(&pool, msg.envelope().clone(), &payload[8..]);
                let _ = vc.with_state_mut(id, |state| f(state, &args));
            },
            None,
        )
    }

    /// Build the payload for a call to element `id`'s registered method:
    /// the 8-byte id prefix followed by `args`.
    pub fn encode_call(id: EntityId, args: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + args.len());
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(args);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocationConfig;
    use std::cell::Cell;

    #[test]
    fn create_then_lookup_round_trips_state() {
        let loc = LocationManager::new(RankId::new(0), 2, LocationConfig::default());
        let vc = VirtualContextManager::new(loc);
        vc.create(7, vec![1, 2, 3]).unwrap();
        assert_eq!(vc.state(7).unwrap(), vec![1, 2, 3]);
        assert!(matches!(vc.create(7, vec![]), Err(VcError::AlreadyExists(7))));
    }

    #[test]
    fn migration_removes_locally_and_reports_home() {
        let loc = LocationManager::new(RankId::new(0), 2, LocationConfig::default());
        let vc = VirtualContextManager::new(loc);
        vc.create(0, vec![9]).unwrap(); // round_robin_map(0, 2) = rank 0, home here
        let (state, home) = vc.begin_migration(0, RankId::new(1)).unwrap();
        assert_eq!(state, vec![9]);
        assert_eq!(home, RankId::new(0));
        assert!(!vc.contains(0));
    }

    #[test]
    fn materialize_arrived_overwrites_stale_copy() {
        let loc = LocationManager::new(RankId::new(1), 2, LocationConfig::default());
        let vc = VirtualContextManager::new(loc);
        vc.materialize_arrived(0, vec![5]);
        assert_eq!(vc.state(0).unwrap(), vec![5]);
        vc.materialize_arrived(0, vec![6]);
        assert_eq!(vc.state(0).unwrap(), vec![6]);
    }

    #[test]
    fn registered_method_dispatches_through_registry_with_prefix_stripped() {
        let loc = LocationManager::new(RankId::new(0), 1, LocationConfig::default());
        let vc = VirtualContextManager::new(loc);
        vc.create(3, vec![0]).unwrap();
        let registry = Registry::new(RankId::new(0));
        let pool = crate::pool::Pool::new(crate::config::PoolConfig::default());
        let collection = CollectionManager::new(RankId::new(0), 1, vc.clone(), registry.clone(), pool.clone());
        let seen = Rc::new(Cell::new(0u8));
        let seen2 = seen.clone();
        let handler = collection.register_method(move |state, msg| {
            state[0] = msg.payload()[0];
            seen2.set(msg.payload()[0]);
        });

        let payload = CollectionManager::encode_call(3, &[42]);
        let env = crate::envelope::Envelope::point_to_point(RankId::new(0), handler);
        let msg = Message::from_bytes(&pool, env, &payload);
        let f = registry.get(handler, None).unwrap();
        f(&msg);

        assert_eq!(seen.get(), 42);
        assert_eq!(vc.state(3).unwrap(), vec![42]);
    }
}
