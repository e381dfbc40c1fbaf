//! Handler registry (spec §4.1).
//!
//! Handler records are discriminated by a [`HandlerKind`] tag, matching
//! the original's "free-function pointer, functor instance, member-fn,
//! user-closure, map-function, RDMA get/put-fn" enumeration (spec §3
//! "Handler record"), but dispatch itself is uniform: every record wraps
//! an `Rc<dyn Fn(&Message)>`, since the progress loop (single-threaded,
//! §5) never needs `Send`/`Sync`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::RegistryError;
use crate::handler_id::HandlerId;
use crate::message::Message;
use crate::types::{RankId, Tag};

/// Which original C++ construct a handler record stands in for. Metadata
/// only — dispatch does not branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    FreeFunction,
    Functor,
    CollectionMethod,
    Closure,
    MapFunction,
    RdmaGet,
    RdmaPut,
}

pub type HandlerFn = Rc<dyn Fn(&Message)>;

#[derive(Clone)]
struct HandlerRecord {
    kind: HandlerKind,
    func: HandlerFn,
}

struct RegistryInner {
    this_rank: RankId,
    /// Untagged handlers.
    untagged: HashMap<HandlerId, HandlerRecord>,
    /// Tagged sub-map, consulted before `untagged` on a `get` (spec §4.1:
    /// "when set, the registry stores a (id, tag)->fn sub-map consulted
    /// first").
    tagged: HashMap<(HandlerId, Tag), HandlerRecord>,
    /// Next rank-local identifier to hand out.
    next_local_id: u32,
    /// Next collectively-registered identifier; must advance identically
    /// on every rank (spec §4.1, P8).
    next_collective_id: u32,
    /// Whether `register_collective` may still be called. The embedding
    /// runtime closes this window after its initialization phase (spec
    /// §4.1: "Fails if invoked after initialization window").
    collective_window_open: bool,
    /// Rolling hash of the sequence of collective registrations on this
    /// rank. See DESIGN.md for how the runtime uses this to detect
    /// cross-rank order mismatches at a collective checkpoint (spec's
    /// Open Question: no canonical detection mechanism is specified).
    collective_checksum: u64,
}

/// Resolves handler ids to callable records (spec §4.1).
#[derive(Clone)]
pub struct Registry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl Registry {
    pub fn new(this_rank: RankId) -> Self {
        Registry {
            inner: Rc::new(RefCell::new(RegistryInner {
                this_rank,
                untagged: HashMap::new(),
                tagged: HashMap::new(),
                next_local_id: 0,
                next_collective_id: 0,
                collective_window_open: true,
                collective_checksum: 0,
            })),
        }
    }

    /// Rank-local registration (spec §4.1): the new id is stamped with
    /// this rank's home-node bits, so senders elsewhere can address it.
    pub fn register(
        &self,
        kind: HandlerKind,
        func: impl Fn(&Message) + 'static,
        tag: Option<Tag>,
    ) -> HandlerId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_local_id;
        inner.next_local_id += 1;
        let handler_id = HandlerId::new_local(inner.this_rank, id, false);
        let record = HandlerRecord {
            kind,
            func: Rc::new(func),
        };
        match tag {
            Some(tag) => {
                inner.tagged.insert((handler_id, tag), record);
            }
            None => {
                inner.untagged.insert(handler_id, record);
            }
        }
        handler_id
    }

    /// Collective registration (spec §4.1): every rank must call this in
    /// the same source order so the returned id is identical everywhere.
    /// No home-node stamp is recorded.
    pub fn register_collective(
        &self,
        kind: HandlerKind,
        func: impl Fn(&Message) + 'static,
    ) -> Result<HandlerId, RegistryError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.collective_window_open {
            return Err(RegistryError::CollectiveWindowClosed);
        }
        let id = inner.next_collective_id;
        inner.next_collective_id += 1;
        // FNV-1a-style rolling hash; cheap and stable across ranks given
        // identical call order.
        inner.collective_checksum =
            (inner.collective_checksum ^ (id as u64)).wrapping_mul(0x100_0000_01b3);
        let handler_id = HandlerId::new_collective(id);
        let record = HandlerRecord {
            kind,
            func: Rc::new(func),
        };
        inner.untagged.insert(handler_id, record);
        Ok(handler_id)
    }

    /// Close the collective-registration window (called by the runtime
    /// once initialization completes).
    pub fn close_collective_window(&self) {
        self.inner.borrow_mut().collective_window_open = false;
    }

    /// Rolling checksum of this rank's collective registration sequence,
    /// for comparison against other ranks' checksums via a reduction
    /// (spec §4.1: "Fails ... in differing order").
    pub fn collective_checksum(&self) -> u64 {
        self.inner.borrow().collective_checksum
    }

    pub fn swap(
        &self,
        id: HandlerId,
        kind: HandlerKind,
        func: impl Fn(&Message) + 'static,
        tag: Option<Tag>,
    ) {
        let mut inner = self.inner.borrow_mut();
        let record = HandlerRecord {
            kind,
            func: Rc::new(func),
        };
        match tag {
            Some(tag) => {
                inner.tagged.insert((id, tag), record);
            }
            None => {
                inner.untagged.insert(id, record);
            }
        }
    }

    pub fn unregister(&self, id: HandlerId, tag: Option<Tag>) {
        let mut inner = self.inner.borrow_mut();
        match tag {
            Some(tag) => {
                inner.tagged.remove(&(id, tag));
            }
            None => {
                inner.untagged.remove(&id);
            }
        }
    }

    /// Resolve `id`, preferring a tagged match over the untagged
    /// fallback (spec §4.1).
    pub fn get(&self, id: HandlerId, tag: Option<Tag>) -> Result<HandlerFn, RegistryError> {
        let inner = self.inner.borrow();
        if let Some(tag) = tag {
            if let Some(record) = inner.tagged.get(&(id, tag)) {
                return Ok(record.func.clone());
            }
        }
        inner
            .untagged
            .get(&id)
            .map(|record| record.func.clone())
            .ok_or(RegistryError::UnknownHandler(id))
    }

    pub fn is_registered(&self, id: HandlerId, tag: Option<Tag>) -> bool {
        self.get(id, tag).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::envelope::Envelope;
    use crate::pool::Pool;
    use std::cell::Cell;
    use std::rc::Rc;

    fn dummy_message(pool: &Pool, handler: HandlerId) -> Message {
        let env = Envelope::point_to_point(RankId::new(0), handler);
        Message::from_bytes(pool, env, b"x")
    }

    #[test]
    fn local_registration_resolves() {
        let reg = Registry::new(RankId::new(0));
        let pool = Pool::new(PoolConfig::default());
        let hit = Rc::new(Cell::new(false));
        let hit2 = hit.clone();
        let id = reg.register(HandlerKind::Closure, move |_m| hit2.set(true), None);
        let f = reg.get(id, None).unwrap();
        f(&dummy_message(&pool, id));
        assert!(hit.get());
    }

    #[test]
    fn tagged_preferred_over_untagged() {
        let reg = Registry::new(RankId::new(0));
        let which = Rc::new(Cell::new(0u8));
        let w1 = which.clone();
        let w2 = which.clone();
        let id = reg.register(HandlerKind::Closure, move |_| w1.set(1), None);
        reg.swap(id, HandlerKind::Closure, move |_| w2.set(2), Some(7));
        let pool = Pool::new(PoolConfig::default());
        let f = reg.get(id, Some(7)).unwrap();
        f(&dummy_message(&pool, id));
        assert_eq!(which.get(), 2);

        let f = reg.get(id, Some(999)).unwrap();
        f(&dummy_message(&pool, id));
        assert_eq!(which.get(), 1);
    }

    #[test]
    fn unknown_handler_errors() {
        let reg = Registry::new(RankId::new(0));
        let id = HandlerId::new_local(RankId::new(0), 99, false);
        assert!(matches!(
            reg.get(id, None),
            Err(RegistryError::UnknownHandler(_))
        ));
    }

    #[test]
    fn collective_window_closes() {
        let reg = Registry::new(RankId::new(0));
        reg.close_collective_window();
        let result = reg.register_collective(HandlerKind::FreeFunction, |_| {});
        assert!(matches!(
            result,
            Err(RegistryError::CollectiveWindowClosed)
        ));
    }

    #[test]
    fn collective_ids_have_no_home_node() {
        let reg = Registry::new(RankId::new(3));
        let id = reg
            .register_collective(HandlerKind::FreeFunction, |_| {})
            .unwrap();
        assert_eq!(id.node(), None);
    }
}
