//! Barrier/Collective (SPEC_FULL §3.10, grounded in
//! `original_source/barrier.h` + `tree.h`): named and unnamed tree
//! barriers, plus tree reductions parameterized by a commutative op.
//!
//! Shares [`crate::topology::Tree`] with the termination detector's wave
//! algorithm (SPEC_FULL §2: "the same structure the wave termination
//! algorithm needs"), but runs its own up-sweep/down-sweep rather than
//! riding on a collective epoch — a barrier must still complete even when
//! no application epoch happens to be open. As with termination/location/
//! rdma, the protocol steps that require sending bytes are surfaced as
//! [`BarrierAction`] values for the runtime's wiring to execute (spec §9
//! design note).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::topology::Tree;
use crate::types::RankId;

/// Identifies one barrier or reduction instance. Named barriers (spec:
/// "named and unnamed tree barriers") share this same id space; an
/// unnamed barrier just uses the next sequence number.
pub type BarrierId = u64;

/// Commutative reduction operator (spec §2 "reductions parameterized by a
/// commutative-op enum"). Operates over `i64` lanes, which covers the
/// common counter/accumulator reductions without pulling in a generic
/// numeric trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    Product,
    BitAnd,
    BitOr,
    BitXor,
}

impl ReduceOp {
    fn identity(self) -> i64 {
        match self {
            ReduceOp::Sum | ReduceOp::BitOr | ReduceOp::BitXor => 0,
            ReduceOp::Product => 1,
            ReduceOp::Max => i64::MIN,
            ReduceOp::Min => i64::MAX,
            ReduceOp::BitAnd => -1,
        }
    }

    fn combine(self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
            ReduceOp::Product => a * b,
            ReduceOp::BitAnd => a & b,
            ReduceOp::BitOr => a | b,
            ReduceOp::BitXor => a ^ b,
        }
    }
}

/// A protocol step the barrier/reduction owner needs the messenger to
/// carry out (spec §9's action-value pattern, same as [`crate::termination::TermAction`]).
#[derive(Debug)]
pub enum BarrierAction {
    /// Up-sweep: tell `to` (this rank's tree parent) that this rank's
    /// whole subtree has arrived, carrying the folded reduction value if
    /// this is a reduction rather than a plain barrier.
    SendArrive { id: BarrierId, to: RankId, value: Option<i64> },
    /// Down-sweep: forward the release (and, for a reduction, the final
    /// folded value) to `to`, one of this rank's tree children.
    SendRelease { id: BarrierId, to: RankId, value: Option<i64> },
    /// This rank has been released; its registered continuations have
    /// already run.
    Released { id: BarrierId, value: Option<i64> },
}

struct Instance {
    tree: Tree,
    op: Option<ReduceOp>,
    self_arrived: bool,
    self_value: i64,
    arrived_children: HashSet<RankId>,
    folded: i64,
    released: bool,
    actions: Vec<Box<dyn FnOnce(Option<i64>)>>,
}

impl Instance {
    fn new(tree: Tree, op: Option<ReduceOp>) -> Self {
        let folded = op.map(ReduceOp::identity).unwrap_or(0);
        Instance {
            tree,
            op,
            self_arrived: false,
            self_value: folded,
            arrived_children: HashSet::new(),
            folded,
            released: false,
            actions: Vec::new(),
        }
    }

    fn all_arrived(&self) -> bool {
        self.self_arrived && self.arrived_children.len() as u32 == self.tree.num_children()
    }

    fn fold_in(&mut self, value: i64) {
        self.folded = match self.op {
            Some(op) => op.combine(self.folded, value),
            None => self.folded,
        };
    }
}

struct BarrierInner {
    this_rank: RankId,
    world_size: u32,
    next_unnamed: BarrierId,
    instances: HashMap<BarrierId, Instance>,
}

/// Per-rank owner of every in-flight barrier/reduction on this rank (spec
/// §5: "no component blocks the progress loop except wait_barrier" — this
/// one resolves asynchronously via up/down sweeps instead).
#[derive(Clone)]
pub struct Barrier {
    inner: Rc<RefCell<BarrierInner>>,
}

impl Barrier {
    pub fn new(this_rank: RankId, world_size: u32) -> Self {
        Barrier {
            inner: Rc::new(RefCell::new(BarrierInner {
                this_rank,
                world_size,
                next_unnamed: 0,
                instances: HashMap::new(),
            })),
        }
    }

    fn ensure_instance(&self, inner: &mut BarrierInner, id: BarrierId, arity: u32, op: Option<ReduceOp>) {
        inner.instances.entry(id).or_insert_with(|| {
            let tree = Tree::new(RankId::new(0), inner.this_rank, inner.world_size, arity);
            Instance::new(tree, op)
        });
    }

    /// Allocate a fresh unnamed barrier id (spec: "named and unnamed tree
    /// barriers" — an unnamed barrier is just a named one whose name this
    /// rank generates for itself; every rank must call `barrier`/`reduce`
    /// the same number of times in the same order for the generated ids
    /// to line up across ranks, exactly as for collective handler
    /// registration).
    pub fn next_unnamed_id(&self) -> BarrierId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_unnamed;
        inner.next_unnamed += 1;
        id
    }

    /// This rank has reached barrier `id`. Returns the action to perform,
    /// if any (nothing if this rank still has unreported children).
    pub fn arrive(&self, id: BarrierId, arity: u32) -> Option<BarrierAction> {
        self.arrive_with_value(id, arity, None)
    }

    /// Contribute `value` to reduction `id` and mark this rank arrived.
    pub fn reduce(&self, id: BarrierId, arity: u32, op: ReduceOp, value: i64) -> Option<BarrierAction> {
        self.arrive_with_value(id, arity, Some((op, value)))
    }

    fn arrive_with_value(&self, id: BarrierId, arity: u32, op_value: Option<(ReduceOp, i64)>) -> Option<BarrierAction> {
        let mut inner = self.inner.borrow_mut();
        self.ensure_instance(&mut inner, id, arity, op_value.map(|(op, _)| op));
        let this_rank = inner.this_rank;
        let instance = inner.instances.get_mut(&id).unwrap();
        instance.self_arrived = true;
        if let Some((_, value)) = op_value {
            instance.self_value = value;
            instance.fold_in(value);
        }
        self.settle(&mut inner, id, this_rank)
    }

    /// Process an `Arrive` report from `child` (with its subtree's folded
    /// value, if this is a reduction).
    pub fn receive_arrive(&self, id: BarrierId, arity: u32, child: RankId, value: Option<i64>) -> Option<BarrierAction> {
        let mut inner = self.inner.borrow_mut();
        self.ensure_instance(&mut inner, id, arity, None);
        let this_rank = inner.this_rank;
        let instance = inner.instances.get_mut(&id).unwrap();
        instance.arrived_children.insert(child);
        if let Some(value) = value {
            instance.fold_in(value);
        }
        self.settle(&mut inner, id, this_rank)
    }

    fn settle(&self, inner: &mut BarrierInner, id: BarrierId, this_rank: RankId) -> Option<BarrierAction> {
        let instance = inner.instances.get_mut(&id).unwrap();
        if !instance.all_arrived() {
            return None;
        }
        if instance.tree.is_root() {
            let value = instance.op.map(|_| instance.folded);
            drop_released(instance);
            let children = instance.tree.children();
            if children.is_empty() {
                // No down-sweep will ever visit this rank to drain
                // `actions` (that only happens in `receive_release`), so
                // do it here instead: a solo root is its own down-sweep.
                let actions = std::mem::take(&mut instance.actions);
                for action in actions {
                    action(value);
                }
                return Some(BarrierAction::Released { id, value });
            }
            // The runtime fans `SendRelease` out to every child itself;
            // returning the first child's action here and the rest via
            // `release_fanout` keeps this function's return type uniform
            // with the non-root case.
            Some(BarrierAction::SendRelease {
                id,
                to: children[0],
                value,
            })
        } else {
            let parent = instance.tree.parent().unwrap_or(this_rank);
            let value = instance.op.map(|_| instance.folded);
            Some(BarrierAction::SendArrive { id, to: parent, value })
        }
    }

    /// Every child a root/interior rank must still send `SendRelease` to
    /// besides the one already returned by `arrive`/`receive_arrive`
    /// (spec's down-sweep; see [`Self::settle`]'s doc comment).
    pub fn release_fanout(&self, id: BarrierId) -> Vec<RankId> {
        let inner = self.inner.borrow();
        match inner.instances.get(&id) {
            Some(instance) if instance.tree.is_root() => {
                let children = instance.tree.children();
                if children.len() > 1 {
                    children[1..].to_vec()
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Process the down-sweep release arriving from this rank's parent
    /// (or, on the root, the local release decided by `settle`). Fires
    /// every registered continuation and returns this rank's own children
    /// to forward the release to.
    pub fn receive_release(&self, id: BarrierId, value: Option<i64>) -> Vec<RankId> {
        let (children, actions) = {
            let mut inner = self.inner.borrow_mut();
            let Some(instance) = inner.instances.get_mut(&id) else {
                return Vec::new();
            };
            instance.released = true;
            let actions = std::mem::take(&mut instance.actions);
            (instance.tree.children(), actions)
        };
        for action in actions {
            action(value);
        }
        children
    }

    /// Register a continuation to run once barrier/reduction `id`
    /// releases, receiving the folded value (`None` for a plain barrier).
    /// Runs immediately if already released (spec's `barrier_then`).
    pub fn on_released(&self, id: BarrierId, arity: u32, action: impl FnOnce(Option<i64>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        self.ensure_instance(&mut inner, id, arity, None);
        let instance = inner.instances.get_mut(&id).unwrap();
        if instance.released {
            let value = instance.op.map(|_| instance.folded);
            drop(inner);
            action(value);
            return;
        }
        instance.actions.push(Box::new(action));
    }

    pub fn is_released(&self, id: BarrierId) -> bool {
        self.inner
            .borrow()
            .instances
            .get(&id)
            .map(|i| i.released)
            .unwrap_or(false)
    }
}

fn drop_released(instance: &mut Instance) {
    // Root fires its own release immediately in the same tick it detects
    // quiescence; this helper exists purely so `settle` reads as "compute
    // the value, then release" without repeating the released=true write.
    instance.released = true;
}
