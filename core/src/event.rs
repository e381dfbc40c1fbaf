//! Event system (spec §3 "Event", §4.3).
//!
//! Every event is identified by `(rank, sequence)` and carries a
//! completion predicate plus a FIFO list of actions to run once the
//! predicate holds. The predicate is generalized to a boxed closure so
//! [`EventSystem`] itself never needs to know about the transport: the
//! `ActiveMessenger` supplies a closure that polls a transport request for
//! `TransportEvent`s, and `ParentEvent` is checked against this system's
//! own record of which ids have already triggered.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crate::config::EventConfig;
use crate::types::{RankId, SequenceId};

/// `(rank, sequence)` identifier of an event (spec §3 "Event").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub RankId, pub SequenceId);

impl EventId {
    /// The rank that created (and owns) this event.
    pub fn owner_node(self) -> RankId {
        self.0
    }
}

pub type Action = Box<dyn FnOnce()>;

enum Completion {
    /// Ready immediately (spec §4.3 `NormalEvent`).
    Normal,
    /// Ready when the wrapped predicate returns `true` (spec §4.3
    /// `TransportEvent`; the predicate is a closure over a transport
    /// request rather than a concrete transport type).
    Predicate(Box<dyn FnMut() -> bool>),
    /// Ready when every listed child event has already triggered (spec
    /// §4.3 `ParentEvent`).
    Parent(Vec<EventId>),
}

struct EventRecord {
    completion: Completion,
    actions: VecDeque<Action>,
}

struct EventSystemInner {
    this_rank: RankId,
    next_sequence: SequenceId,
    pending: std::collections::HashMap<EventId, EventRecord>,
    /// Ids that have triggered and been destroyed, kept around only so a
    /// `ParentEvent` created after a child already fired still sees it as
    /// done (spec §4.3: events are "destroyed after actions run").
    triggered: HashSet<EventId>,
    config: EventConfig,
}

/// Per-rank tracker of asynchronous completions (spec §4.3). Singleton
/// per rank, like every other core component (spec §5).
#[derive(Clone)]
pub struct EventSystem {
    inner: Rc<RefCell<EventSystemInner>>,
}

impl EventSystem {
    pub fn new(this_rank: RankId, config: EventConfig) -> Self {
        EventSystem {
            inner: Rc::new(RefCell::new(EventSystemInner {
                this_rank,
                next_sequence: 0,
                pending: std::collections::HashMap::new(),
                triggered: HashSet::new(),
                config,
            })),
        }
    }

    fn allocate_id(&self) -> EventId {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_sequence;
        inner.next_sequence += 1;
        EventId(inner.this_rank, seq)
    }

    /// Create an event that is ready as soon as it is tested (spec §4.3
    /// `NormalEvent`).
    pub fn create_normal(&self) -> EventId {
        let id = self.allocate_id();
        self.inner.borrow_mut().pending.insert(
            id,
            EventRecord {
                completion: Completion::Normal,
                actions: VecDeque::new(),
            },
        );
        id
    }

    /// Create an event whose readiness is governed by `predicate` (spec
    /// §4.3 `TransportEvent`).
    pub fn create_transport(&self, predicate: impl FnMut() -> bool + 'static) -> EventId {
        let id = self.allocate_id();
        self.inner.borrow_mut().pending.insert(
            id,
            EventRecord {
                completion: Completion::Predicate(Box::new(predicate)),
                actions: VecDeque::new(),
            },
        );
        id
    }

    /// Create an event that becomes ready once every id in `children` has
    /// triggered (spec §4.3 `ParentEvent`).
    pub fn create_parent(&self, children: Vec<EventId>) -> EventId {
        let id = self.allocate_id();
        self.inner.borrow_mut().pending.insert(
            id,
            EventRecord {
                completion: Completion::Parent(children),
                actions: VecDeque::new(),
            },
        );
        id
    }

    /// Attach an action to run when `id` transitions to triggered. If
    /// `id` has already triggered, the action runs immediately (there is
    /// nothing left to wait for).
    pub fn attach_action(&self, id: EventId, action: impl FnOnce() + 'static) {
        let mut inner = self.inner.borrow_mut();
        if let Some(record) = inner.pending.get_mut(&id) {
            record.actions.push_back(Box::new(action));
            return;
        }
        drop(inner);
        action();
    }

    fn is_ready(completion: &mut Completion, triggered: &HashSet<EventId>) -> bool {
        match completion {
            Completion::Normal => true,
            Completion::Predicate(pred) => pred(),
            Completion::Parent(children) => children.iter().all(|c| triggered.contains(c)),
        }
    }

    /// Test up to `max_tested_per_tick` pending events; for each that is
    /// ready, run its actions in FIFO order and destroy it (spec §4.3
    /// "Progress"). Returns the ids that triggered this tick.
    pub fn progress(&self) -> Vec<EventId> {
        let budget = self.inner.borrow().config.max_tested_per_tick;
        let candidates: Vec<EventId> = self
            .inner
            .borrow()
            .pending
            .keys()
            .copied()
            .take(budget)
            .collect();

        let mut triggered_now = Vec::new();
        for id in candidates {
            let ready = {
                let mut inner = self.inner.borrow_mut();
                let EventSystemInner {
                    pending, triggered, ..
                } = &mut *inner;
                match pending.get_mut(&id) {
                    Some(record) => Self::is_ready(&mut record.completion, triggered),
                    None => false,
                }
            };
            if !ready {
                continue;
            }
            let record = self.inner.borrow_mut().pending.remove(&id);
            if let Some(mut record) = record {
                while let Some(action) = record.actions.pop_front() {
                    action();
                }
            }
            self.inner.borrow_mut().triggered.insert(id);
            triggered_now.push(id);
        }
        triggered_now
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.borrow().pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }
}
