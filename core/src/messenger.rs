//! Active messenger (spec §4.4): handler registration, sized sends and
//! broadcasts, and the progress loop that drains the transport and
//! dispatches to handlers.
//!
//! Generic over `T: Transport` the same way naia's connection code is
//! generic over its socket abstraction: this crate never picks a
//! concrete transport, the embedding program (or `amt-test`/`amt-demo`)
//! does.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use amt_transport::{ProbeResult, RequestId, Transport, TransportTag, ACTIVE_MSG_TAG};

use crate::envelope::Envelope;
use crate::error::SendError;
use crate::event::{EventId, EventSystem};
use crate::handler_id::HandlerId;
use crate::location::{EntityId, LocationManager, RouteDecision};
use crate::message::Message;
use crate::pool::Pool;
use crate::registry::{HandlerFn, HandlerKind, Registry};
use crate::sequencer::Sequencer;
use crate::termination::TerminationDetector;
use crate::topology::Tree;
use crate::types::{RankId, Tag};
use crate::wire;

pub type DataContinuation = Box<dyn FnOnce(Vec<u8>)>;

struct HandlerContext {
    current_handler: Option<HandlerId>,
    current_node: Option<RankId>,
    current_callback: Option<HandlerId>,
    /// Rank the message currently being dispatched arrived from. Tracked
    /// separately from `current_node` (the message's addressed
    /// destination) because the two differ for a forwarded broadcast or
    /// an entity-routed message; the termination detector's DS algorithm
    /// needs the true sender to record its engagement parent correctly.
    current_source: Option<RankId>,
}

struct InProgressRecv {
    req: RequestId,
    source: RankId,
    tag: TransportTag,
}

struct MessengerInner<T: Transport> {
    transport: T,
    this_rank: RankId,
    world_size: u32,
    broadcast_arity: u32,
    recv_in_flight: Option<InProgressRecv>,
    /// Messages parked because their handler wasn't registered yet (spec
    /// §4.4 receive path step 2; spec §7 "Deferred delivery"), along with
    /// the rank each arrived from so redelivery can still report an
    /// accurate source.
    pending_handler_msgs: HashMap<HandlerId, Vec<(RankId, Vec<u8>)>>,
    /// Registered `recvData` continuations, keyed by (sender, tag).
    recv_data_waiters: HashMap<(RankId, TransportTag), DataContinuation>,
    /// Raw data payloads that arrived before a matching `recvData` was
    /// registered.
    parked_data: HashMap<(RankId, TransportTag), Vec<u8>>,
    ctx: HandlerContext,
}

/// Handler registration + send/broadcast/progress-loop dispatcher (spec
/// §4.4). One per rank, wired to the rank's singletons by [`crate::runtime::Runtime`].
#[derive(Clone)]
pub struct ActiveMessenger<T: Transport> {
    inner: Rc<RefCell<MessengerInner<T>>>,
    pool: Pool,
    registry: Registry,
    events: EventSystem,
    termination: TerminationDetector,
    sequencer: Sequencer,
    location: LocationManager,
}

impl<T: Transport + 'static> ActiveMessenger<T> {
    pub fn new(
        transport: T,
        pool: Pool,
        registry: Registry,
        events: EventSystem,
        termination: TerminationDetector,
        sequencer: Sequencer,
        location: LocationManager,
        broadcast_arity: u32,
    ) -> Self {
        let this_rank = transport.this_rank();
        let world_size = transport.world_size();
        ActiveMessenger {
            inner: Rc::new(RefCell::new(MessengerInner {
                transport,
                this_rank,
                world_size,
                broadcast_arity,
                recv_in_flight: None,
                pending_handler_msgs: HashMap::new(),
                recv_data_waiters: HashMap::new(),
                parked_data: HashMap::new(),
                ctx: HandlerContext {
                    current_handler: None,
                    current_node: None,
                    current_callback: None,
                    current_source: None,
                },
            })),
            pool,
            registry,
            events,
            termination,
            sequencer,
            location,
        }
    }

    pub fn this_rank(&self) -> RankId {
        self.inner.borrow().this_rank
    }

    pub fn world_size(&self) -> u32 {
        self.inner.borrow().world_size
    }

    /// The sequencer wired into this messenger's dispatch path (spec
    /// §4.8): every message is offered to it via `try_consume` before
    /// falling through to its resolved handler, so a sequence built
    /// through this same handle sees messages sent through this
    /// messenger in delivery order.
    pub fn sequencer(&self) -> Sequencer {
        self.sequencer.clone()
    }

    // ---- registration -------------------------------------------------

    pub fn register_handler(
        &self,
        kind: HandlerKind,
        f: impl Fn(&Message) + 'static,
        tag: Option<Tag>,
    ) -> HandlerId {
        self.registry.register(kind, f, tag)
    }

    pub fn register_collective(
        &self,
        kind: HandlerKind,
        f: impl Fn(&Message) + 'static,
    ) -> Result<HandlerId, crate::error::RegistryError> {
        self.registry.register_collective(kind, f)
    }

    // ---- handler-local context (spec §4.4) -----------------------------

    pub fn current_handler(&self) -> Option<HandlerId> {
        self.inner.borrow().ctx.current_handler
    }

    pub fn current_node(&self) -> Option<RankId> {
        self.inner.borrow().ctx.current_node
    }

    pub fn current_callback(&self) -> Option<HandlerId> {
        self.inner.borrow().ctx.current_callback
    }

    /// Rank the message currently being dispatched was received from.
    /// `None` outside of a handler invocation, or for a locally
    /// synthesized dispatch (a broadcast's own-copy delivery, an
    /// entity-routed message already local to this rank).
    pub fn current_source(&self) -> Option<RankId> {
        self.inner.borrow().ctx.current_source
    }

    // ---- send path (spec §4.4 "Send path") -----------------------------

    /// Point-to-point send. Returns an event that fires once the bytes
    /// have gone out and the message's ref count has dropped to zero.
    pub fn send(
        &self,
        dest: RankId,
        handler: HandlerId,
        bytes: &[u8],
        tag: Option<Tag>,
    ) -> Result<EventId, SendError> {
        if dest.is_uninitialized() || dest.as_u32() >= self.world_size() {
            return Err(SendError::InvalidDestination(dest));
        }
        let epoch = self.termination.current_epoch();
        let mut env = Envelope::point_to_point(dest, handler);
        if let Some(tag) = tag {
            env = env.with_tag(tag);
        }
        if !epoch.is_any() && !epoch.is_none() {
            env = env.with_epoch(epoch);
            self.termination.produce(epoch, 1);
            if epoch.is_rooted() {
                self.termination.note_ds_child(epoch, dest);
            }
        }
        let msg = Message::from_bytes(&self.pool, env, bytes);
        Ok(self.post_send(dest, msg))
    }

    /// Broadcast to every rank (spec §4.4): the sender forwards once to
    /// its own tree children rooted at itself, and each receiver forwards
    /// on to its own children in that same tree after dispatching
    /// locally. `skip_sender` matches "unless 'skip-sender' is requested
    /// at the call site".
    pub fn broadcast(
        &self,
        handler: HandlerId,
        bytes: &[u8],
        tag: Option<Tag>,
        skip_sender: bool,
    ) -> Vec<EventId> {
        let this_rank = self.this_rank();
        let epoch = self.termination.current_epoch();
        let mut env = Envelope::broadcast(this_rank, handler);
        if let Some(tag) = tag {
            env = env.with_tag(tag);
        }
        if !epoch.is_any() && !epoch.is_none() {
            env = env.with_epoch(epoch);
        }
        let tree = Tree::new(this_rank, this_rank, self.world_size(), self.broadcast_arity());
        let mut events = Vec::new();
        for child in tree.children() {
            if !epoch.is_any() && !epoch.is_none() {
                self.termination.produce(epoch, 1);
            }
            let msg = Message::from_bytes(&self.pool, env.clone_for_resend(child), bytes);
            events.push(self.post_send(child, msg));
        }
        if !skip_sender {
            self.dispatch_local(env, bytes);
        }
        events
    }

    fn broadcast_arity(&self) -> u32 {
        self.inner.borrow().broadcast_arity
    }

    /// Raw byte transfer used by RDMA (spec §4.4 `sendData`).
    pub fn send_data(&self, dest: RankId, tag: TransportTag, bytes: Vec<u8>) -> EventId {
        let inner_rc = self.inner.clone();
        let req = {
            let mut inner = self.inner.borrow_mut();
            inner.transport.isend(dest, tag, bytes)
        };
        self.events.create_transport(move || {
            inner_rc.borrow_mut().transport.test_send(req)
        })
    }

    /// Register a continuation to run when a matching byte transfer is
    /// complete (spec §4.4 `recvData`). If the bytes already arrived and
    /// were parked, runs immediately.
    pub fn recv_data(&self, sender: RankId, tag: TransportTag, continuation: impl FnOnce(Vec<u8>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        if let Some(bytes) = inner.parked_data.remove(&(sender, tag)) {
            drop(inner);
            continuation(bytes);
            return;
        }
        inner
            .recv_data_waiters
            .insert((sender, tag), Box::new(continuation));
    }

    fn post_send(&self, dest: RankId, msg: Message) -> EventId {
        let bytes = wire::encode(msg.envelope(), msg.payload());
        let req = {
            let mut inner = self.inner.borrow_mut();
            inner.transport.isend(dest, ACTIVE_MSG_TAG, bytes)
        };
        let inner_rc = self.inner.clone();
        let epoch = msg.envelope().epoch();
        let termination = self.termination.clone();
        let event = self
            .events
            .create_transport(move || inner_rc.borrow_mut().transport.test_send(req));
        self.events.attach_action(event, move || {
            let _ = &msg; // keeps the payload (and its ref count) alive until send completes
            if let Some(epoch) = epoch {
                termination.consume(epoch, 1);
            }
        });
        event
    }

    // ---- receive path (spec §4.4 "Receive path") -----------------------

    /// One iteration of the progress loop: probe the transport, drain any
    /// completed receive, dispatch to handlers, service pending events.
    /// The embedding program calls this in a loop (`run_scheduler`, spec
    /// §5) until its own termination condition holds.
    pub fn progress(&self) {
        self.poll_incoming();
        self.events.progress();
    }

    fn poll_incoming(&self) {
        loop {
            let probe: Option<ProbeResult> = {
                let mut inner = self.inner.borrow_mut();
                if inner.recv_in_flight.is_none() {
                    inner.transport.iprobe()
                } else {
                    None
                }
            };
            if let Some(probe) = probe {
                let mut inner = self.inner.borrow_mut();
                let req = inner.transport.irecv(probe.source, probe.tag);
                inner.recv_in_flight = Some(InProgressRecv {
                    req,
                    source: probe.source,
                    tag: probe.tag,
                });
            }

            let (completed, source, tag) = {
                let mut inner = self.inner.borrow_mut();
                let Some(in_flight) = &inner.recv_in_flight else {
                    return;
                };
                let req = in_flight.req;
                let source = in_flight.source;
                let tag = in_flight.tag;
                (inner.transport.test_recv(req), source, tag)
            };
            let Some(bytes) = completed else { return };
            self.inner.borrow_mut().recv_in_flight = None;

            if tag == ACTIVE_MSG_TAG {
                let (envelope, payload) = wire::decode(&bytes);
                self.deliver_active_message(source, envelope, payload);
            } else {
                self.handle_data_arrival(source, tag, bytes);
            }
        }
    }

    /// Deliver raw bytes to a waiting `recvData` continuation, or park
    /// them if none is registered yet (spec §4.4 receive path, raw-data
    /// variant).
    fn handle_data_arrival(&self, source: RankId, tag: TransportTag, bytes: Vec<u8>) {
        let waiter = self.inner.borrow_mut().recv_data_waiters.remove(&(source, tag));
        match waiter {
            Some(continuation) => continuation(bytes),
            None => {
                self.inner
                    .borrow_mut()
                    .parked_data
                    .insert((source, tag), bytes);
            }
        }
    }

    fn deliver_active_message(&self, source: RankId, envelope: Envelope, payload: Vec<u8>) {
        let handler = envelope.handler();
        if let Some(epoch) = envelope.epoch() {
            if epoch.is_rooted() {
                self.termination.on_rooted_receive(epoch, source);
            }
            self.termination.enter(epoch);
        }

        let resolved: Option<HandlerFn> = self.registry.get(handler, envelope.tag()).ok();
        match resolved {
            None => {
                self.inner
                    .borrow_mut()
                    .pending_handler_msgs
                    .entry(handler)
                    .or_default()
                    .push((source, wire::encode(&envelope, &payload)));
            }
            Some(func) => {
                let msg = Message::from_bytes(&self.pool, envelope.clone(), &payload);
                let consumed_by_sequencer =
                    self.sequencer.try_consume(handler, envelope.tag(), &msg);
                if !consumed_by_sequencer {
                    {
                        let mut inner = self.inner.borrow_mut();
                        inner.ctx.current_handler = Some(handler);
                        inner.ctx.current_node = Some(envelope.dest());
                        inner.ctx.current_source = Some(source);
                        inner.ctx.current_callback = if envelope.kind().contains(crate::envelope::EnvelopeKind::CALLBACK) {
                            Some(handler)
                        } else {
                            None
                        };
                    }
                    func(&msg);
                    let mut inner = self.inner.borrow_mut();
                    inner.ctx.current_handler = None;
                    inner.ctx.current_node = None;
                    inner.ctx.current_source = None;
                    inner.ctx.current_callback = None;
                }
                if envelope.is_broadcast() {
                    self.forward_broadcast(&envelope, msg.payload());
                }
            }
        }

        if let Some(epoch) = envelope.epoch() {
            self.termination.exit(epoch);
            self.termination.consume(epoch, 1);
        }
        self.redeliver_pending(handler);
    }

    fn forward_broadcast(&self, envelope: &Envelope, payload: &[u8]) {
        let root = envelope.broadcast_root().unwrap_or(self.this_rank());
        let tree = Tree::new(root, self.this_rank(), self.world_size(), self.broadcast_arity());
        for child in tree.children() {
            let msg = Message::from_bytes(&self.pool, envelope.clone_for_resend(child), payload);
            self.post_send(child, msg);
        }
    }

    fn dispatch_local(&self, envelope: Envelope, payload: &[u8]) {
        let handler = envelope.handler();
        if let Some(func) = self.registry.get(handler, envelope.tag()).ok() {
            let msg = Message::from_bytes(&self.pool, envelope, payload);
            func(&msg);
        }
    }

    fn redeliver_pending(&self, handler: HandlerId) {
        let parked = {
            let mut inner = self.inner.borrow_mut();
            inner.pending_handler_msgs.remove(&handler)
        };
        let Some(parked) = parked else { return };
        for (source, bytes) in parked {
            let (envelope, payload) = wire::decode(&bytes);
            self.deliver_active_message(source, envelope, payload);
        }
    }

    /// Handler ids with messages still parked on this rank (spec §7:
    /// reported as "unmatched handler" if still present at global
    /// termination).
    pub fn unmatched_handlers(&self) -> Vec<HandlerId> {
        self.inner
            .borrow()
            .pending_handler_msgs
            .keys()
            .copied()
            .collect()
    }

    // ---- location-addressed send (spec §4.5) ---------------------------

    /// Send to an entity by logical id, letting the location manager
    /// decide whether to deliver here or forward toward the owner. Only
    /// a single hop is attempted from the caller's side; a forwarding
    /// rank that itself lacks the entity is expected to call
    /// [`LocationManager::route`] again from its own `GET`/entity
    /// handler, the same split the location manager documents for every
    /// other caller.
    pub fn send_to_entity(
        &self,
        entity: EntityId,
        handler: HandlerId,
        bytes: &[u8],
        tag: Option<Tag>,
    ) -> Result<(), crate::error::LocationError> {
        match self.location.route(entity, 0)? {
            RouteDecision::DeliverLocally => {
                let env = Envelope::point_to_point(self.this_rank(), handler);
                let env = if let Some(tag) = tag { env.with_tag(tag) } else { env };
                self.dispatch_local(env, bytes);
                Ok(())
            }
            RouteDecision::Forward { to, .. } => {
                let env = Envelope::point_to_point(to, handler);
                let env = if let Some(tag) = tag { env.with_tag(tag) } else { env };
                let msg = Message::from_bytes(&self.pool, env, bytes);
                self.post_send(to, msg);
                Ok(())
            }
        }
    }
}
