//! An in-process transport connecting an arbitrary number of ranks, the way
//! naia's `LocalSocketPair` connects a client and server through shared
//! `Arc<Mutex<VecDeque<_>>>` queues instead of a real socket.
//!
//! Each [`LoopbackEndpoint`] is the `Transport` view a single rank's
//! runtime drives; [`LoopbackHub`] owns the shared queues every endpoint
//! was handed a clone of. Ranks are expected to run on separate threads
//! (or be driven cooperatively from one thread in tests) — `barrier` uses
//! a real `Condvar` rendezvous either way.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::rank::RankId;
use crate::request::RequestId;
use crate::tag::TransportTag;
use crate::ProbeResult;
use crate::Transport;

/// Messages larger than this are split into chunks on `isend` and queued
/// as chunks; `irecv`/`test_recv` reassemble them only once the message is
/// actually matched and pulled off the queue, exercising the transparent
/// chunking/reassembly spec §6 requires of the transport.
pub const LOOPBACK_MTU: usize = 4096;

#[derive(Debug, Clone)]
struct QueuedMessage {
    source: RankId,
    tag: TransportTag,
    chunks: Vec<Vec<u8>>,
}

impl QueuedMessage {
    fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}

struct BarrierState {
    generation: u64,
    arrived: u32,
}

struct ScatterState {
    chunks: Option<Vec<Vec<u8>>>,
    taken: Vec<bool>,
}

struct HubInner {
    world_size: u32,
    /// One inbound FIFO per destination rank.
    queues: Vec<VecDeque<QueuedMessage>>,
    next_request: u64,
    barrier: BarrierState,
}

/// Shared state backing every [`LoopbackEndpoint`] in one simulated job.
pub struct LoopbackHub {
    queues: Arc<Mutex<HubInner>>,
    barrier_cond: Arc<Condvar>,
    scatter: Arc<Mutex<Option<ScatterState>>>,
    scatter_cond: Arc<Condvar>,
}

impl LoopbackHub {
    pub fn new(world_size: u32) -> Self {
        let inner = HubInner {
            world_size,
            queues: (0..world_size).map(|_| VecDeque::new()).collect(),
            next_request: 0,
            barrier: BarrierState {
                generation: 0,
                arrived: 0,
            },
        };
        LoopbackHub {
            queues: Arc::new(Mutex::new(inner)),
            barrier_cond: Arc::new(Condvar::new()),
            scatter: Arc::new(Mutex::new(None)),
            scatter_cond: Arc::new(Condvar::new()),
        }
    }

    /// Build the [`LoopbackEndpoint`] for `rank`. Call once per rank.
    pub fn endpoint(&self, rank: RankId) -> LoopbackEndpoint {
        assert!(
            rank.as_u32() < self.world_size(),
            "rank {rank} out of range for a {}-rank loopback hub",
            self.world_size()
        );
        LoopbackEndpoint {
            this_rank: rank,
            hub: self.queues.clone(),
            barrier_cond: self.barrier_cond.clone(),
            scatter: self.scatter.clone(),
            scatter_cond: self.scatter_cond.clone(),
            completed_sends: std::collections::HashSet::new(),
            pending_recvs: Vec::new(),
        }
    }

    pub fn world_size(&self) -> u32 {
        self.queues.lock().unwrap().world_size
    }
}

fn chunk_bytes(bytes: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    if bytes.len() <= mtu {
        return vec![bytes.to_vec()];
    }
    bytes.chunks(mtu).map(|c| c.to_vec()).collect()
}

fn reassemble(chunks: Vec<Vec<u8>>) -> Vec<u8> {
    chunks.into_iter().flatten().collect()
}

enum PendingRecv {
    Waiting { source: RankId, tag: TransportTag },
    Done(Vec<u8>),
}

/// The `Transport` a single rank drives against a [`LoopbackHub`].
pub struct LoopbackEndpoint {
    this_rank: RankId,
    hub: Arc<Mutex<HubInner>>,
    barrier_cond: Arc<Condvar>,
    scatter: Arc<Mutex<Option<ScatterState>>>,
    scatter_cond: Arc<Condvar>,
    completed_sends: std::collections::HashSet<u64>,
    pending_recvs: Vec<(u64, PendingRecv)>,
}

impl LoopbackEndpoint {
    fn next_request_id(&self, inner: &mut HubInner) -> u64 {
        let id = inner.next_request;
        inner.next_request += 1;
        id
    }
}

impl Transport for LoopbackEndpoint {
    fn this_rank(&self) -> RankId {
        self.this_rank
    }

    fn world_size(&self) -> u32 {
        self.hub.lock().unwrap().world_size
    }

    fn isend(&mut self, dest: RankId, tag: TransportTag, bytes: Vec<u8>) -> RequestId {
        let mut inner = self.hub.lock().unwrap();
        let id = self.next_request_id(&mut inner);
        inner.queues[dest.as_u32() as usize].push_back(QueuedMessage {
            source: self.this_rank,
            tag,
            chunks: chunk_bytes(&bytes, LOOPBACK_MTU),
        });
        drop(inner);
        self.completed_sends.insert(id);
        RequestId(id)
    }

    fn iprobe(&mut self) -> Option<ProbeResult> {
        let inner = self.hub.lock().unwrap();
        inner.queues[self.this_rank.as_u32() as usize]
            .front()
            .map(|m| ProbeResult {
                source: m.source,
                tag: m.tag,
                len: m.len(),
            })
    }

    fn irecv(&mut self, source: RankId, tag: TransportTag) -> RequestId {
        let mut inner = self.hub.lock().unwrap();
        let id = self.next_request_id(&mut inner);
        let queue = &mut inner.queues[self.this_rank.as_u32() as usize];
        let pos = queue
            .iter()
            .position(|m| m.source == source && m.tag == tag);
        let state = match pos {
            Some(idx) => PendingRecv::Done(reassemble(queue.remove(idx).unwrap().chunks)),
            None => PendingRecv::Waiting { source, tag },
        };
        drop(inner);
        self.pending_recvs.push((id, state));
        RequestId(id)
    }

    fn test_send(&mut self, req: RequestId) -> bool {
        self.completed_sends.contains(&req.0)
    }

    fn test_recv(&mut self, req: RequestId) -> Option<Vec<u8>> {
        let pos = self.pending_recvs.iter().position(|(id, _)| *id == req.0)?;
        // Re-check the queue in case the match was posted before arrival.
        {
            let mut inner = self.hub.lock().unwrap();
            if let PendingRecv::Waiting { source, tag } = self.pending_recvs[pos].1 {
                let queue = &mut inner.queues[self.this_rank.as_u32() as usize];
                if let Some(idx) = queue.iter().position(|m| m.source == source && m.tag == tag) {
                    self.pending_recvs[pos].1 =
                        PendingRecv::Done(reassemble(queue.remove(idx).unwrap().chunks));
                }
            }
        }
        match &self.pending_recvs[pos].1 {
            PendingRecv::Done(_) => {
                let (_, state) = self.pending_recvs.remove(pos);
                match state {
                    PendingRecv::Done(bytes) => Some(bytes),
                    PendingRecv::Waiting { .. } => unreachable!(),
                }
            }
            PendingRecv::Waiting { .. } => None,
        }
    }

    fn barrier(&mut self) {
        let mut inner = self.hub.lock().unwrap();
        let my_gen = inner.barrier.generation;
        inner.barrier.arrived += 1;
        if inner.barrier.arrived == inner.world_size {
            inner.barrier.arrived = 0;
            inner.barrier.generation += 1;
            self.barrier_cond.notify_all();
        } else {
            while inner.barrier.generation == my_gen {
                inner = self.barrier_cond.wait(inner).unwrap();
            }
        }
    }

    fn scatter(&mut self, root: RankId, data: Option<Vec<Vec<u8>>>) -> Vec<u8> {
        let world_size = self.world_size() as usize;
        let mut guard = self.scatter.lock().unwrap();
        if guard.is_none() {
            *guard = Some(ScatterState {
                chunks: if self.this_rank == root { data } else { None },
                taken: vec![false; world_size],
            });
        } else if self.this_rank == root {
            guard.as_mut().unwrap().chunks = data;
            self.scatter_cond.notify_all();
        }

        loop {
            let ready = guard.as_ref().map(|s| s.chunks.is_some()).unwrap_or(false);
            if !ready {
                guard = self.scatter_cond.wait(guard).unwrap();
                continue;
            }
            let state = guard.as_mut().unwrap();
            let chunks = state.chunks.as_ref().unwrap();
            let mine = chunks[self.this_rank.as_u32() as usize].clone();
            state.taken[self.this_rank.as_u32() as usize] = true;
            let all_taken = state.taken.iter().all(|t| *t);
            if all_taken {
                *guard = None;
                self.scatter_cond.notify_all();
            }
            return mine;
        }
    }
}
