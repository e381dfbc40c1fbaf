//! Byte-oriented message-passing transport.
//!
//! This crate plays the role naia's `naia-*-socket` crates play for the
//! client/server split: a thin trait the core depends on, plus a concrete
//! implementation usable without any real network (naia's test crate wires
//! client and server through an in-process socket pair; this crate's
//! [`loopback::LoopbackHub`] wires an arbitrary number of ranks the same
//! way).
//!
//! Per spec §6, the transport is required to:
//! - support non-blocking send/receive matched by `(sender, tag)`,
//! - support a probe-any operation,
//! - support `barrier` and `scatter` collectives,
//! - report collective process size/rank,
//! - deliver messages FIFO per `(sender, tag)`,
//! - transparently chunk and reassemble messages larger than its threshold.

mod error;
mod loopback;
mod rank;
mod request;
mod tag;

pub use error::{Result, TransportError};
pub use loopback::{LoopbackEndpoint, LoopbackHub};
pub use rank::RankId;
pub use request::{RequestId, TransportStatus};
pub use tag::{TransportTag, ACTIVE_MSG_TAG, DATA_MSG_TAG};

/// A single incoming message discovered by [`Transport::iprobe`], not yet
/// received into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub source: RankId,
    pub tag: TransportTag,
    pub len: usize,
}

/// The byte-oriented, non-blocking transport the active-messaging core is
/// built on. Implementations are expected to be single-threaded and driven
/// entirely by polling (`test`/`iprobe`) from the owning rank's progress
/// loop — matching §5's "single-threaded cooperative per rank" model.
pub trait Transport {
    /// This process's rank in the job.
    fn this_rank(&self) -> RankId;

    /// Total number of ranks in the job.
    fn world_size(&self) -> u32;

    /// Post a non-blocking send of `bytes` to `dest` under `tag`. Returns a
    /// request id to be polled with [`Transport::test_send`].
    fn isend(&mut self, dest: RankId, tag: TransportTag, bytes: Vec<u8>) -> RequestId;

    /// Probe for any message available to be received, without consuming
    /// it. Returns `None` if nothing has arrived yet.
    fn iprobe(&mut self) -> Option<ProbeResult>;

    /// Post a non-blocking receive matching `(source, tag)`. The caller is
    /// expected to have just seen a matching [`ProbeResult`].
    fn irecv(&mut self, source: RankId, tag: TransportTag) -> RequestId;

    /// Poll a previously posted send request.
    fn test_send(&mut self, req: RequestId) -> bool;

    /// Poll a previously posted receive request. Returns the received
    /// bytes once complete; `None` while still pending.
    fn test_recv(&mut self, req: RequestId) -> Option<Vec<u8>>;

    /// Block this rank until every rank has called `barrier`.
    ///
    /// The active-messaging core never calls this directly on the hot
    /// path — it is the primitive `wait_barrier` (spec §5) ultimately rests
    /// on for a *transport-level* rendezvous distinct from the tree-based
    /// `Barrier` component, which is built out of ordinary sends.
    fn barrier(&mut self);

    /// Scatter `root`'s `data` (one chunk per rank, `data[this_rank]` is
    /// this rank's share) to every rank. On non-root ranks `data` is
    /// ignored; every rank receives its chunk as the return value.
    fn scatter(&mut self, root: RankId, data: Option<Vec<Vec<u8>>>) -> Vec<u8>;
}
