//! Scalar identifiers shared across the core (spec §3 "Data model").

pub use amt_transport::RankId;

/// A user- or system-assigned tag scoping message matching within a
/// handler, a sequencer wait, or an RDMA transfer.
pub type Tag = u64;

/// No tag was supplied.
pub const NO_TAG: Tag = 0;

/// Per spec §6, user tags start at a configurable offset; below that the
/// runtime reserves tags for its own bookkeeping (e.g. RDMA direct-buffer
/// channel setup).
pub const DEFAULT_USER_TAG_OFFSET: Tag = 1000;

/// Monotonic per-rank sequence number, used by the event system and by
/// collective/rooted epoch creation to keep per-rank identifiers unique.
pub type SequenceId = u64;
