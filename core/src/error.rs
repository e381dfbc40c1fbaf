//! Error types.
//!
//! Mirrors the teacher's pattern of one small `thiserror` enum per
//! subsystem (`shared/src/**/error.rs`) plus a crate-wide enum that
//! aggregates them with `#[from]`. Spec §7 additionally asks for a
//! structured fatal-error path distinct from ordinary `Result` errors —
//! [`FatalError`] plays that role and is never returned from a fallible
//! function; it is only ever handed to [`crate::runtime::Runtime::abort`].

use std::fmt;

use crate::types::RankId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("handler {0:?} is not registered")]
    UnknownHandler(crate::handler_id::HandlerId),
    #[error("collective registration of handler #{0} was called in a different order than on another rank")]
    CollectiveOrderMismatch(u32),
    #[error("collective registration window is closed; handlers must be registered during initialization")]
    CollectiveWindowClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("attempted to free a block that was already returned to the pool")]
    DoubleFree,
    #[error("requested allocation of {0} bytes exceeds the maximum supported size")]
    SizeTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("entity {0} exceeded the maximum routing hop count ({1})")]
    HopLimitExceeded(u64, u32),
    #[error("entity {0} is not registered with this location manager")]
    UnknownEntity(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RdmaError {
    #[error("rdma handle {0:?} is not registered")]
    UnknownHandle(crate::rdma::RdmaHandle),
    #[error("get/put of {requested} bytes at offset {offset} overruns the {region_len}-byte region")]
    OutOfBounds {
        offset: usize,
        requested: usize,
        region_len: usize,
    },
    #[error("channel already exists between this handle and the requested peer")]
    ChannelAlreadyExists,
    #[error("no channel exists between this handle and the requested peer")]
    ChannelNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminationError {
    #[error("epoch {0:?} consumed more than it produced, which is a protocol bug")]
    ConsumedExceedsProduced(crate::epoch::EpochId),
    #[error("epoch {0:?} is not active on this rank")]
    UnknownEpoch(crate::epoch::EpochId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("sequence {0} has no pending wait for (handler, tag) = {1:?}")]
    NoMatchingWait(u64, (crate::handler_id::HandlerId, crate::types::Tag)),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("send to invalid rank {0}")]
    InvalidDestination(RankId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VcError {
    #[error("entity {0} already exists on this rank")]
    AlreadyExists(u64),
    #[error("entity {0} is not materialized on this rank")]
    NotFound(u64),
}

/// Aggregate error returned by fallible core operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Location(#[from] LocationError),
    #[error(transparent)]
    Rdma(#[from] RdmaError),
    #[error(transparent)]
    Termination(#[from] TerminationError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Vc(#[from] VcError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// A structured diagnostic for a fatal protocol error (spec §7.1): the
/// runtime prints this, flushes trace/stats, and exits nonzero. It is
/// deliberately not a `std::error::Error` returned up a call stack —
/// fatal errors abort the rank instead of propagating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub rank: RankId,
    pub component: &'static str,
    pub code: &'static str,
    pub message: String,
    pub backtrace_hint: &'static str,
}

impl FatalError {
    pub fn new(
        rank: RankId,
        component: &'static str,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        FatalError {
            rank,
            component,
            code,
            message: message.into(),
            backtrace_hint: "set RUST_BACKTRACE=1 for a full backtrace",
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[fatal][{}][{}] {} ({})",
            self.rank, self.component, self.message, self.code
        )
    }
}

impl std::error::Error for FatalError {}
