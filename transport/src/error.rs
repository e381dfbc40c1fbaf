use thiserror::Error;

use crate::rank::RankId;

/// Errors a [`crate::Transport`] implementation can report.
///
/// These are transport-layer failures only; the core's own fatal-error
/// handling (double free, unregistered collective handler, etc.) lives in
/// `amt-core::error` and is deliberately a separate type, matching how the
/// teacher keeps connection-level errors (`ConnectionError`) apart from
/// higher-level protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("send to invalid rank {0}")]
    InvalidDestination(RankId),

    #[error("request handle {0} is unknown to this transport")]
    UnknownRequest(u64),

    #[error("collective operation called with mismatched participant count: expected {expected}, got {got}")]
    CollectiveMismatch { expected: u32, got: u32 },
}

pub type Result<T> = std::result::Result<T, TransportError>;
