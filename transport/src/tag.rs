/// Transport-level tag, analogous to an MPI tag (`int` in the original).
pub type TransportTag = i32;

/// Reserved tag for handler-dispatched active messages (spec §6).
pub const ACTIVE_MSG_TAG: TransportTag = 1;

/// Reserved tag for raw RDMA payload transfers (spec §6).
pub const DATA_MSG_TAG: TransportTag = 2;
