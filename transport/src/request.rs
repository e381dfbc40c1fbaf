/// Opaque handle to a posted non-blocking send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) u64);

/// Outcome of polling a request whose payload isn't known at the call site
/// (kept separate from the `Option<Vec<u8>>` that `test_recv` returns
/// directly, for transports that want to report an in-between state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Pending,
    Complete,
}
