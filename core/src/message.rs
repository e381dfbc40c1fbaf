//! Messages: an [`Envelope`] plus a pool-allocated payload (spec §3
//! "Message").
//!
//! The spec's ref-counting ("messages are allocated from Pool and
//! released by ref-count decrement reaching zero") is naturally expressed
//! in Rust as an `Rc`: cloning a [`Message`] is exactly the "shared
//! message retained across an asynchronous send" case, and the payload
//! returns to the [`Pool`] it came from when the last clone drops. The
//! envelope's own [`Ownership`] bookkeeping (spec fidelity, §3 invariant
//! (b)) is kept alongside as metadata rather than relied on for memory
//! safety, which `Rc`'s strong count already guarantees.

use std::rc::Rc;

use crate::envelope::Envelope;
use crate::pool::{Pool, PoolBuf};

struct MessageData {
    envelope: Envelope,
    payload: PoolBuf,
}

/// A message in flight: envelope plus payload, reference-counted.
#[derive(Clone)]
pub struct Message {
    inner: Rc<MessageData>,
}

impl Message {
    pub fn new(envelope: Envelope, payload: PoolBuf) -> Self {
        Message {
            inner: Rc::new(MessageData { envelope, payload }),
        }
    }

    /// Allocate a payload from `pool` and copy `bytes` into it.
    pub fn from_bytes(pool: &Pool, envelope: Envelope, bytes: &[u8]) -> Self {
        Message::new(envelope, crate::pool::buf_from_bytes(pool, bytes))
    }

    pub fn envelope(&self) -> &Envelope {
        &self.inner.envelope
    }

    pub fn payload(&self) -> &[u8] {
        self.inner.payload.as_slice()
    }

    /// Number of live handles to this message (spec §3: "ref-count
    /// decrement reaching zero" releases the payload to the pool, which
    /// here just falls out of `Rc`'s drop glue).
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::handler_id::HandlerId;
    use crate::types::RankId;

    #[test]
    fn cloning_shares_the_payload() {
        let pool = Pool::new(PoolConfig::default());
        let handler = HandlerId::new_local(RankId::new(0), 1, false);
        let env = Envelope::point_to_point(RankId::new(1), handler);
        let msg = Message::from_bytes(&pool, env, b"payload");
        let msg2 = msg.clone();
        assert_eq!(msg.ref_count(), 2);
        assert_eq!(msg2.payload(), b"payload");
    }
}
