//! Message envelope (spec §3 "Envelope").
//!
//! The original packs `type`/`dest`/`handler`/`ref` plus optional
//! `epoch`/`tag` into one POD header and leaves invariants (a)-(c) to
//! caller discipline. Here the flag bits become an explicit
//! [`EnvelopeKind`] bitset and the optional fields become real `Option`s,
//! so the invariants are enforced by the constructors instead of by
//! convention:
//! (a) at most one epoch — `Option<EpochId>`, structurally single-valued;
//! (b) `ref=unmanaged` iff the sender owns a single copy — [`Ownership`];
//! (c) the broadcast bit overrides `dest` — [`Envelope::broadcast`] is the
//!     only constructor that sets it, and it always forces
//!     `dest = RankId::UNINITIALIZED`.

use crate::epoch::EpochId;
use crate::handler_id::HandlerId;
use crate::types::{RankId, Tag};

/// A macro-free, header-only bitset generator used for [`EnvelopeKind`].
/// Kept minimal deliberately (spec §1: "no serialization library
/// internals" — this is the smallest hand-rolled bit-packing the Envelope
/// itself needs, not a general-purpose flags crate).
macro_rules! bitset {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            /// Reconstruct from a raw bit pattern, for the wire layer
            /// only (`crate::wire`).
            pub(crate) const fn from_bits(bits: $repr) -> Self {
                $name(bits)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut names = Vec::new();
                $(if self.contains($name::$variant) { names.push(stringify!($variant)); })*
                write!(f, "{}({:#04x})", names.join("|"), self.0)
            }
        }
    };
}

bitset! {
    /// Independent type bits, except `Broadcast` implies `Normal` (spec
    /// §3). Not implemented with the `bitflags` crate: the set is small,
    /// fixed, and local to this module.
    pub struct EnvelopeKind: u8 {
        const NORMAL = 0b0000_0001;
        const GET = 0b0000_0010;
        const PUT = 0b0000_0100;
        const TERM = 0b0000_1000;
        const BROADCAST = 0b0001_0000;
        const HAS_EPOCH = 0b0010_0000;
        const HAS_TAG = 0b0100_0000;
        const CALLBACK = 0b1000_0000;
    }
}

/// Whether the sender retains a single unshared copy of the message
/// (`ref = unmanaged`, spec §3) or the message is reference-counted and
/// may be retained by the runtime across an asynchronous send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Unmanaged,
    Shared { count: u32 },
}

/// Fixed-layout header prefixing every message (spec §3 "Envelope").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    kind: EnvelopeKind,
    dest: RankId,
    handler: HandlerId,
    ownership: Ownership,
    epoch: Option<EpochId>,
    tag: Option<Tag>,
    /// The rank that originated this broadcast, carried so every hop can
    /// re-derive its position in that rank's spanning tree (spec §4.4
    /// broadcast forwarding). `None` outside of broadcast envelopes.
    broadcast_root: Option<RankId>,
}

impl Envelope {
    /// A point-to-point, unmanaged (fire-and-forget) envelope.
    pub fn point_to_point(dest: RankId, handler: HandlerId) -> Self {
        Envelope {
            kind: EnvelopeKind::NORMAL,
            dest,
            handler,
            ownership: Ownership::Unmanaged,
            epoch: None,
            tag: None,
            broadcast_root: None,
        }
    }

    /// A broadcast envelope rooted at `origin` (spec §4.4: forwarding
    /// hops re-derive their place in `origin`'s spanning tree from this
    /// field). Per invariant (c), `dest` is forced to
    /// [`RankId::UNINITIALIZED`] regardless of any rank the caller might
    /// otherwise have supplied.
    pub fn broadcast(origin: RankId, handler: HandlerId) -> Self {
        Envelope {
            kind: EnvelopeKind::NORMAL | EnvelopeKind::BROADCAST,
            dest: RankId::UNINITIALIZED,
            handler,
            ownership: Ownership::Unmanaged,
            epoch: None,
            tag: None,
            broadcast_root: Some(origin),
        }
    }

    pub fn get(dest: RankId, handler: HandlerId) -> Self {
        Envelope {
            kind: EnvelopeKind::GET,
            dest,
            handler,
            ownership: Ownership::Unmanaged,
            epoch: None,
            tag: None,
            broadcast_root: None,
        }
    }

    pub fn put(dest: RankId, handler: HandlerId) -> Self {
        Envelope {
            kind: EnvelopeKind::PUT,
            dest,
            handler,
            ownership: Ownership::Unmanaged,
            epoch: None,
            tag: None,
            broadcast_root: None,
        }
    }

    pub fn term(dest: RankId, handler: HandlerId) -> Self {
        Envelope {
            kind: EnvelopeKind::TERM,
            dest,
            handler,
            ownership: Ownership::Unmanaged,
            epoch: None,
            tag: None,
            broadcast_root: None,
        }
    }

    #[must_use]
    pub fn with_epoch(mut self, epoch: EpochId) -> Self {
        self.kind |= EnvelopeKind::HAS_EPOCH;
        self.epoch = Some(epoch);
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.kind |= EnvelopeKind::HAS_TAG;
        self.tag = Some(tag);
        self
    }

    #[must_use]
    pub fn with_callback(mut self) -> Self {
        self.kind |= EnvelopeKind::CALLBACK;
        self
    }

    /// Mark this envelope as shared, starting its reference count at 1.
    #[must_use]
    pub fn share(mut self) -> Self {
        self.ownership = Ownership::Shared { count: 1 };
        self
    }

    /// Reconstruct the bare envelope (no ownership/epoch/tag/root) from
    /// its wire fields. For the wire layer only (`crate::wire`); every
    /// other caller goes through the named constructors above.
    pub(crate) fn from_parts(kind: EnvelopeKind, dest: RankId, handler: HandlerId) -> Self {
        Envelope {
            kind,
            dest,
            handler,
            ownership: Ownership::Unmanaged,
            epoch: None,
            tag: None,
            broadcast_root: None,
        }
    }

    /// Set the ownership to `Shared { count }` directly. For the wire
    /// layer only, reconstructing a decoded envelope's ref count.
    #[must_use]
    pub(crate) fn with_ownership_count(mut self, count: u32) -> Self {
        self.ownership = Ownership::Shared { count };
        self
    }

    /// Set the broadcast root directly. For the wire layer only.
    #[must_use]
    pub(crate) fn with_broadcast_root(mut self, root: RankId) -> Self {
        self.broadcast_root = Some(root);
        self
    }

    pub fn broadcast_root(&self) -> Option<RankId> {
        self.broadcast_root
    }

    /// A copy of this envelope addressed to a new hop, used when
    /// forwarding a broadcast to tree children or an entity-routed
    /// message toward its owner (spec §4.4/§4.5).
    #[must_use]
    pub fn clone_for_resend(&self, dest: RankId) -> Self {
        let mut copy = *self;
        copy.dest = dest;
        copy
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn is_broadcast(&self) -> bool {
        self.kind.contains(EnvelopeKind::BROADCAST)
    }

    pub fn dest(&self) -> RankId {
        self.dest
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn epoch(&self) -> Option<EpochId> {
        self.epoch
    }

    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    /// Bump the reference count; a no-op (other than asserting) on an
    /// unmanaged envelope, which by definition has no count to bump.
    pub fn retain(&mut self) {
        match &mut self.ownership {
            Ownership::Shared { count } => *count += 1,
            Ownership::Unmanaged => {
                debug_assert!(false, "retain() called on an unmanaged envelope");
            }
        }
    }

    /// Decrement the reference count, returning `true` once it has
    /// reached zero (the message should be returned to the pool) or the
    /// envelope was unmanaged all along (single delete-after-send copy).
    pub fn release(&mut self) -> bool {
        match &mut self.ownership {
            Ownership::Shared { count } => {
                *count -= 1;
                *count == 0
            }
            Ownership::Unmanaged => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_forces_uninitialized_dest() {
        let handler = HandlerId::new_local(RankId::new(0), 1, false);
        let env = Envelope::broadcast(RankId::new(0), handler);
        assert!(env.is_broadcast());
        assert_eq!(env.dest(), RankId::UNINITIALIZED);
        assert_eq!(env.broadcast_root(), Some(RankId::new(0)));
        assert!(env.kind().contains(EnvelopeKind::NORMAL));
    }

    #[test]
    fn unmanaged_releases_immediately() {
        let handler = HandlerId::new_local(RankId::new(0), 1, false);
        let mut env = Envelope::point_to_point(RankId::new(1), handler);
        assert_eq!(env.ownership(), Ownership::Unmanaged);
        assert!(env.release());
    }

    #[test]
    fn shared_releases_only_at_zero() {
        let handler = HandlerId::new_local(RankId::new(0), 1, false);
        let mut env = Envelope::point_to_point(RankId::new(1), handler).share();
        env.retain();
        assert_eq!(env.ownership(), Ownership::Shared { count: 2 });
        assert!(!env.release());
        assert!(env.release());
    }

    #[test]
    fn epoch_and_tag_are_carried_at_most_once() {
        let handler = HandlerId::new_local(RankId::new(0), 1, false);
        let env = Envelope::point_to_point(RankId::new(1), handler)
            .with_epoch(EpochId::new_collective(1))
            .with_tag(42);
        assert!(env.kind().contains(EnvelopeKind::HAS_EPOCH));
        assert!(env.kind().contains(EnvelopeKind::HAS_TAG));
        assert_eq!(env.epoch(), Some(EpochId::new_collective(1)));
        assert_eq!(env.tag(), Some(42));
    }
}
