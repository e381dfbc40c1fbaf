//! RDMA manager (spec §4.6): handle registration, get/put on user or
//! system buffers, and persistent direct channels.
//!
//! As with [`crate::location`] and [`crate::termination`], the actual
//! byte transfer for a non-channel get/put crosses ranks via control
//! messages the active messenger sends; this module owns the handle
//! table and the pure protocol state machine, surfaced as [`RdmaAction`]
//! values for the messenger to execute (spec §9: avoid cyclic references
//! between components by separating "what to do" from "how to send it").

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::RdmaError;
use crate::types::{RankId, Tag};

const COLLECTIVE_BIT: u64 = 1 << 63;
const OWNER_SHIFT: u32 = 32;
const OWNER_BITS: u64 = 31;
const OWNER_MASK: u64 = ((1u64 << OWNER_BITS) - 1) << OWNER_SHIFT;
const SEQUENCE_MASK: u64 = (1u64 << OWNER_SHIFT) - 1;

/// Opaque handle identifying a registered RDMA region (spec §3 "RDMA
/// handle"): `{owner-rank, sequence, is-collective}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RdmaHandle(u64);

impl RdmaHandle {
    fn new(owner: RankId, sequence: u32, collective: bool) -> Self {
        let mut bits = (owner.as_u32() as u64) << OWNER_SHIFT;
        bits |= sequence as u64;
        if collective {
            bits |= COLLECTIVE_BIT;
        }
        RdmaHandle(bits)
    }

    pub fn owner(self) -> RankId {
        RankId::new(((self.0 & OWNER_MASK) >> OWNER_SHIFT) as u32)
    }

    pub fn sequence(self) -> u32 {
        (self.0 & SEQUENCE_MASK) as u32
    }

    pub fn is_collective(self) -> bool {
        self.0 & COLLECTIVE_BIT != 0
    }

    /// Raw bit pattern. `crate::runtime`'s control messages carry a handle
    /// across the wire this way; unlike `HandlerId`'s own accessors, this
    /// one is public, because an application legitimately needs to hand a
    /// handle to another rank in a message payload before that rank can
    /// `get`/`put` against it (no collective-registration step publishes
    /// it the way a collectively-registered `HandlerId` is already known
    /// everywhere). Still an explicit named method, not a `From`/`Into`
    /// impl, so it can't happen by accident (spec §9 "Handler IDs packed
    /// in a single integer").
    pub fn to_bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        RdmaHandle(bits)
    }
}

impl fmt::Debug for RdmaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaHandle")
            .field("owner", &self.owner())
            .field("sequence", &self.sequence())
            .field("collective", &self.is_collective())
            .finish()
    }
}

/// Which endpoint of a channel a rank plays (spec §4.6 "Channel ops").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Get,
    Put,
}

struct ChannelState {
    /// Whether a local/remote sync "fence" is outstanding.
    synced: bool,
}

struct CollectiveInfo {
    bytes_total: usize,
    map_fn: Rc<dyn Fn(u64, u32) -> RankId>,
}

struct HandleRecord {
    buffer: Rc<RefCell<Vec<u8>>>,
    elm_size: usize,
    get_fn: Option<Rc<dyn Fn(usize, usize) -> Vec<u8>>>,
    tagged_get_fns: HashMap<Tag, Rc<dyn Fn(usize, usize) -> Vec<u8>>>,
    put_fn: Option<Rc<dyn Fn(usize, &[u8])>>,
    tagged_put_fns: HashMap<Tag, Rc<dyn Fn(usize, &[u8])>>,
    collective: Option<CollectiveInfo>,
    channels: HashMap<(RankId, ChannelKind), ChannelState>,
}

/// A protocol step the RDMA manager needs the messenger to carry out.
#[derive(Debug)]
pub enum RdmaAction {
    SendGetRequest {
        to: RankId,
        handle: RdmaHandle,
        offset: usize,
        len: usize,
        tag: Tag,
    },
    SendGetReply {
        to: RankId,
        bytes: Vec<u8>,
        tag: Tag,
    },
    SendPutRequest {
        to: RankId,
        handle: RdmaHandle,
        offset: usize,
        bytes: Vec<u8>,
        tag: Tag,
    },
    SendPutAck {
        to: RankId,
        tag: Tag,
    },
}

struct RdmaManagerInner {
    this_rank: RankId,
    handles: HashMap<RdmaHandle, HandleRecord>,
    next_sequence: u32,
}

/// Per-rank RDMA region and channel owner (spec §4.6).
#[derive(Clone)]
pub struct RdmaManager {
    inner: Rc<RefCell<RdmaManagerInner>>,
}

impl RdmaManager {
    pub fn new(this_rank: RankId) -> Self {
        RdmaManager {
            inner: Rc::new(RefCell::new(RdmaManagerInner {
                this_rank,
                handles: HashMap::new(),
                next_sequence: 0,
            })),
        }
    }

    /// Register a local region. `region` is `None` to have the manager
    /// allocate its own zeroed storage of `bytes` length (spec §4.6:
    /// "default storage if ptr==null and bytes>0").
    pub fn register_handle(
        &self,
        region: Option<Rc<RefCell<Vec<u8>>>>,
        bytes: usize,
        elm_size: usize,
    ) -> RdmaHandle {
        let buffer = region.unwrap_or_else(|| Rc::new(RefCell::new(vec![0u8; bytes])));
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_sequence;
        inner.next_sequence += 1;
        let this_rank = inner.this_rank;
        let handle = RdmaHandle::new(this_rank, seq, false);
        inner.handles.insert(
            handle,
            HandleRecord {
                buffer,
                elm_size,
                get_fn: None,
                tagged_get_fns: HashMap::new(),
                put_fn: None,
                tagged_put_fns: HashMap::new(),
                collective: None,
                channels: HashMap::new(),
            },
        );
        handle
    }

    /// Register a collective (distributed) handle striped across ranks
    /// by `map` (spec §4.6: "the map function converts an element index
    /// to owning rank"). Each rank provides its own local shard.
    pub fn register_collective(
        &self,
        region: Option<Rc<RefCell<Vec<u8>>>>,
        bytes_local: usize,
        bytes_total: usize,
        elm_size: usize,
        map: Rc<dyn Fn(u64, u32) -> RankId>,
    ) -> RdmaHandle {
        let buffer = region.unwrap_or_else(|| Rc::new(RefCell::new(vec![0u8; bytes_local])));
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_sequence;
        inner.next_sequence += 1;
        let this_rank = inner.this_rank;
        let handle = RdmaHandle::new(this_rank, seq, true);
        inner.handles.insert(
            handle,
            HandleRecord {
                buffer,
                elm_size,
                get_fn: None,
                tagged_get_fns: HashMap::new(),
                put_fn: None,
                tagged_put_fns: HashMap::new(),
                collective: Some(CollectiveInfo {
                    bytes_total,
                    map_fn: map,
                }),
                channels: HashMap::new(),
            },
        );
        handle
    }

    pub fn associate_get_fn(
        &self,
        handle: RdmaHandle,
        f: impl Fn(usize, usize) -> Vec<u8> + 'static,
        tag: Option<Tag>,
    ) -> Result<(), RdmaError> {
        let mut inner = self.inner.borrow_mut();
        let record = inner
            .handles
            .get_mut(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        match tag {
            Some(tag) => {
                record.tagged_get_fns.insert(tag, Rc::new(f));
            }
            None => record.get_fn = Some(Rc::new(f)),
        }
        Ok(())
    }

    pub fn associate_put_fn(
        &self,
        handle: RdmaHandle,
        f: impl Fn(usize, &[u8]) + 'static,
        tag: Option<Tag>,
    ) -> Result<(), RdmaError> {
        let mut inner = self.inner.borrow_mut();
        let record = inner
            .handles
            .get_mut(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        match tag {
            Some(tag) => {
                record.tagged_put_fns.insert(tag, Rc::new(f));
            }
            None => record.put_fn = Some(Rc::new(f)),
        }
        Ok(())
    }

    /// Synthesize the payload for a get, on the handle owner: the
    /// associated get-fn if one was registered (preferring a tagged
    /// match), otherwise a direct memcpy out of the registered buffer
    /// (spec §4.6 "default is direct memcpy").
    pub fn service_get(
        &self,
        handle: RdmaHandle,
        offset: usize,
        len: usize,
        tag: Option<Tag>,
    ) -> Result<Vec<u8>, RdmaError> {
        let inner = self.inner.borrow();
        let record = inner
            .handles
            .get(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        if let Some(tag) = tag {
            if let Some(f) = record.tagged_get_fns.get(&tag) {
                return Ok(f(offset, len));
            }
        }
        if let Some(f) = &record.get_fn {
            return Ok(f(offset, len));
        }
        let buf = record.buffer.borrow();
        if offset + len > buf.len() {
            return Err(RdmaError::OutOfBounds {
                offset,
                requested: len,
                region_len: buf.len(),
            });
        }
        Ok(buf[offset..offset + len].to_vec())
    }

    /// Apply a put, on the handle owner: the associated put-fn if one was
    /// registered, otherwise a direct memcpy into the registered buffer.
    pub fn service_put(
        &self,
        handle: RdmaHandle,
        offset: usize,
        bytes: &[u8],
        tag: Option<Tag>,
    ) -> Result<(), RdmaError> {
        let inner = self.inner.borrow();
        let record = inner
            .handles
            .get(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        if let Some(tag) = tag {
            if let Some(f) = record.tagged_put_fns.get(&tag) {
                f(offset, bytes);
                return Ok(());
            }
        }
        if let Some(f) = &record.put_fn {
            f(offset, bytes);
            return Ok(());
        }
        let mut buf = record.buffer.borrow_mut();
        if offset + bytes.len() > buf.len() {
            return Err(RdmaError::OutOfBounds {
                offset,
                requested: bytes.len(),
                region_len: buf.len(),
            });
        }
        buf[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read this rank's own region directly (used for a get targeting a
    /// handle this rank itself owns, and by tests).
    pub fn local_copy(&self, handle: RdmaHandle) -> Result<Vec<u8>, RdmaError> {
        let inner = self.inner.borrow();
        let record = inner
            .handles
            .get(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        Ok(record.buffer.borrow().clone())
    }

    /// Owning rank for `index` under a collective handle's map function.
    pub fn collective_owner(&self, handle: RdmaHandle, index: u64, world_size: u32) -> Option<RankId> {
        let inner = self.inner.borrow();
        let record = inner.handles.get(&handle)?;
        let info = record.collective.as_ref()?;
        let _ = info.bytes_total;
        Some((info.map_fn)(index, world_size))
    }

    pub fn elm_size(&self, handle: RdmaHandle) -> Result<usize, RdmaError> {
        self.inner
            .borrow()
            .handles
            .get(&handle)
            .map(|r| r.elm_size)
            .ok_or(RdmaError::UnknownHandle(handle))
    }

    pub fn new_channel(&self, handle: RdmaHandle, peer: RankId, kind: ChannelKind) -> Result<(), RdmaError> {
        let mut inner = self.inner.borrow_mut();
        let record = inner
            .handles
            .get_mut(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        if record.channels.contains_key(&(peer, kind)) {
            return Err(RdmaError::ChannelAlreadyExists);
        }
        record
            .channels
            .insert((peer, kind), ChannelState { synced: true });
        Ok(())
    }

    pub fn remove_channel(&self, handle: RdmaHandle, peer: RankId, kind: ChannelKind) -> Result<(), RdmaError> {
        let mut inner = self.inner.borrow_mut();
        let record = inner
            .handles
            .get_mut(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        record
            .channels
            .remove(&(peer, kind))
            .ok_or(RdmaError::ChannelNotFound)?;
        Ok(())
    }

    /// Local fence: block-equivalent acknowledgement that all this rank's
    /// operations on the channel up to now have been issued (spec §4.6:
    /// "local and remote sync serve as fences"). In this single-threaded
    /// runtime that is always immediately true; kept as an explicit call
    /// so higher layers (and the demo) sequence on it the way the spec
    /// requires rather than assuming synchronity.
    pub fn sync_local(&self, handle: RdmaHandle, peer: RankId, kind: ChannelKind) -> Result<(), RdmaError> {
        let mut inner = self.inner.borrow_mut();
        let record = inner
            .handles
            .get_mut(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        let chan = record
            .channels
            .get_mut(&(peer, kind))
            .ok_or(RdmaError::ChannelNotFound)?;
        chan.synced = true;
        Ok(())
    }

    pub fn sync_remote(&self, handle: RdmaHandle, peer: RankId, kind: ChannelKind) -> Result<bool, RdmaError> {
        let inner = self.inner.borrow();
        let record = inner
            .handles
            .get(&handle)
            .ok_or(RdmaError::UnknownHandle(handle))?;
        let chan = record
            .channels
            .get(&(peer, kind))
            .ok_or(RdmaError::ChannelNotFound)?;
        Ok(chan.synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_service_get_round_trips_bytes() {
        let mgr = RdmaManager::new(RankId::new(0));
        // spec S3: double[64] initialized to i*1.0, little-endian bytes.
        let region: Vec<u8> = (0..64u64)
            .flat_map(|i| (i as f64).to_le_bytes())
            .collect();
        let handle = mgr.register_handle(Some(Rc::new(RefCell::new(region))), 64 * 8, 8);
        let got = mgr.service_get(handle, 0, 16, None).unwrap();
        let v0 = f64::from_le_bytes(got[0..8].try_into().unwrap());
        let v1 = f64::from_le_bytes(got[8..16].try_into().unwrap());
        assert_eq!(v0, 0.0);
        assert_eq!(v1, 1.0);
    }

    #[test]
    fn service_put_writes_region_then_get_observes_it() {
        let mgr = RdmaManager::new(RankId::new(0));
        let region = vec![0u8; 16];
        let handle = mgr.register_handle(Some(Rc::new(RefCell::new(region))), 16, 8);
        let incoming: Vec<u8> = [2.0f64, 3.0f64].iter().flat_map(|v| v.to_le_bytes()).collect();
        mgr.service_put(handle, 0, &incoming, None).unwrap();
        let got = mgr.service_get(handle, 0, 16, None).unwrap();
        assert_eq!(got, incoming);
    }

    #[test]
    fn out_of_bounds_get_is_an_error() {
        let mgr = RdmaManager::new(RankId::new(0));
        let handle = mgr.register_handle(None, 8, 8);
        assert!(matches!(
            mgr.service_get(handle, 0, 16, None),
            Err(RdmaError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn custom_get_fn_overrides_default_memcpy() {
        let mgr = RdmaManager::new(RankId::new(0));
        let handle = mgr.register_handle(None, 8, 8);
        mgr.associate_get_fn(handle, |_offset, len| vec![0xAB; len], None)
            .unwrap();
        let got = mgr.service_get(handle, 0, 4, None).unwrap();
        assert_eq!(got, vec![0xAB, 0xAB, 0xAB, 0xAB]);
    }

    #[test]
    fn channel_lifecycle() {
        let mgr = RdmaManager::new(RankId::new(0));
        let handle = mgr.register_handle(None, 8, 8);
        mgr.new_channel(handle, RankId::new(1), ChannelKind::Get)
            .unwrap();
        assert!(matches!(
            mgr.new_channel(handle, RankId::new(1), ChannelKind::Get),
            Err(RdmaError::ChannelAlreadyExists)
        ));
        assert!(mgr.sync_remote(handle, RankId::new(1), ChannelKind::Get).unwrap());
        mgr.remove_channel(handle, RankId::new(1), ChannelKind::Get)
            .unwrap();
        assert!(matches!(
            mgr.sync_remote(handle, RankId::new(1), ChannelKind::Get),
            Err(RdmaError::ChannelNotFound)
        ));
    }

    #[test]
    fn collective_handle_resolves_owner_via_map_fn() {
        let mgr = RdmaManager::new(RankId::new(0));
        let handle = mgr.register_collective(
            None,
            8,
            32,
            8,
            Rc::new(crate::location::mapping::round_robin_map),
        );
        assert_eq!(mgr.collective_owner(handle, 5, 4), Some(RankId::new(1)));
    }
}
