//! Bounded size-class arena allocator for messages (spec §4.2).
//!
//! The original hands out raw pointers with an 8-byte size prefix and
//! requires callers to `dealloc` them exactly once, or corrupt the heap.
//! In Rust, ownership already makes a structural double-free impossible
//! without `unsafe`: [`PoolBuf`] is a move-only handle whose `Drop`
//! returns its block to the free list, so there is no pointer a caller
//! could hand back twice. `Pool::dealloc` still exists as an explicit,
//! named operation (matching the spec's `alloc`/`dealloc` vocabulary) —
//! it just consumes the buffer by value rather than decoding a raw
//! pointer. The "self-describing size" invariant becomes the `PoolBuf`
//! carrying its own length and size class instead of a prefix in memory.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::config::PoolConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeClass {
    Small,
    Medium,
    /// Larger than the medium class; falls back to a one-off allocation
    /// with no free-list reuse, matching "fallback malloc" in spec §4.2.
    Oversize,
}

struct PoolInner {
    config: PoolConfig,
    small_free: Vec<Vec<u8>>,
    medium_free: Vec<Vec<u8>>,
    outstanding: usize,
}

impl PoolInner {
    fn class_for(&self, len: usize) -> SizeClass {
        if len <= self.config.small_class_bytes {
            SizeClass::Small
        } else if len <= self.config.medium_class_bytes {
            SizeClass::Medium
        } else {
            SizeClass::Oversize
        }
    }

    fn take_block(&mut self, class: SizeClass) -> Vec<u8> {
        match class {
            SizeClass::Small => self
                .small_free
                .pop()
                .unwrap_or_else(|| vec![0u8; self.config.small_class_bytes]),
            SizeClass::Medium => self
                .medium_free
                .pop()
                .unwrap_or_else(|| vec![0u8; self.config.medium_class_bytes]),
            SizeClass::Oversize => Vec::new(),
        }
    }

    fn return_block(&mut self, class: SizeClass, mut block: Vec<u8>) {
        match class {
            SizeClass::Small => {
                block.resize(self.config.small_class_bytes, 0);
                self.small_free.push(block);
            }
            SizeClass::Medium => {
                block.resize(self.config.medium_class_bytes, 0);
                self.medium_free.push(block);
            }
            SizeClass::Oversize => {
                // Dropped; there is no free list for oversize blocks.
            }
        }
        self.outstanding -= 1;
    }
}

/// Per-rank message arena. Singleton per rank, like every other core
/// component (spec §5 "Shared-resource policy").
#[derive(Clone)]
pub struct Pool {
    inner: Rc<RefCell<PoolInner>>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Pool {
            inner: Rc::new(RefCell::new(PoolInner {
                config,
                small_free: Vec::new(),
                medium_free: Vec::new(),
                outstanding: 0,
            })),
        }
    }

    /// Allocate a zero-initialized buffer of at least `len` bytes, from
    /// the smallest size class that fits, or a one-off allocation beyond
    /// the medium class.
    pub fn alloc(&self, len: usize) -> PoolBuf {
        let mut inner = self.inner.borrow_mut();
        let class = inner.class_for(len);
        let mut block = inner.take_block(class);
        if block.len() < len {
            block.resize(len, 0);
        }
        inner.outstanding += 1;
        PoolBuf {
            data: block,
            len,
            class,
            pool: Rc::downgrade(&self.inner),
        }
    }

    /// Explicitly return a buffer to the pool. Equivalent to dropping it;
    /// provided because the spec names `dealloc` as its own operation.
    pub fn dealloc(&self, buf: PoolBuf) {
        drop(buf);
    }

    /// Number of buffers currently checked out (for tests/diagnostics).
    pub fn outstanding(&self) -> usize {
        self.inner.borrow().outstanding
    }

    fn release(inner: &Weak<RefCell<PoolInner>>, class: SizeClass, block: Vec<u8>) {
        if let Some(inner) = inner.upgrade() {
            inner.borrow_mut().return_block(class, block);
        }
    }
}

/// A buffer checked out of a [`Pool`]. Self-describing: it always knows
/// its own length and size class, matching the "every pointer returned by
/// `alloc` carries a self-describing size" invariant.
pub struct PoolBuf {
    data: Vec<u8>,
    len: usize,
    class: SizeClass,
    pool: Weak<RefCell<PoolInner>>,
}

impl PoolBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data[..self.len].to_vec()
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        let block = std::mem::take(&mut self.data);
        Pool::release(&self.pool, self.class, block);
    }
}

/// Allocate a [`PoolBuf`] from `pool` and copy `bytes` into it.
pub fn buf_from_bytes(pool: &Pool, bytes: &[u8]) -> PoolBuf {
    let mut buf = pool.alloc(bytes.len());
    buf.as_mut_slice().copy_from_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_reuses_freed_blocks_of_the_same_class() {
        let pool = Pool::new(PoolConfig::default());
        let buf = pool.alloc(10);
        assert_eq!(pool.outstanding(), 1);
        drop(buf);
        assert_eq!(pool.outstanding(), 0);

        let buf2 = pool.alloc(20);
        assert_eq!(buf2.len(), 20);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn oversize_allocation_bypasses_free_lists() {
        let pool = Pool::new(PoolConfig::default());
        let big = pool.config_medium_plus_one();
        let buf = pool.alloc(big);
        assert_eq!(buf.len(), big);
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let pool = Pool::new(PoolConfig::default());
        let buf = buf_from_bytes(&pool, b"hello world");
        assert_eq!(buf.as_slice(), b"hello world");
    }

    impl Pool {
        fn config_medium_plus_one(&self) -> usize {
            self.inner.borrow().config.medium_class_bytes + 1
        }
    }
}
