//! Typed block pools, one size class per tower height.
//!
//! Nodes are fixed-size per level, so each level gets its own size class: a
//! global free list of recycled blocks plus a per-thread cache that makes the
//! common allocation path a couple of pointer moves with no shared traffic.
//! When both are empty a fresh slab is carved from the system allocator.
//!
//! Recycled blocks go back to the global free lists and are re-used for the
//! lifetime of the pool; slabs are only returned to the system when the pool
//! is dropped. The global free list is a Treiber stack whose head carries a
//! 64-bit version counter in the high half of a 128-bit word, so re-use of a
//! popped block cannot ABA a concurrent pop.
//!
//! A free block's first word holds the chain link. Live nodes overwrite it
//! immediately (it is the `level` word), which is why the word is read and
//! written atomically even on thread-local chains.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering::{Relaxed, Release};

use portable_atomic::AtomicU128;
use portable_atomic::Ordering as POrdering;

/// Blocks carved from one slab.
const BLOCKS_PER_SLAB: usize = 64;

/// Blocks moved from a global free list into a thread cache per refill.
const REFILL_BATCH: usize = 16;

/// Slab payload starts at this offset; keeps blocks 16-byte aligned.
const SLAB_HEADER: usize = 16;

#[inline]
unsafe fn read_chain(block: *mut u8) -> *mut u8 {
    (*(block as *const portable_atomic::AtomicUsize)).load(POrdering::Relaxed) as *mut u8
}

#[inline]
unsafe fn write_chain(block: *mut u8, next: *mut u8) {
    (*(block as *const portable_atomic::AtomicUsize)).store(next as usize, POrdering::Relaxed);
}

/// Version-counted lock-free stack of free blocks.
///
/// The head word packs `(version << 64) | block_address`; every successful
/// push or pop bumps the version. A pop may read a stale chain word out of a
/// block that another thread has already handed out, but the versioned CAS
/// then fails and the stale read is discarded.
struct FreeStack {
    head: AtomicU128,
}

impl FreeStack {
    const fn new() -> Self {
        Self {
            head: AtomicU128::new(0),
        }
    }

    #[inline]
    fn pack(block: *mut u8, version: u64) -> u128 {
        ((version as u128) << 64) | block as usize as u128
    }

    fn push(&self, block: *mut u8) {
        let mut cur = self.head.load(POrdering::Acquire);
        loop {
            unsafe { write_chain(block, cur as u64 as usize as *mut u8) };
            let new = Self::pack(block, (cur >> 64) as u64 + 1);
            match self
                .head
                .compare_exchange_weak(cur, new, POrdering::AcqRel, POrdering::Acquire)
            {
                Ok(_) => return,
                Err(c) => cur = c,
            }
        }
    }

    fn pop(&self) -> Option<*mut u8> {
        let mut cur = self.head.load(POrdering::Acquire);
        loop {
            let block = cur as u64 as usize as *mut u8;
            if block.is_null() {
                return None;
            }
            let next = unsafe { read_chain(block) };
            let new = Self::pack(next, (cur >> 64) as u64 + 1);
            match self
                .head
                .compare_exchange_weak(cur, new, POrdering::AcqRel, POrdering::Acquire)
            {
                Ok(_) => return Some(block),
                Err(c) => cur = c,
            }
        }
    }
}

/// Push-only list of every slab a class has carved, for teardown.
struct SlabList {
    head: AtomicPtr<SlabHeader>,
}

#[repr(C)]
struct SlabHeader {
    next: *mut SlabHeader,
}

impl SlabList {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, slab: *mut SlabHeader) {
        let mut head = self.head.load(Relaxed);
        loop {
            unsafe { (*slab).next = head };
            match self
                .head
                .compare_exchange_weak(head, slab, Release, Relaxed)
            {
                Ok(_) => return,
                Err(h) => head = h,
            }
        }
    }
}

struct SizeClass {
    block: usize,
    free: FreeStack,
    slabs: SlabList,
}

impl SizeClass {
    fn slab_layout(&self) -> Option<Layout> {
        Layout::from_size_align(SLAB_HEADER + BLOCKS_PER_SLAB * self.block, 16).ok()
    }

    /// Carve a fresh slab: one block is returned, the rest feed the global
    /// free list.
    fn carve(&self) -> Option<*mut u8> {
        let layout = self.slab_layout()?;
        let slab = unsafe { alloc(layout) };
        if slab.is_null() {
            return None;
        }
        self.slabs.push(slab as *mut SlabHeader);

        let base = unsafe { slab.add(SLAB_HEADER) };
        for i in 1..BLOCKS_PER_SLAB {
            self.free.push(unsafe { base.add(i * self.block) });
        }
        Some(base)
    }
}

/// Per-class chain of blocks owned by one thread. Lives inside a thread
/// record; never shared.
pub(crate) struct LocalCache {
    head: *mut u8,
}

impl LocalCache {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn push(&mut self, block: *mut u8) {
        unsafe { write_chain(block, self.head) };
        self.head = block;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<*mut u8> {
        if self.head.is_null() {
            return None;
        }
        let block = self.head;
        self.head = unsafe { read_chain(block) };
        Some(block)
    }
}

/// All size classes of one collector.
pub(crate) struct BlockPool {
    classes: Box<[SizeClass]>,
}

impl BlockPool {
    /// Build a pool with one class per entry of `sizes`. Sizes must be
    /// non-zero 16-byte multiples (node sizes always are).
    pub fn new(sizes: &[usize]) -> Self {
        let classes: Vec<SizeClass> = sizes
            .iter()
            .map(|&block| {
                debug_assert!(block >= 16 && block % 16 == 0);
                SizeClass {
                    block,
                    free: FreeStack::new(),
                    slabs: SlabList::new(),
                }
            })
            .collect();
        Self {
            classes: classes.into_boxed_slice(),
        }
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Fast-path allocation through a thread cache, refilling from the
    /// class's global free list or a fresh slab. `None` only when the system
    /// allocator fails.
    pub fn alloc(&self, class: usize, cache: &mut LocalCache) -> Option<*mut u8> {
        if let Some(block) = cache.pop() {
            return Some(block);
        }
        let cls = &self.classes[class];
        for _ in 0..REFILL_BATCH {
            match cls.free.pop() {
                Some(block) => cache.push(block),
                None => break,
            }
        }
        if let Some(block) = cache.pop() {
            return Some(block);
        }
        cls.carve()
    }

    /// Allocation straight off the shared paths; used for sentinels and
    /// other one-off blocks with no thread cache at hand.
    pub fn alloc_global(&self, class: usize) -> Option<*mut u8> {
        let cls = &self.classes[class];
        cls.free.pop().or_else(|| cls.carve())
    }

    /// Return a quiescent block to its class's global free list.
    pub fn free_global(&self, class: usize, block: *mut u8) {
        self.classes[class].free.push(block);
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        for cls in self.classes.iter() {
            // No layout means no slab was ever carved for this class.
            let Some(layout) = cls.slab_layout() else {
                continue;
            };
            let mut slab = cls.slabs.head.load(Relaxed);
            while !slab.is_null() {
                let next = unsafe { (*slab).next };
                unsafe { dealloc(slab as *mut u8, layout) };
                slab = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_cache_lifo() {
        let pool = BlockPool::new(&[16]);
        let mut cache = LocalCache::new();
        let a = pool.alloc(0, &mut cache).unwrap();
        let b = pool.alloc(0, &mut cache).unwrap();
        assert_ne!(a, b);
        cache.push(a);
        cache.push(b);
        assert_eq!(cache.pop(), Some(b));
        assert_eq!(cache.pop(), Some(a));
    }

    #[test]
    fn test_global_reuse() {
        let pool = BlockPool::new(&[32]);
        let block = pool.alloc_global(0).unwrap();
        unsafe { block.write_bytes(0xAB, 32) };
        pool.free_global(0, block);
        // The freed block is first in line again.
        assert_eq!(pool.alloc_global(0), Some(block));
    }

    #[test]
    fn test_carve_feeds_free_list() {
        let pool = BlockPool::new(&[16]);
        let first = pool.alloc_global(0).unwrap();
        // The rest of the slab is on the free list; draining it yields
        // distinct blocks and never the one already handed out.
        let mut seen = alloc::collections::BTreeSet::new();
        for _ in 0..BLOCKS_PER_SLAB - 1 {
            let b = pool.classes[0].free.pop().unwrap();
            assert_ne!(b, first);
            assert!(seen.insert(b as usize));
        }
        assert!(pool.classes[0].free.pop().is_none());
    }

    #[test]
    fn test_classes_are_independent() {
        let pool = BlockPool::new(&[16, 48]);
        assert_eq!(pool.class_count(), 2);
        let small = pool.alloc_global(0).unwrap();
        let large = pool.alloc_global(1).unwrap();
        pool.free_global(0, small);
        assert!(pool.classes[1].free.pop().is_some());
        assert_eq!(pool.alloc_global(0), Some(small));
        pool.free_global(1, large);
    }

    #[test]
    fn test_concurrent_push_pop() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(BlockPool::new(&[16]));
        let mut handles = std::vec::Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                let mut cache = LocalCache::new();
                let mut held = std::vec::Vec::new();
                for _ in 0..1000 {
                    held.push(pool.alloc(0, &mut cache).unwrap());
                    if held.len() > 8 {
                        pool.free_global(0, held.pop().unwrap());
                        pool.free_global(0, held.pop().unwrap());
                    }
                }
                for b in held {
                    pool.free_global(0, b);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
