//! Epoch-based safe memory reclamation.
//!
//! Readers traverse the list without locks, so a block a writer just
//! unlinked may still be referenced by a thread that loaded the pointer
//! earlier. Reclamation is deferred until no such reference can remain:
//!
//! - Every participating thread claims a slot in a fixed pool of records
//!   (slots are released on handle drop and re-used, so a thread pool
//!   cycling OS threads does not leak records).
//! - A thread *pins* itself for the duration of each operation, publishing
//!   the global epoch it observed. A pinned thread lags the global epoch by
//!   at most one, because the epoch only advances when every pinned thread
//!   has caught up to it.
//! - Retired blocks go into the retiring thread's bucket for the current
//!   global epoch. A bucket tagged `e` is handed back to the block pool
//!   once the global epoch reaches `e + 2`: by then, every thread that was
//!   pinned while the block was reachable has unpinned at least once, and
//!   threads pinned since cannot have found the block.
//!
//! Epoch advancement and bucket draining both run opportunistically on
//! unpin, so reclamation needs no dedicated thread. A thread that stalls
//! inside a critical section only delays reclamation, never correctness.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use core::sync::atomic::{AtomicBool, AtomicUsize};

use crossbeam_utils::CachePadded;

use crate::pool::{BlockPool, LocalCache};
use crate::pr;

/// Size of the thread record pool. Registration fails once every slot is
/// claimed.
pub(crate) const MAX_THREADS: usize = 64;

/// `state` value of a record whose owner is outside any critical section.
const INACTIVE: usize = usize::MAX;

/// Retirement buckets per thread. Three tags cover the live window of
/// `{e, e + 1}` plus the bucket currently being refilled.
const BUCKETS: usize = 3;

/// Epochs a bucket must age before its contents are handed back.
const GRACE: usize = 2;

struct Retired {
    block: *mut u8,
    class: usize,
}

struct Bucket {
    epoch: usize,
    items: Vec<Retired>,
}

/// State a record's owner may touch without synchronization: the per-class
/// allocation caches and the retirement buckets.
struct Local {
    caches: Box<[LocalCache]>,
    buckets: [Bucket; BUCKETS],
}

#[repr(C)]
struct ThreadRecord {
    /// `INACTIVE`, or the epoch published on pin.
    state: AtomicUsize,
    /// Slot ownership. Claimed by `register`, released when the handle
    /// drops; the record itself (including its caches) is re-used.
    claimed: AtomicBool,
    local: UnsafeCell<Local>,
}

// `local` is only dereferenced by the thread holding the claim, which the
// claimed flag's acquire/release handoff makes exclusive.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

/// The reclamation domain: the global epoch, the record pool and the typed
/// block pool all retired memory flows back into.
pub(crate) struct Collector {
    epoch: CachePadded<AtomicUsize>,
    records: Box<[CachePadded<ThreadRecord>]>,
    pool: BlockPool,
}

impl Collector {
    /// Build a collector whose block pool has one size class per entry of
    /// `class_sizes`.
    pub fn new(class_sizes: &[usize]) -> Self {
        let records = (0..MAX_THREADS)
            .map(|_| {
                CachePadded::new(ThreadRecord {
                    state: AtomicUsize::new(INACTIVE),
                    claimed: AtomicBool::new(false),
                    local: UnsafeCell::new(Local {
                        caches: class_sizes.iter().map(|_| LocalCache::new()).collect(),
                        buckets: [
                            Bucket {
                                epoch: 0,
                                items: Vec::new(),
                            },
                            Bucket {
                                epoch: 0,
                                items: Vec::new(),
                            },
                            Bucket {
                                epoch: 0,
                                items: Vec::new(),
                            },
                        ],
                    }),
                })
            })
            .collect();
        Self {
            epoch: CachePadded::new(AtomicUsize::new(1)),
            records,
            pool: BlockPool::new(class_sizes),
        }
    }

    /// Claim a free record slot. `None` once all `MAX_THREADS` slots are
    /// taken by live handles.
    pub fn register(&self) -> Option<Handle<'_>> {
        for (slot, rec) in self.records.iter().enumerate() {
            if !rec.claimed.load(Relaxed)
                && rec
                    .claimed
                    .compare_exchange(false, true, Acquire, Relaxed)
                    .is_ok()
            {
                debug_assert_eq!(rec.state.load(Relaxed), INACTIVE);
                return Some(Handle {
                    collector: self,
                    slot,
                    _not_send: PhantomData,
                });
            }
        }
        None
    }

    /// Allocation off the shared pool paths, for callers without a pinned
    /// handle (sentinel construction).
    pub fn alloc_untracked(&self, class: usize) -> Option<*mut u8> {
        self.pool.alloc_global(class)
    }

    /// Advance the global epoch if every claimed, pinned record has caught
    /// up to it.
    fn try_advance(&self) -> bool {
        pr::fence_memory();
        let global = self.epoch.load(SeqCst);
        for rec in self.records.iter() {
            if rec.claimed.load(Acquire) {
                let state = rec.state.load(SeqCst);
                if state != INACTIVE && state != global {
                    return false;
                }
            }
        }
        self.epoch
            .compare_exchange(global, global + 1, SeqCst, Relaxed)
            .is_ok()
    }
}

unsafe impl Send for Collector {}
unsafe impl Sync for Collector {}

/// A claimed slot. One per thread; the type is neither `Send` nor `Sync`.
pub(crate) struct Handle<'c> {
    collector: &'c Collector,
    slot: usize,
    _not_send: PhantomData<*mut ()>,
}

impl<'c> Handle<'c> {
    #[inline]
    fn record(&self) -> &'c ThreadRecord {
        &self.collector.records[self.slot]
    }

    /// Index of the claimed slot; stable for the life of the handle.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Enter a critical section. While the returned guard lives, every
    /// block reachable when it was created stays allocated.
    pub fn pin(&self) -> Pin<'_, 'c> {
        let rec = self.record();
        debug_assert_eq!(
            rec.state.load(Relaxed),
            INACTIVE,
            "critical sections do not nest"
        );

        // Publish the epoch, then confirm it was still current: a scan that
        // misses the announcement must otherwise be allowed to advance the
        // epoch twice past us.
        let mut epoch = self.collector.epoch.load(SeqCst);
        loop {
            rec.state.store(epoch, SeqCst);
            pr::fence_memory();
            let now = self.collector.epoch.load(SeqCst);
            if now == epoch {
                break;
            }
            epoch = now;
        }

        Pin {
            collector: self.collector,
            record: rec,
            _handle: PhantomData,
        }
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        let rec = self.record();
        debug_assert_eq!(rec.state.load(Relaxed), INACTIVE);
        rec.claimed.store(false, Release);
    }
}

/// An active critical section. Dropping it exits the section and runs the
/// opportunistic quiescence scan.
pub(crate) struct Pin<'h, 'c> {
    collector: &'c Collector,
    record: &'c ThreadRecord,
    // Borrowing the (non-`Sync`) handle keeps `Pin` on its thread and alive
    // no longer than the claim.
    _handle: PhantomData<&'h Handle<'c>>,
}

impl Pin<'_, '_> {
    #[inline]
    fn local(&self) -> &mut Local {
        // Exclusive: the record is claimed by this thread and `Pin` is not
        // `Sync`.
        unsafe { &mut *self.record.local.get() }
    }

    /// Allocate a block of the given class through this thread's cache.
    pub fn alloc(&self, class: usize) -> Option<*mut u8> {
        let local = self.local();
        self.collector.pool.alloc(class, &mut local.caches[class])
    }

    /// Hand a block back to this thread's allocation cache directly. Only
    /// for blocks that were never published to other threads.
    pub fn dealloc_unpublished(&self, block: *mut u8, class: usize) {
        self.local().caches[class].push(block);
    }

    /// Defer reclamation of an unlinked block until no critical section can
    /// still observe it.
    pub fn retire(&self, block: *mut u8, class: usize) {
        debug_assert_ne!(self.record.state.load(Relaxed), INACTIVE);

        let epoch = self.collector.epoch.load(SeqCst);
        let local = self.local();
        let bucket = &mut local.buckets[epoch % BUCKETS];
        if bucket.epoch != epoch {
            // The previous tag is at least `BUCKETS` epochs old, so its
            // contents aged out long ago.
            Self::drain(self.collector, bucket);
            bucket.epoch = epoch;
        }
        bucket.items.push(Retired { block, class });
    }

    fn drain(collector: &Collector, bucket: &mut Bucket) {
        for r in bucket.items.drain(..) {
            collector.pool.free_global(r.class, r.block);
        }
    }
}

impl Drop for Pin<'_, '_> {
    fn drop(&mut self) {
        self.record.state.store(INACTIVE, SeqCst);

        // Quiescence scan: push the epoch along, then age out our buckets.
        self.collector.try_advance();
        let global = self.collector.epoch.load(Acquire);
        let local = self.local();
        for bucket in local.buckets.iter_mut() {
            if !bucket.items.is_empty() && bucket.epoch + GRACE <= global {
                Self::drain(self.collector, bucket);
            }
        }
    }
}
