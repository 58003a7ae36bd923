//! Lock-free skip list keyed by 64-bit integers.
//!
//! The list is an ordered set of nodes with randomized tower heights; every
//! forward pointer is a 16-byte atomic link pair carrying a mark bit and a
//! cached successor key, every structural change is a CAS on one pair, and
//! reclamation is deferred through the epoch collector.
//!
//! # Deletion
//!
//! Removal is split into a logical and a physical half. The logical half,
//! and the linearization point, is a CAS that swaps the node's value to the
//! tombstone; afterwards the node's outgoing links are mark-flipped level by
//! level, top to bottom. The physical half is cooperative: the remover
//! swings each predecessor past the node, and any search that runs into a
//! marked run splices it out on the way by. When remover and a still-linking
//! inserter collide, a flag bit in the node's `level` word arbitrates which
//! of the two finishes the job and retires the node; the loser walks away.
//!
//! # Searches
//!
//! `weak_search` is a read-only descent that trusts the cached keys in the
//! link pairs and never helps out; its results may be stale, which callers
//! absorb by validating with CAS and falling back to `strong_search`.
//! `strong_search` restarts from the head whenever it loses a race, splices
//! out every marked run it crosses, and its results carry the usual
//! predecessor/successor post-condition per level.

use core::cell::UnsafeCell;
use core::ptr;

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use crate::backoff::Backoff;
use crate::epoch::{Collector, Handle, Pin};
use crate::node::{
    caller_to_internal_key, Link, Node, KEY_MAX, KEY_MIN, MAX_CALLER_KEY, NUM_LEVELS, TOMBSTONE,
};
use crate::pr;

/// Outcome of [`SetHandle::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// The key was absent and a new node was published.
    Created,
    /// The key was present and its value was replaced.
    Updated,
    /// The key was present and overwrite was off, or allocation failed.
    Failed,
}

/// Mix-in for the per-handle level generator seed.
const SEED_BASE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Tower height with drop-off rate 0.5 per level: count trailing ones of a
/// masked draw, so height `h` has probability `2^-h`, capped by the mask.
fn random_level(rng: &mut SmallRng) -> usize {
    let mut r = (rng.next_u64() >> 4) & ((1u64 << (NUM_LEVELS - 1)) - 1);
    let mut level = 1;
    while r & 1 == 1 {
        level += 1;
        r >>= 1;
    }
    level
}

/// Mark `x` deleted at every level of its tower, from `level - 1` down to 0.
/// Idempotent; the pair RMWs keep lower-level marks from becoming visible
/// before higher-level ones.
unsafe fn mark_deleted(x: *mut Node, level: usize) {
    for i in (0..level).rev() {
        (*x).link(i).mark();
    }
}

/// A concurrent ordered map from `u64` keys to opaque pointer-sized values.
///
/// All operations go through a [`SetHandle`] obtained from [`register`]
/// (one per thread). The zero value is reserved as the deletion tombstone
/// and keys above [`MAX_CALLER_KEY`] collide with the sentinels; both are
/// rejected by debug assertions.
///
/// [`register`]: SkipSet::register
///
/// # Example
///
/// ```
/// use skipset::SkipSet;
///
/// let set = SkipSet::new();
/// let handle = set.register().unwrap();
///
/// handle.insert(7, 700, false);
/// assert_eq!(handle.lookup(7), Some(700));
/// assert!(handle.remove(7));
/// assert_eq!(handle.lookup(7), None);
/// ```
pub struct SkipSet {
    head: *mut Node,
    smr: Collector,
}

// The node graph is only mutated through CAS; the collector keeps freed
// nodes out from under readers.
unsafe impl Send for SkipSet {}
unsafe impl Sync for SkipSet {}

impl Default for SkipSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipSet {
    /// Create an empty set: head and tail sentinels at full height, and one
    /// allocator size class per tower height.
    pub fn new() -> Self {
        let mut sizes = [0usize; NUM_LEVELS];
        for (i, s) in sizes.iter_mut().enumerate() {
            *s = Node::size_for(i + 1);
        }
        let smr = Collector::new(&sizes);

        let tail = Self::alloc_sentinel(&smr);
        let head = Self::alloc_sentinel(&smr);
        unsafe {
            Node::init(tail, NUM_LEVELS, KEY_MAX, TOMBSTONE);
            Node::init(head, NUM_LEVELS, KEY_MIN, TOMBSTONE);
            for i in 0..NUM_LEVELS {
                // Tail links terminate every level and are never followed.
                (*tail).link(i).init(Link::new(ptr::null_mut(), KEY_MAX));
                (*head).link(i).init(Link::new(tail, KEY_MAX));
            }
        }
        Self { head, smr }
    }

    fn alloc_sentinel(smr: &Collector) -> *mut Node {
        match smr.alloc_untracked(NUM_LEVELS - 1) {
            Some(block) => block as *mut Node,
            None => alloc::alloc::handle_alloc_error(core::alloc::Layout::new::<Node>()),
        }
    }

    /// Register the calling thread. Returns `None` once every reclamation
    /// slot is claimed by a live handle.
    pub fn register(&self) -> Option<SetHandle<'_>> {
        let smr = self.smr.register()?;
        let rng = SmallRng::seed_from_u64(SEED_BASE ^ smr.slot() as u64);
        Some(SetHandle {
            set: self,
            rng: UnsafeCell::new(rng),
            smr,
        })
    }

    /// Reload a predecessor's link and swing it only if it is unmarked and
    /// still points where the caller last saw it.
    unsafe fn cas_link(&self, pred: *mut Node, i: usize, expect: *mut Node, new: Link) -> bool {
        let cur = (*pred).link(i).load();
        if cur.is_marked() || cur.node() != expect {
            return false;
        }
        (*pred).link(i).compare_exchange(cur, new)
    }

    /// Optimistic top-down descent on cached keys. Fills `preds`/`succs`
    /// with the last node below `k` and the first at or above it per level;
    /// both may be stale or mid-deletion. Returns the level-0 successor.
    unsafe fn weak_search(
        &self,
        k: u64,
        preds: &mut [*mut Node; NUM_LEVELS],
        succs: &mut [*mut Node; NUM_LEVELS],
    ) -> *mut Node {
        let mut x = self.head;
        let mut succ = ptr::null_mut();
        for i in (0..NUM_LEVELS).rev() {
            loop {
                let pair = (*x).link(i).load();
                if pair.key >= k {
                    succ = pair.node();
                    break;
                }
                x = pair.node();
            }
            preds[i] = x;
            succs[i] = succ;
        }
        succ
    }

    /// Authoritative search. Restarts from the head on any lost race and
    /// splices out marked runs as it goes, so on return `preds[i]` pointed
    /// at `succs[i]` with nothing marked in between, `preds[i].key < k`,
    /// and `succs[i].key >= k`, at every level.
    unsafe fn strong_search(
        &self,
        k: u64,
        preds: &mut [*mut Node; NUM_LEVELS],
        succs: &mut [*mut Node; NUM_LEVELS],
    ) -> *mut Node {
        'retry: loop {
            pr::fence_acquire();
            let mut x = self.head;
            for i in (0..NUM_LEVELS).rev() {
                let mut x_pair = (*x).link(i).load();
                // A marked link here means x itself is going; so is the
                // predecessor recorded one level up. Start over.
                if x_pair.is_marked() {
                    continue 'retry;
                }
                let mut y = x_pair.node();
                loop {
                    let mut y_pair = (*y).link(i).load();
                    while y_pair.is_marked() {
                        y = y_pair.node();
                        y_pair = (*y).link(i).load();
                    }
                    if (*y).key() >= k {
                        break;
                    }
                    x = y;
                    x_pair = y_pair;
                    y = y_pair.node();
                }

                // Swing the forward pointer over the marked run we crossed.
                if x_pair.node() != y && !self.cas_link(x, i, x_pair.node(), Link::new(y, (*y).key()))
                {
                    continue 'retry;
                }

                preds[i] = x;
                succs[i] = y;
            }
            return succs[0];
        }
    }

    /// Insert/update body, shared by the public entry point.
    unsafe fn update(
        &self,
        pin: &Pin<'_, '_>,
        rng: &mut SmallRng,
        k: u64,
        value: usize,
        overwrite: bool,
    ) -> Update {
        let mut preds = [ptr::null_mut(); NUM_LEVELS];
        let mut succs = [ptr::null_mut(); NUM_LEVELS];
        let mut succ = self.weak_search(k, &mut preds, &mut succs);
        let mut new: *mut Node = ptr::null_mut();
        let mut backoff = Backoff::new();

        let outcome = 'retry: loop {
            if (*succ).key() == k {
                // The key is present: update its mapping in place.
                let mut observed = (*succ).value();
                loop {
                    if observed == TOMBSTONE {
                        // Mid-deletion; finish marking it and look again.
                        let level = (*succ).level();
                        mark_deleted(succ, level);
                        succ = self.strong_search(k, &mut preds, &mut succs);
                        continue 'retry;
                    }
                    if !overwrite {
                        break 'retry Update::Failed;
                    }
                    match (*succ).cas_value(observed, value) {
                        Ok(_) => break 'retry Update::Updated,
                        Err(v) => observed = v,
                    }
                }
            }

            // Absent: build a node once and keep it across retries.
            if new.is_null() {
                let level = random_level(rng);
                let Some(block) = pin.alloc(level - 1) else {
                    break 'retry Update::Failed;
                };
                new = block as *mut Node;
                Node::init(new, level, k, value);
            }
            let level = (*new).level();
            for i in 0..level {
                (*new).link(i).init(Link::new(succs[i], (*succs[i]).key()));
            }

            // Committed once the level-0 link lands.
            if !self.cas_link(preds[0], 0, succ, Link::new(new, k)) {
                backoff.spin();
                succ = self.strong_search(k, &mut preds, &mut succs);
                continue 'retry;
            }

            // Splice in at each of the other levels in turn.
            let mut i = 1;
            while i < level {
                let pred = preds[i];
                let succ_i = succs[i];

                // A concurrent remove can take the node out from under us.
                let cur = (*new).link(i).load();
                if cur.is_marked() {
                    break;
                }
                if cur.node() != succ_i
                    && !(*new)
                        .link(i)
                        .compare_exchange(cur, Link::new(succ_i, (*succ_i).key()))
                {
                    // Only a concurrent mark changes this link; the re-read
                    // at the top of the loop will see it.
                    continue;
                }
                if (*succ_i).key() == k {
                    // Another node now owns this key at level i, which can
                    // only happen if ours was deleted below. Re-resolve.
                    pr::fence_acquire();
                    self.strong_search(k, &mut preds, &mut succs);
                    continue;
                }
                debug_assert!((*pred).key() < k && (*succ_i).key() > k);
                if !self.cas_link(pred, i, succ_i, Link::new(new, k)) {
                    pr::fence_acquire();
                    self.strong_search(k, &mut preds, &mut succs);
                    continue;
                }
                i += 1;
            }

            // Linking finished or was abandoned. If the flag was already up,
            // a remover gave up waiting on us and the unlink is now ours.
            if (*new).flag_ready_for_free() {
                pr::fence_memory();
                self.full_delete(pin, new, level - 1);
            }
            break 'retry Update::Created;
        };

        if !matches!(outcome, Update::Created) && !new.is_null() {
            // Every publish attempt lost and the key path resolved without
            // the node; nobody ever saw it.
            pin.dealloc_unpublished(new as *mut u8, (*new).level() - 1);
        }
        outcome
    }

    unsafe fn remove(&self, pin: &Pin<'_, '_>, k: u64) -> bool {
        let mut preds = [ptr::null_mut(); NUM_LEVELS];
        let mut succs = [ptr::null_mut(); NUM_LEVELS];
        let x = self.weak_search(k, &mut preds, &mut succs);
        if (*x).key() != k {
            return false;
        }
        let level = (*x).level();

        // Swapping the value for the tombstone commits the removal.
        let mut observed = (*x).value();
        loop {
            if observed == TOMBSTONE {
                return false;
            }
            match (*x).cas_value(observed, TOMBSTONE) {
                Ok(_) => break,
                Err(v) => observed = v,
            }
        }

        pr::fence_release();
        mark_deleted(x, level);

        // Swing the predecessors ourselves; left to future searches, the
        // number of marked-but-linked nodes is only bounded by the number
        // of threads if every remover does this.
        for i in (0..level).rev() {
            let x_pair = (*x).link(i).load();
            if !self.cas_link(preds[i], i, x, Link::new(x_pair.node(), x_pair.key)) {
                // Below the top level the node was fully linked, so the
                // cleanup is ours outright. At the top level the flag
                // decides whether we or the still-linking inserter finish.
                if i != level - 1 || (*x).flag_ready_for_free() {
                    pr::fence_memory();
                    self.full_delete(pin, x, i);
                }
                return true;
            }
        }
        pin.retire(x as *mut u8, level - 1);
        true
    }

    /// Finish a deletion whose cooperative unlink failed: re-resolve the
    /// neighborhood until no predecessor can still reach `x`, then retire
    /// it. Exactly one thread runs this per node, decided by the flag.
    unsafe fn full_delete(&self, pin: &Pin<'_, '_>, x: *mut Node, from_level: usize) {
        let k = (*x).key();
        let mut preds = [ptr::null_mut(); NUM_LEVELS];
        let mut succs = [ptr::null_mut(); NUM_LEVELS];
        let mut i = from_level;
        loop {
            self.strong_search(k, &mut preds, &mut succs);
            pr::fence_acquire();
            let mut stale = false;
            while i > 0 {
                // Above the bottom level a racing insert can leave a
                // predecessor holding an old forward pointer to x; walk the
                // level to prove it no longer does.
                let mut n = (*preds[i]).link(i).load().node();
                while (*n).key() < k {
                    n = (*n).link(i).load().node();
                    pr::fence_acquire();
                }
                if n == x {
                    stale = true;
                    break;
                }
                // This level is clean for good, even if we go around again.
                i -= 1;
            }
            if !stale {
                break;
            }
        }
        pin.retire(x as *mut u8, (*x).level() - 1);
    }

    unsafe fn lookup(&self, k: u64) -> Option<usize> {
        let mut preds = [ptr::null_mut(); NUM_LEVELS];
        let mut succs = [ptr::null_mut(); NUM_LEVELS];
        let x = self.weak_search(k, &mut preds, &mut succs);
        if (*x).key() != k {
            return None;
        }
        match (*x).value() {
            TOMBSTONE => None,
            v => Some(v),
        }
    }

    unsafe fn count(&self) -> usize {
        let mut n = (*self.head).link(0).load().node();
        let mut count = 0;
        while (*n).key() != KEY_MAX {
            if (*n).value() != TOMBSTONE {
                count += 1;
            }
            n = (*n).link(0).load().node();
        }
        count
    }

    unsafe fn check_consistency(&self) -> bool {
        use alloc::collections::BTreeSet;

        let mut below: BTreeSet<u64> = BTreeSet::new();
        for i in 0..NUM_LEVELS {
            let mut keys = BTreeSet::new();
            let mut last: Option<u64> = None;
            let mut x = self.head;
            loop {
                let pair = (*x).link(i).load();
                let n = pair.node();
                // Cached keys are written together with their pointer, so
                // they must agree with the target at all times.
                if pair.key != (*n).key() {
                    return false;
                }
                if (*n).key() == KEY_MAX {
                    break;
                }
                if !(*n).link(i).load().is_marked() {
                    let nk = (*n).key();
                    if last.is_some_and(|l| nk <= l) {
                        return false;
                    }
                    last = Some(nk);
                    if !keys.insert(nk) {
                        return false;
                    }
                }
                x = n;
            }
            // A node present at level i must be present at level i - 1.
            if i > 0 && !keys.iter().all(|key| below.contains(key)) {
                return false;
            }
            below = keys;
        }
        true
    }

    unsafe fn pending_marks(&self) -> usize {
        let mut marked = 0;
        for i in 0..NUM_LEVELS {
            let mut x = self.head;
            loop {
                let pair = (*x).link(i).load();
                if pair.is_marked() {
                    marked += 1;
                }
                let n = pair.node();
                if (*n).key() == KEY_MAX {
                    break;
                }
                x = n;
            }
        }
        marked
    }
}

/// A per-thread handle to a [`SkipSet`]: a claimed reclamation slot plus
/// the thread's level generator. Neither `Send` nor `Sync`; threads each
/// register their own.
pub struct SetHandle<'a> {
    set: &'a SkipSet,
    rng: UnsafeCell<SmallRng>,
    smr: Handle<'a>,
}

impl SetHandle<'_> {
    /// Insert `value` under `key`. With `overwrite`, an existing mapping is
    /// replaced and `Updated` returned; without it, an existing mapping
    /// yields `Failed`. Allocation failure also yields `Failed`.
    pub fn insert(&self, key: u64, value: usize, overwrite: bool) -> Update {
        debug_assert!(key <= MAX_CALLER_KEY, "key collides with a sentinel");
        debug_assert_ne!(value, TOMBSTONE, "zero is the deletion tombstone");
        let k = caller_to_internal_key(key);
        let pin = self.smr.pin();
        let rng = unsafe { &mut *self.rng.get() };
        unsafe { self.set.update(&pin, rng, k, value, overwrite) }
    }

    /// Remove `key`. Returns whether a mapping was removed.
    pub fn remove(&self, key: u64) -> bool {
        debug_assert!(key <= MAX_CALLER_KEY, "key collides with a sentinel");
        let k = caller_to_internal_key(key);
        let pin = self.smr.pin();
        unsafe { self.set.remove(&pin, k) }
    }

    /// Current value under `key`, if any. Never mutates and never retries.
    pub fn lookup(&self, key: u64) -> Option<usize> {
        debug_assert!(key <= MAX_CALLER_KEY, "key collides with a sentinel");
        let k = caller_to_internal_key(key);
        let _pin = self.smr.pin();
        unsafe { self.set.lookup(k) }
    }

    /// Number of live mappings, by bottom-level traversal. Weakly
    /// consistent: concurrent mutation may or may not be observed.
    pub fn count(&self) -> usize {
        let _pin = self.smr.pin();
        unsafe { self.set.count() }
    }

    /// Audit the structure: per-level key order, cached-key agreement,
    /// uniqueness, and level containment. Meant for tests and debugging at
    /// quiescent points; concurrent climbs can fail containment spuriously.
    pub fn check_consistency(&self) -> bool {
        let _pin = self.smr.pin();
        unsafe { self.set.check_consistency() }
    }

    /// Number of marked links still reachable from the head. Zero once all
    /// deletions have quiesced.
    pub fn pending_marks(&self) -> usize {
        let _pin = self.smr.pin();
        unsafe { self.set.pending_marks() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_threaded_sanity() {
        let set = SkipSet::new();
        let h = set.register().unwrap();

        for k in [5u64, 1, 9, 3, 7] {
            assert_eq!(h.insert(k, k as usize, false), Update::Created);
        }
        assert_eq!(h.lookup(3), Some(3));
        assert_eq!(h.lookup(4), None);
        assert!(h.remove(9));
        assert!(!h.remove(9));
        assert_eq!(h.count(), 4);
        for k in [1u64, 3, 5, 7] {
            assert_eq!(h.lookup(k), Some(k as usize));
        }
        assert!(h.check_consistency());
        assert_eq!(h.pending_marks(), 0);
    }

    #[test]
    fn test_overwrite_toggle() {
        let set = SkipSet::new();
        let h = set.register().unwrap();

        assert_eq!(h.insert(10, 100, false), Update::Created);
        assert_eq!(h.insert(10, 200, false), Update::Failed);
        assert_eq!(h.lookup(10), Some(100));
        assert_eq!(h.insert(10, 200, true), Update::Updated);
        assert_eq!(h.lookup(10), Some(200));
    }

    #[test]
    fn test_remove_then_reinsert() {
        let set = SkipSet::new();
        let h = set.register().unwrap();

        assert_eq!(h.insert(42, 1, false), Update::Created);
        assert!(h.remove(42));
        assert_eq!(h.lookup(42), None);
        assert_eq!(h.insert(42, 2, false), Update::Created);
        assert_eq!(h.lookup(42), Some(2));
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn test_remove_absent() {
        let set = SkipSet::new();
        let h = set.register().unwrap();
        assert!(!h.remove(1));
        h.insert(2, 2, false);
        assert!(!h.remove(1));
        assert!(!h.remove(3));
    }

    #[test]
    fn test_empty_set() {
        let set = SkipSet::new();
        let h = set.register().unwrap();
        assert_eq!(h.count(), 0);
        assert_eq!(h.lookup(0), None);
        assert_eq!(h.lookup(MAX_CALLER_KEY), None);
        assert!(h.check_consistency());
    }

    #[test]
    fn test_boundary_keys() {
        let set = SkipSet::new();
        let h = set.register().unwrap();
        assert_eq!(h.insert(0, 10, false), Update::Created);
        assert_eq!(h.insert(MAX_CALLER_KEY, 20, false), Update::Created);
        assert_eq!(h.lookup(0), Some(10));
        assert_eq!(h.lookup(MAX_CALLER_KEY), Some(20));
        assert!(h.remove(0));
        assert!(h.remove(MAX_CALLER_KEY));
        assert_eq!(h.count(), 0);
    }

    #[test]
    fn test_ordered_bulk() {
        let set = SkipSet::new();
        let h = set.register().unwrap();
        // Interleave ascending and descending runs to vary the tower shape.
        for k in (0..500u64).rev() {
            assert_eq!(h.insert(2 * k, k as usize + 1, false), Update::Created);
        }
        for k in 0..500u64 {
            assert_eq!(h.insert(2 * k + 1, k as usize + 1, false), Update::Created);
        }
        assert_eq!(h.count(), 1000);
        assert!(h.check_consistency());
        for k in 0..500u64 {
            assert!(h.remove(2 * k));
        }
        assert_eq!(h.count(), 500);
        assert!(h.check_consistency());
        assert_eq!(h.pending_marks(), 0);
    }

    #[test]
    fn test_mixed_ops_stay_consistent() {
        use rand::Rng;

        let set = SkipSet::new();
        let h = set.register().unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut live = alloc::collections::BTreeMap::new();

        for _ in 0..5000 {
            let k = rng.gen_range(0..256u64);
            if rng.gen_bool(0.5) {
                let v = rng.gen_range(1..usize::MAX);
                let expected = if live.contains_key(&k) {
                    Update::Updated
                } else {
                    Update::Created
                };
                assert_eq!(h.insert(k, v, true), expected);
                live.insert(k, v);
            } else {
                assert_eq!(h.remove(k), live.remove(&k).is_some());
            }
        }
        assert_eq!(h.count(), live.len());
        for (&k, &v) in &live {
            assert_eq!(h.lookup(k), Some(v));
        }
        assert!(h.check_consistency());
        assert_eq!(h.pending_marks(), 0);
    }

    #[test]
    fn test_level_distribution() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut ones = 0;
        for _ in 0..10_000 {
            let l = random_level(&mut rng);
            assert!((1..=NUM_LEVELS).contains(&l));
            if l == 1 {
                ones += 1;
            }
        }
        // Half the draws land on height 1, give or take.
        assert!((4000..6000).contains(&ones), "ones = {ones}");
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_tombstone_value_rejected() {
        let set = SkipSet::new();
        let h = set.register().unwrap();
        h.insert(1, TOMBSTONE, false);
    }
}
