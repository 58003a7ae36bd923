//! Memory fences and spin hints.
//!
//! Thin wrappers over `core::sync::atomic` fences with the names the rest of
//! the crate uses. Most ordering in this crate is carried by the orderings on
//! the atomic operations themselves; the free-standing fences below are for
//! the few places where an ordering constraint is not tied to a single
//! location (publishing a critical section, re-reading the world before a
//! search restart).

use core::sync::atomic::{compiler_fence, fence, Ordering};

/// Compiler barrier only. No hardware fence is emitted.
#[inline(always)]
pub fn barrier() {
    compiler_fence(Ordering::SeqCst);
}

/// Acquire fence. Loads after the fence cannot move before it.
#[inline(always)]
pub fn fence_acquire() {
    fence(Ordering::Acquire);
}

/// Release fence. Stores before the fence cannot move after it.
#[inline(always)]
pub fn fence_release() {
    fence(Ordering::Release);
}

/// Full fence, sequentially consistent. The only fence that orders a store
/// before a later load.
#[inline(always)]
pub fn fence_memory() {
    fence(Ordering::SeqCst);
}

/// CPU pause hint for spin loops.
#[inline(always)]
pub fn stall() {
    core::hint::spin_loop();
}
