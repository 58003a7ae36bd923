//! # skipset
//!
//! A lock-free concurrent ordered map keyed by 64-bit integers, with
//! epoch-based safe memory reclamation.
//!
//! The map is a CAS-based skip list: every forward pointer is a 16-byte
//! atomic link pair carrying the successor pointer (mark bit in the low
//! bit) together with a cache of the successor's key, so traversals compare
//! keys without chasing pointers and always observe the two halves
//! consistently. Deleted nodes are unlinked cooperatively and their memory
//! recycled through per-level block pools once no thread can still observe
//! them.
//!
//! `insert`, `remove` and `lookup` are linearizable and lock-free: a failed
//! CAS always means another thread made progress.
//!
//! ## Module organization
//!
//! ### Foundation
//! - [`pr`] - Memory fences and spin hints
//! - [`mod@backoff`] - Exponential backoff for contended CAS loops
//!
//! ### Memory management
//! - `pool` - Per-level typed block pools (private)
//! - `epoch` - Epoch-based reclamation (private)
//!
//! ### The structure
//! - [`skiplist`] - The skip list and its per-thread handles
//!
//! ## Usage
//!
//! ```
//! use skipset::{SkipSet, Update};
//!
//! let set = SkipSet::new();
//! let handle = set.register().unwrap();
//!
//! assert_eq!(handle.insert(3, 30, false), Update::Created);
//! assert_eq!(handle.insert(3, 31, false), Update::Failed);
//! assert_eq!(handle.lookup(3), Some(30));
//! assert!(handle.remove(3));
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

extern crate alloc;

#[cfg(test)]
extern crate std;

// =============================================================================
// Tier 0: Foundation
// =============================================================================

/// Memory fences and spin hints.
pub mod pr;

/// Exponential backoff for contended CAS loops.
pub mod backoff;

// =============================================================================
// Tier 1: Memory management
// =============================================================================

mod pool;

mod epoch;

// =============================================================================
// Tier 2: Node and link model
// =============================================================================

mod node;

// =============================================================================
// Tier 3: The skip list
// =============================================================================

/// The lock-free skip list and its per-thread handles.
pub mod skiplist;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use node::MAX_CALLER_KEY;
pub use skiplist::{SetHandle, SkipSet, Update};
