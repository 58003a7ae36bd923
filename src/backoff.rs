//! Exponential backoff for contended CAS loops.
//!
//! A failed compare-and-swap means another thread made progress; retrying
//! immediately on a hot location mostly burns bus bandwidth. Each failure
//! doubles the number of pause hints issued before the next attempt, up to a
//! fixed ceiling.

use crate::pr;

/// Initial ceiling for a fresh backoff state.
const DEFAULT_CEILING: u32 = 128;

/// Hard upper bound on any ceiling.
const MAX_CEILING: u32 = 4096;

/// Exponential backoff state. One per retry loop, on the stack.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: u32,
    ceiling: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Create a new backoff state with the default ceiling.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current: 1,
            ceiling: DEFAULT_CEILING,
        }
    }

    /// Create a new backoff state with a custom ceiling.
    #[inline]
    #[must_use]
    pub const fn with_ceiling(ceiling: u32) -> Self {
        Self {
            current: 1,
            ceiling: if ceiling > MAX_CEILING {
                MAX_CEILING
            } else {
                ceiling
            },
        }
    }

    /// Reset to the initial state, as after a successful operation.
    #[inline]
    pub fn reset(&mut self) {
        self.current = 1;
    }

    /// Spin for the current number of iterations, then double it (capped).
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.current {
            pr::stall();
        }

        if self.current < self.ceiling {
            self.current = self.current.saturating_mul(2);
        }
    }

    /// Current spin count.
    #[inline]
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spin_doubles() {
        let mut b = Backoff::new();
        assert_eq!(b.current(), 1);
        b.spin();
        b.spin();
        b.spin();
        assert_eq!(b.current(), 8);
    }

    #[test]
    fn test_ceiling_caps() {
        let mut b = Backoff::with_ceiling(4);
        for _ in 0..10 {
            b.spin();
        }
        assert_eq!(b.current(), 4);
    }

    #[test]
    fn test_ceiling_clamped() {
        let b = Backoff::with_ceiling(u32::MAX);
        assert_eq!(b.ceiling, MAX_CEILING);
    }

    #[test]
    fn test_reset() {
        let mut b = Backoff::new();
        b.spin();
        b.spin();
        b.reset();
        assert_eq!(b.current(), 1);
    }
}
