//! [`SequenceWindow`] – duplicate detector for upstream frame sequence numbers.
//!
//! # Algorithm
//!
//! The window keeps the last *N* distinct sequence numbers it accepted, in
//! arrival order, plus a hash set for O(1) lookup.  A sequence already in the
//! window is a duplicate.  A new one is inserted and, once the window holds
//! more than *N*, the oldest entry is evicted, so a sequence becomes
//! acceptable again after *N* other distinct sequences have passed.
//!
//! Sequences `<= 0` mean "unsequenced" and are always accepted without being
//! recorded.
//!
//! # Example
//!
//! ```rust
//! use singula_kernel::sequence_window::SequenceWindow;
//!
//! let mut window = SequenceWindow::new(2);
//! assert!(window.admit(7));
//! assert!(!window.admit(7)); // duplicate
//! assert!(window.admit(8));
//! assert!(window.admit(9)); // evicts 7
//! assert!(window.admit(7));
//! ```

use std::collections::{HashSet, VecDeque};

/// Default number of remembered sequence numbers.
pub const DEFAULT_WINDOW: usize = 32;

pub struct SequenceWindow {
    capacity: usize,
    order: VecDeque<i64>,
    seen: HashSet<i64>,
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl SequenceWindow {
    /// Create a window remembering `capacity` sequences (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity + 1),
            seen: HashSet::with_capacity(capacity + 1),
        }
    }

    /// Returns `true` when `sequence` is new (or unsequenced) and records it.
    /// Returns `false` for a duplicate.
    pub fn admit(&mut self, sequence: i64) -> bool {
        if sequence <= 0 {
            return true;
        }
        if !self.seen.insert(sequence) {
            return false;
        }
        self.order.push_back(sequence);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
