//! Connection-id allocation.
//!
//! Connids key the out-of-band control channel replies from helper
//! processes back to clients. They are 32-bit, never zero, and never
//! shared by two live connections.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct ConnidAllocator {
    next: AtomicU32,
    in_use: DashMap<u32, ()>,
}

impl ConnidAllocator {
    pub fn new() -> ConnidAllocator {
        ConnidAllocator::default()
    }

    /// Allocate a fresh connid, probing past zero and any id still
    /// held by a live connection.
    pub fn alloc(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }
            if self.in_use.insert(id, ()).is_none() {
                return id;
            }
        }
    }

    /// Release a connid on client teardown.
    pub fn release(&self, id: u32) {
        self.in_use.remove(&id);
    }

    pub fn is_live(&self, id: u32) -> bool {
        self.in_use.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_nonzero_and_unique() {
        let alloc = ConnidAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn release_frees_the_slot() {
        let alloc = ConnidAllocator::new();
        let a = alloc.alloc();
        assert!(alloc.is_live(a));
        alloc.release(a);
        assert!(!alloc.is_live(a));
    }
}
