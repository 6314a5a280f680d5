//! Global command-sequence allocator.
//!
//! A single atomic counter shared by every connection in the process. The
//! wrap bound is a wire-compatibility constant: existing peers expect
//! sequence numbers to fold back to 1 once the counter passes it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter value past which the next allocation wraps to 1
/// (`≈ 2^32 - 2^17`).
pub const SEQ_WRAP: u64 = 4_294_836_215;

/// Monotone-between-wraps sequence allocator.
#[derive(Debug)]
pub struct SeqAllocator {
    counter: AtomicU64,
    wrap: u64,
}

impl SeqAllocator {
    /// Allocator with the wire-standard wrap bound.
    pub const fn new() -> Self {
        Self::with_wrap(SEQ_WRAP)
    }

    /// Allocator with a custom wrap bound (mainly for tests and scoped
    /// deployments that do not need wire compatibility).
    pub const fn with_wrap(wrap: u64) -> Self {
        Self { counter: AtomicU64::new(0), wrap }
    }

    /// Next sequence number. Values are strictly increasing until one past
    /// the wrap bound is handed out, then restart at 1.
    pub fn next(&self) -> u64 {
        let mut current = self.counter.load(Ordering::Relaxed);
        loop {
            let next = if current > self.wrap { 1 } else { current + 1 };
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for SeqAllocator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: SeqAllocator = SeqAllocator::new();

/// Allocate the next `cmd_seq` from the process-wide counter.
pub fn next_cmd_seq() -> u64 {
    GLOBAL.next()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn starts_at_one_and_increments() {
        let alloc = SeqAllocator::new();
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
        assert_eq!(alloc.next(), 3);
    }

    #[test]
    fn wraps_past_the_bound() {
        let alloc = SeqAllocator::with_wrap(5);
        let seen: Vec<u64> = (0..9).map(|_| alloc.next()).collect();
        // one value past the bound is handed out before folding back to 1
        assert_eq!(seen, [1, 2, 3, 4, 5, 6, 1, 2, 3]);
    }

    #[test]
    fn concurrent_allocations_are_unique_below_wrap() {
        let alloc = Arc::new(SeqAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| alloc.next()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000, "no duplicates before the wrap");
    }

    #[test]
    fn global_allocator_is_monotone() {
        let a = next_cmd_seq();
        let b = next_cmd_seq();
        assert!(b > a);
    }
}
