//! Process-wide slab allocator used to back small [`Buffer`](crate::buffer::Buffer)
//! storage.
//!
//! Power-of-two size classes from 64 B to 64 KiB, one free list per class,
//! carved in 128 KiB arenas. A single mutex serializes all access, matching
//! the source allocator this design is ported from — contention has not
//! shown up as a bottleneck relative to syscall overhead elsewhere in the
//! reactor.

use std::sync::Mutex;

const MIN_CLASS: usize = 64;
const MAX_CLASS: usize = 65536;
const ARENA_BYTES: usize = 128 * 1024;

fn class_index(class: usize) -> usize {
    (class.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize
}

fn num_classes() -> usize {
    class_index(MAX_CLASS) + 1
}

/// Rounds `n` up to the smallest pool size class that holds it, or `None`
/// if `n` exceeds the largest class (the caller should fall back to the
/// heap).
pub fn size_class(n: usize) -> Option<usize> {
    if n > MAX_CLASS {
        return None;
    }
    let mut class = MIN_CLASS;
    while class < n {
        class *= 2;
    }
    Some(class)
}

struct PoolInner {
    free_lists: Vec<Vec<Vec<u8>>>,
}

impl PoolInner {
    fn new() -> Self {
        PoolInner {
            free_lists: (0..num_classes()).map(|_| Vec::new()).collect(),
        }
    }

    fn allocate(&mut self, class: usize) -> Vec<u8> {
        let idx = class_index(class);
        if let Some(buf) = self.free_lists[idx].pop() {
            return buf;
        }
        // Arena carve: pre-populate the free list with the rest of the
        // arena so future allocations of this class are O(1) pops.
        let blocks_per_arena = (ARENA_BYTES / class).max(1);
        for _ in 1..blocks_per_arena {
            self.free_lists[idx].push(Vec::with_capacity(class));
        }
        Vec::with_capacity(class)
    }

    fn deallocate(&mut self, class: usize, mut buf: Vec<u8>) {
        let idx = class_index(class);
        buf.clear();
        self.free_lists[idx].push(buf);
    }
}

/// A handle to the process-wide memory pool. Cheap to clone (it is a thin
/// wrapper over a shared mutex); typically obtained via [`MemoryPool::global`].
pub struct MemoryPool {
    inner: Mutex<PoolInner>,
}

impl MemoryPool {
    fn new() -> Self {
        MemoryPool {
            inner: Mutex::new(PoolInner::new()),
        }
    }

    /// The process-wide singleton pool.
    pub fn global() -> &'static MemoryPool {
        static POOL: std::sync::OnceLock<MemoryPool> = std::sync::OnceLock::new();
        POOL.get_or_init(MemoryPool::new)
    }

    /// Allocate a buffer of at least `requested` bytes from the pool.
    /// Returns `None` if `requested` exceeds the largest pool class; the
    /// caller should allocate directly from the heap in that case.
    pub fn allocate(&self, requested: usize) -> Option<Vec<u8>> {
        let class = size_class(requested)?;
        let mut inner = self.inner.lock().unwrap();
        Some(inner.allocate(class))
    }

    /// Return a pool-allocated buffer of the given original requested size.
    /// `requested` must be a value previously passed to [`allocate`](Self::allocate)
    /// that returned `Some`.
    pub fn deallocate(&self, requested: usize, buf: Vec<u8>) {
        if let Some(class) = size_class(requested) {
            let mut inner = self.inner.lock().unwrap();
            inner.deallocate(class, buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up_to_power_of_two() {
        assert_eq!(size_class(1), Some(64));
        assert_eq!(size_class(64), Some(64));
        assert_eq!(size_class(65), Some(128));
        assert_eq!(size_class(65536), Some(65536));
    }

    #[test]
    fn oversize_bypasses_pool() {
        assert_eq!(size_class(65537), None);
    }

    #[test]
    fn allocate_and_reuse() {
        let pool = MemoryPool::new();
        let buf = pool.allocate(100).unwrap();
        assert!(buf.capacity() >= 100);
        pool.deallocate(100, buf);
        let buf2 = pool.allocate(100).unwrap();
        assert!(buf2.capacity() >= 100);
    }
}
