use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::metrics;

/// Error returned when a pooled buffer cannot be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Pool has reached its outstanding-buffer limit (consumers not releasing).
    #[error("buffer pool exhausted ({outstanding} of {limit} buffers outstanding)")]
    Exhausted { outstanding: usize, limit: usize },
}

/// Counters describing pool usage. `outstanding` must return to zero once
/// every holder has released its buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: usize,
    pub released: usize,
    pub outstanding: usize,
    pub idle: usize,
}

/// Source of reusable byte storage shared by every worker.
///
/// Implementations must be thread-safe and O(1) for both operations. Storage
/// handed back through `recycle` is repositioned by `PooledBytes`, so pools
/// never need to clear it.
pub trait BufferPool: Send + Sync + 'static {
    /// Size in bytes of every buffer this pool hands out.
    fn buffer_size(&self) -> usize;

    /// Hand out storage of exactly `buffer_size()` bytes.
    fn try_acquire(&self) -> Result<Box<[u8]>, AllocError>;

    /// Take back storage previously handed out by `try_acquire`.
    fn recycle(&self, storage: Box<[u8]>);

    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }
}

pub type SharedBufferPool = Arc<dyn BufferPool>;

/// Byte buffer with a fill cursor (`len`) and a consume cursor (`pos`).
///
/// Bytes `[pos, len)` are the unconsumed contents. Dropping the buffer
/// returns its storage to the originating pool; detached buffers are freed.
pub struct PooledBytes {
    storage: Option<Box<[u8]>>,
    pool: Option<SharedBufferPool>,
    len: usize,
    pos: usize,
}

impl Drop for PooledBytes {
    fn drop(&mut self) {
        if let (Some(storage), Some(pool)) = (self.storage.take(), self.pool.take()) {
            pool.recycle(storage);
        }
    }
}

impl PooledBytes {
    /// Acquire a buffer from `pool`.
    pub fn acquire(pool: &SharedBufferPool) -> Result<Self, AllocError> {
        let storage = pool.try_acquire()?;
        Ok(Self {
            storage: Some(storage),
            pool: Some(Arc::clone(pool)),
            len: 0,
            pos: 0,
        })
    }

    /// Acquire from `pool`, falling back to a heap buffer of the same size
    /// when the pool is exhausted.
    pub fn acquire_or_detached(pool: &SharedBufferPool) -> Self {
        match Self::acquire(pool) {
            Ok(buffer) => buffer,
            Err(AllocError::Exhausted { .. }) => {
                metrics::inc_pool_exhausted();
                Self::detached(pool.buffer_size())
            }
        }
    }

    /// Heap buffer not owned by any pool.
    pub fn detached(capacity: usize) -> Self {
        Self {
            storage: Some(vec![0u8; capacity].into_boxed_slice()),
            pool: None,
            len: 0,
            pos: 0,
        }
    }

    fn storage(&self) -> &[u8] {
        self.storage.as_deref().unwrap_or(&[])
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.storage().len()
    }

    /// Number of bytes filled so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.len
    }

    /// All filled bytes, consumed or not.
    pub fn filled(&self) -> &[u8] {
        &self.storage()[..self.len]
    }

    /// Filled bytes not yet consumed.
    pub fn unconsumed(&self) -> &[u8] {
        &self.storage()[self.pos..self.len]
    }

    pub fn is_drained(&self) -> bool {
        self.pos == self.len
    }

    /// Writable tail; call `commit` with the number of bytes written.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match self.storage.as_deref_mut() {
            Some(storage) => &mut storage[len..],
            None => &mut [],
        }
    }

    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.remaining_capacity(), "commit past capacity");
        self.len += n;
    }

    /// Mark `n` filled bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len - self.pos, "consume past filled bytes");
        self.pos += n;
    }

    /// Copy as much of `data` as fits. Returns the number of bytes copied.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining_capacity());
        self.spare_mut()[..n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// Return the storage to its pool now. Equivalent to dropping.
    pub fn release(self) {}
}

impl std::fmt::Debug for PooledBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBytes")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// Free-list pool of equally sized buffers.
///
/// A single lock guards the free list; it is held only for a push or pop.
/// Buffers returned while `max_idle` buffers are already idle are freed.
pub struct FixedBufferPool {
    buffer_size: usize,
    max_idle: usize,
    limit: Option<usize>,
    free: Mutex<Vec<Box<[u8]>>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl FixedBufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            max_idle,
            limit: None,
            free: Mutex::new(Vec::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Cap the number of buffers that may be outstanding at once.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn shared(self) -> SharedBufferPool {
        Arc::new(self)
    }

    fn outstanding(&self) -> usize {
        let acquired = self.acquired.load(Ordering::Acquire);
        let released = self.released.load(Ordering::Acquire);
        acquired.saturating_sub(released)
    }
}

impl BufferPool for FixedBufferPool {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn try_acquire(&self) -> Result<Box<[u8]>, AllocError> {
        if let Some(limit) = self.limit {
            let outstanding = self.outstanding();
            if outstanding >= limit {
                return Err(AllocError::Exhausted { outstanding, limit });
            }
        }
        let storage = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        self.acquired.fetch_add(1, Ordering::AcqRel);
        Ok(storage)
    }

    fn recycle(&self, storage: Box<[u8]>) {
        self.released.fetch_add(1, Ordering::AcqRel);
        if storage.len() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(storage);
        }
    }

    fn stats(&self) -> PoolStats {
        let acquired = self.acquired.load(Ordering::Acquire);
        let released = self.released.load(Ordering::Acquire);
        PoolStats {
            acquired,
            released,
            outstanding: acquired.saturating_sub(released),
            idle: self.free.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_pool<F>(buffer_size: usize, f: F)
    where
        F: FnOnce(&SharedBufferPool),
    {
        let pool = FixedBufferPool::new(buffer_size, 8).shared();
        f(&pool);
        assert_eq!(pool.stats().outstanding, 0, "buffers leaked");
    }

    #[test]
    fn basic_acquire() {
        with_pool(16, |pool| {
            let mut b = PooledBytes::acquire(pool).expect("acquire failed");
            assert_eq!(b.capacity(), 16);
            assert!(b.is_empty());
            assert_eq!(b.extend_from_slice(b"hello"), 5);
            assert_eq!(b.filled(), b"hello");
            assert_eq!(pool.stats().outstanding, 1);
        });
    }

    #[test]
    fn drop_returns_storage_for_reuse() {
        with_pool(32, |pool| {
            drop(PooledBytes::acquire(pool).expect("acquire failed"));
            let stats = pool.stats();
            assert_eq!(stats.acquired, 1);
            assert_eq!(stats.released, 1);
            assert_eq!(stats.idle, 1);

            let _again = PooledBytes::acquire(pool).expect("acquire failed");
            assert_eq!(pool.stats().idle, 0);
        });
    }

    #[test]
    fn reused_buffer_is_repositioned() {
        with_pool(8, |pool| {
            let mut b = PooledBytes::acquire(pool).expect("acquire failed");
            b.extend_from_slice(b"12345678");
            b.consume(3);
            b.release();

            let b = PooledBytes::acquire(pool).expect("acquire failed");
            assert_eq!(b.len(), 0);
            assert!(b.is_drained());
            assert_eq!(b.remaining_capacity(), 8);
        });
    }

    #[test]
    fn extend_copies_only_what_fits() {
        with_pool(4, |pool| {
            let mut b = PooledBytes::acquire(pool).expect("acquire failed");
            assert_eq!(b.extend_from_slice(b"abcdef"), 4);
            assert!(b.is_full());
            assert_eq!(b.extend_from_slice(b"g"), 0);
        });
    }

    #[test]
    fn consume_tracks_unconsumed_bytes() {
        with_pool(8, |pool| {
            let mut b = PooledBytes::acquire(pool).expect("acquire failed");
            b.extend_from_slice(b"abcdef");
            b.consume(2);
            assert_eq!(b.unconsumed(), b"cdef");
            b.consume(4);
            assert!(b.is_drained());
        });
    }

    #[test]
    #[should_panic]
    fn consume_past_filled_panics() {
        let mut b = PooledBytes::detached(4);
        b.extend_from_slice(b"ab");
        b.consume(3);
    }

    #[test]
    fn spare_and_commit() {
        with_pool(8, |pool| {
            let mut b = PooledBytes::acquire(pool).expect("acquire failed");
            b.spare_mut()[..3].copy_from_slice(b"xyz");
            b.commit(3);
            assert_eq!(b.filled(), b"xyz");
            assert_eq!(b.spare_mut().len(), 5);
        });
    }

    #[test]
    fn limit_reports_exhaustion() {
        let pool = FixedBufferPool::new(8, 8).with_limit(2).shared();
        let a = PooledBytes::acquire(&pool).expect("acquire failed");
        let _b = PooledBytes::acquire(&pool).expect("acquire failed");
        match PooledBytes::acquire(&pool) {
            Err(AllocError::Exhausted { outstanding, limit }) => {
                assert_eq!(outstanding, 2);
                assert_eq!(limit, 2);
            }
            Ok(_) => panic!("expected exhaustion"),
        }
        drop(a);
        assert!(PooledBytes::acquire(&pool).is_ok());
    }

    #[test]
    fn exhausted_pool_falls_back_to_detached() {
        let pool = FixedBufferPool::new(8, 8).with_limit(1).shared();
        let _held = PooledBytes::acquire(&pool).expect("acquire failed");
        let fallback = PooledBytes::acquire_or_detached(&pool);
        assert!(!fallback.is_pooled());
        assert_eq!(fallback.capacity(), 8);
        drop(fallback);
        assert_eq!(pool.stats().outstanding, 1);
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = FixedBufferPool::new(8, 1).shared();
        let a = PooledBytes::acquire(&pool).expect("acquire failed");
        let b = PooledBytes::acquire(&pool).expect("acquire failed");
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn concurrent_acquire_release_balances() {
        let pool = FixedBufferPool::new(64, 64).shared();
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut b = PooledBytes::acquire(&pool).expect("acquire failed");
                        b.extend_from_slice(&[7u8; 10]);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("thread panicked");
        }
        let stats = pool.stats();
        assert_eq!(stats.acquired, 4000);
        assert_eq!(stats.outstanding, 0);
    }
}
