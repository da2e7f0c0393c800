//! Lock-free packet buffer pool
//!
//! Fixed-size [`MTU`] buffers recycled across packets, backed by a
//! `crossbeam_queue::ArrayQueue` so acquisition and release tolerate
//! concurrent callers without a lock. Under steady state every packet on
//! the hot path reuses a pooled buffer; allocation only happens when the
//! pool runs dry.
//!
//! A [`PooledBuf`] returns itself to the pool when dropped, which is also
//! how the crate's exactly-once release invariant is enforced: a buffer is
//! owned by exactly one envelope, and dropping the envelope is the
//! release.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_POOL_CAPACITY, MTU};

/// Pool operation counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Buffers allocated because the pool was empty.
    allocations: AtomicU64,
    /// Buffers served from the pool.
    reuses: AtomicU64,
    /// Buffers returned to the pool.
    returns: AtomicU64,
    /// Buffers dropped because the pool was full.
    drops: AtomicU64,
}

impl PoolStats {
    /// Get the allocation count.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the reuse count.
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the return count.
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the drop count.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            drops: self.drops(),
        }
    }
}

/// Snapshot of pool counters for serialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolStatsSnapshot {
    /// Buffers allocated because the pool was empty.
    pub allocations: u64,
    /// Buffers served from the pool.
    pub reuses: u64,
    /// Buffers returned to the pool.
    pub returns: u64,
    /// Buffers dropped because the pool was full.
    pub drops: u64,
}

/// Pool of fixed-size [`MTU`] packet buffers.
///
/// Cheap to share behind an [`Arc`]; `acquire` never fails (it allocates
/// when the pool is empty), and buffers flow back on drop.
#[derive(Debug)]
pub struct PacketBufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    stats: PoolStats,
}

impl PacketBufferPool {
    /// Create a pool that retains at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity.max(1)),
            stats: PoolStats::default(),
        }
    }

    /// Create a pool with the default capacity.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }

    /// Acquire an MTU-sized buffer.
    ///
    /// The contents are unspecified; callers overwrite the region they
    /// use. The buffer's length is always exactly [`MTU`].
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let buf = if let Some(mut buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            debug_assert_eq!(buf.len(), MTU);
            buf.resize(MTU, 0);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; MTU]
        };

        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently held.
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Maximum number of idle buffers retained.
    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    /// Pool operation counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn release(&self, buf: Vec<u8>) {
        match self.buffers.push(buf) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// An MTU-sized buffer borrowed from a [`PacketBufferPool`].
///
/// Returned to the pool exactly once, when dropped.
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<PacketBufferPool>,
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_when_empty() {
        let pool = Arc::new(PacketBufferPool::new(4));
        let buf = pool.acquire();
        assert_eq!(buf.len(), MTU);
        assert_eq!(pool.stats().allocations(), 1);
        assert_eq!(pool.stats().reuses(), 0);
    }

    #[test]
    fn test_drop_returns_then_reuse() {
        let pool = Arc::new(PacketBufferPool::new(4));
        let buf = pool.acquire();
        drop(buf);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().returns(), 1);

        let _buf = pool.acquire();
        assert_eq!(pool.stats().reuses(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_full_pool_drops_excess() {
        let pool = Arc::new(PacketBufferPool::new(1));
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().returns(), 1);
        assert_eq!(pool.stats().drops(), 1);
    }

    #[test]
    fn test_buffer_is_writable_mtu_slice() {
        let pool = Arc::new(PacketBufferPool::new(4));
        let mut buf = pool.acquire();
        buf[0] = 0x45;
        buf[MTU - 1] = 0xFF;
        assert_eq!(buf[0], 0x45);
        assert_eq!(buf.as_ref()[MTU - 1], 0xFF);
    }

    #[test]
    fn test_stats_snapshot_serializes() {
        let pool = Arc::new(PacketBufferPool::new(4));
        drop(pool.acquire());
        let snap = pool.stats().snapshot();
        assert_eq!(snap.allocations, 1);
        assert_eq!(snap.returns, 1);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("allocations"));
    }

    #[test]
    fn test_concurrent_acquire_release() {
        use std::thread;

        let pool = Arc::new(PacketBufferPool::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let mut buf = pool.acquire();
                        buf[0] = 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = pool.stats().snapshot();
        assert_eq!(snap.allocations + snap.reuses, 1600);
        // Everything handed out came back (returned or dropped past capacity).
        assert_eq!(snap.returns + snap.drops, 1600);
    }
}
