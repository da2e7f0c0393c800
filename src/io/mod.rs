//! I/O utilities: the packet buffer pool.

pub mod buffer_pool;

pub use buffer_pool::{PacketBufferPool, PoolStats, PoolStatsSnapshot, PooledBuf};
