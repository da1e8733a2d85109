//! A small bounded buffer pool used to overlap USB I/O with disk I/O during
//! transfers (`spec.md` §4.6 "Pipelined disk I/O"). Without pipelining, a
//! read would alternate strictly between "wait for a bulk-in chunk" and
//! "wait for the chunk to hit disk"; with a pool of a couple of reusable
//! buffers, the next chunk can be requested from the device while the
//! previous one is still being written out.

use tokio::sync::{Semaphore, SemaphorePermit};

/// Default number of in-flight buffers (`spec.md` §4.6).
pub const DEFAULT_POOL_DEPTH: usize = 2;
/// Default size of each pooled buffer.
pub const DEFAULT_BUFFER_BYTES: usize = 256 * 1024;

/// A bounded pool of equally-sized byte buffers. `acquire` blocks until a
/// slot is free, so the number of buffers in flight (and therefore peak
/// memory use) never exceeds `depth`.
pub struct BufferPool {
    semaphore: Semaphore,
    buffer_bytes: usize,
}

impl BufferPool {
    pub fn new(depth: usize, buffer_bytes: usize) -> BufferPool {
        BufferPool {
            semaphore: Semaphore::new(depth.max(1)),
            buffer_bytes,
        }
    }

    pub fn with_defaults() -> BufferPool {
        BufferPool::new(DEFAULT_POOL_DEPTH, DEFAULT_BUFFER_BYTES)
    }

    /// Reserve a slot and hand back a freshly zeroed buffer of the pool's
    /// configured size. The buffer is released back to the pool (and its
    /// memory dropped) when the returned [`PooledBuffer`] goes out of scope,
    /// so a transfer that errors out mid-chunk never leaks a permit.
    pub async fn acquire(&self) -> PooledBuffer<'_> {
        let permit = self.semaphore.acquire().await.expect("pool semaphore is never closed");
        PooledBuffer {
            _permit: permit,
            data: vec![0u8; self.buffer_bytes],
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }
}

/// A buffer checked out of a [`BufferPool`]. Derefs to `Vec<u8>`; drop
/// releases the pool slot.
pub struct PooledBuffer<'a> {
    _permit: SemaphorePermit<'a>,
    data: Vec<u8>,
}

impl std::ops::Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_yields_a_buffer_of_the_configured_size() {
        let pool = BufferPool::new(2, 4096);
        let buf = pool.acquire().await;
        assert_eq!(buf.len(), 4096);
    }

    #[tokio::test]
    async fn pool_caps_concurrent_buffers_at_its_depth() {
        let pool = BufferPool::new(1, 16);
        let first = pool.acquire().await;

        let second = tokio::time::timeout(std::time::Duration::from_millis(20), pool.acquire()).await;
        assert!(second.is_err(), "second acquire should block while the only slot is held");

        drop(first);
        let second = tokio::time::timeout(std::time::Duration::from_millis(20), pool.acquire()).await;
        assert!(second.is_ok());
    }
}
