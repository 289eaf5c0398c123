//! # Buffer Pool
//!
//! Read buffers shared by the connection read loops.
//!
//! Every buffer in a pool has the same length, the configured reader buffer
//! size. A read loop holds one for the lifetime of its connection and gives it
//! back on drop, so a server with churning connections stops allocating once the
//! pool is warm.
//!
//! ## Usage
//! ```rust
//! use gamewire::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(4, 1024);
//! let buffer = pool.acquire();
//! assert_eq!(buffer.len(), 1024);
//! drop(buffer);
//! assert_eq!(pool.available(), 4);
//! ```

use std::sync::{Arc, Mutex};

/// A buffer that returns itself to its pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // Grown or shrunk buffers are not reused
        if self.buffer.len() != self.buffer_size {
            return;
        }
        if let Ok(mut pool) = self.pool.lock() {
            if pool.len() < self.max_pooled {
                pool.push(std::mem::take(&mut self.buffer));
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

/// Thread-safe pool of fixed-size byte buffers
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    /// Pre-allocate `pool_size` buffers of `buffer_size` bytes.
    ///
    /// The pool never keeps more than `pool_size` idle buffers; extra ones are
    /// freed when returned.
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let pool = (0..pool_size).map(|_| vec![0u8; buffer_size]).collect();
        Self {
            pool: Arc::new(Mutex::new(pool)),
            buffer_size,
            max_pooled: pool_size,
        }
    }

    /// Take a buffer from the pool, allocating when it is empty
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .pool
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        PooledBuffer {
            buffer,
            pool: self.pool.clone(),
            buffer_size: self.buffer_size,
            max_pooled: self.max_pooled,
        }
    }

    /// Number of idle buffers
    pub fn available(&self) -> usize {
        self.pool.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64, 10 * 1024)
    }
}
