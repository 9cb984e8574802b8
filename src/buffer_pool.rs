//! Recycled scratch buffers for serialization and compression.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// Owned pool of byte buffers. Each store gets its own; there is no global instance.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    /// Buffers kept around once returned.
    max_retained: usize,
    /// Buffers that grew beyond this are dropped instead of recycled.
    max_capacity: usize,
}

impl BufferPool {
    pub fn new(max_retained: usize, max_capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_retained)),
            max_retained,
            max_capacity,
        }
    }

    /// Borrow an empty buffer; it goes back to the pool on drop.
    pub fn take(&self) -> PooledBuffer<'_> {
        let buf = self.buffers.lock().pop().unwrap_or_default();
        PooledBuffer { buf, pool: self }
    }

    pub fn retained(&self) -> usize {
        self.buffers.lock().len()
    }

    fn give_back(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.max_capacity {
            return;
        }
        buf.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_retained {
            buffers.push(buf);
        }
    }
}

pub struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_recycled_empty() {
        let pool = BufferPool::new(2, 1024);
        {
            let mut buf = pool.take();
            buf.extend_from_slice(b"hello");
        }
        assert_eq!(pool.retained(), 1);
        let buf = pool.take();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 5);
        assert_eq!(pool.retained(), 0);
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = BufferPool::new(1, 1024);
        {
            let _a = pool.take();
            let _b = pool.take();
        }
        assert_eq!(pool.retained(), 1);
    }

    #[test]
    fn test_oversized_buffers_are_dropped() {
        let pool = BufferPool::new(4, 16);
        {
            let mut buf = pool.take();
            buf.resize(64, 0);
        }
        assert_eq!(pool.retained(), 0);
    }
}
