use crossbeam_channel::{bounded, Receiver, Sender};

/// A bounded pool of reusable chunk buffers.
///
/// The pool never blocks: if no buffer is available, a fresh one is
/// allocated, and if the pool is full or a returned buffer has grown past
/// the default capacity, the buffer is dropped. This keeps the worst-case
/// allocation in line with the maximal number of concurrent chunks.
#[derive(Debug)]
pub(crate) struct BufferPool {
    /// Sending side to return buffers to the pool.
    tx: Sender<Vec<u8>>,
    /// Receiving side to draw buffers from the pool.
    rx: Receiver<Vec<u8>>,
    /// Buffers which grew beyond this capacity are not recycled.
    default_capacity: usize,
}

impl BufferPool {
    /// Creates a new pool holding at most `max_buffers` buffers at rest.
    pub(crate) fn new(max_buffers: usize, default_capacity: usize) -> Self {
        let (tx, rx) = bounded(max_buffers);
        Self {
            tx,
            rx,
            default_capacity,
        }
    }

    /// Draws a buffer from the pool, or allocates a fresh one.
    pub(crate) fn get(&self) -> Vec<u8> {
        self.rx.try_recv().unwrap_or_default()
    }

    /// Returns a buffer to the pool.
    pub(crate) fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > self.default_capacity {
            return;
        }
        buf.clear();
        // pool is full: drop the buffer
        _ = self.tx.try_send(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_recycled_passes() {
        let pool = BufferPool::new(1, 1024);

        let mut buf = pool.get();
        buf.reserve(64);
        let capacity = buf.capacity();
        pool.put(buf);

        assert_eq!(pool.get().capacity(), capacity);
    }

    #[test]
    fn test_oversized_buffers_are_dropped_passes() {
        let pool = BufferPool::new(1, 64);

        pool.put(Vec::with_capacity(65));

        assert_eq!(pool.get().capacity(), 0);
    }

    #[test]
    fn test_full_pool_drops_buffers_passes() {
        let pool = BufferPool::new(1, 64);

        pool.put(Vec::with_capacity(16));
        pool.put(Vec::with_capacity(16));

        assert!(pool.get().capacity() > 0);
        assert_eq!(pool.get().capacity(), 0);
    }
}
