//! Recycled packet buffers.

use bytes::BytesMut;
use parking_lot::Mutex;

// (buffer size, max cached buffers)
const SIZE_CLASSES: [(usize, usize); 5] = [
    (1024, 1024),
    (4 * 1024, 512),
    (32 * 1024, 256),
    (512 * 1024, 64),
    (1536 * 1024, 32),
];

struct SizeClass {
    size: usize,
    max: usize,
    free: Vec<BytesMut>,
}

/// Hands out buffers from a small set of size classes and takes them back once they're spent.
pub struct BufferPool {
    classes: Mutex<Vec<SizeClass>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        let classes = SIZE_CLASSES
            .iter()
            .map(|&(size, max)| SizeClass {
                size,
                max,
                free: Vec::new(),
            })
            .collect();

        Self {
            classes: Mutex::new(classes),
        }
    }

    /// Returns an empty buffer with a capacity of at least `size` bytes.
    pub fn get(&self, size: usize) -> BytesMut {
        let mut classes = self.classes.lock();

        match classes.iter_mut().find(|class| class.size >= size) {
            Some(class) => match class.free.pop() {
                Some(mut buf) => {
                    buf.clear();
                    buf
                }
                None => BytesMut::with_capacity(class.size),
            },
            // Larger than every class, never cached.
            None => BytesMut::with_capacity(size),
        }
    }

    /// Returns a buffer to its class, dropping it if the class is full or the capacity doesn't
    /// match a class size exactly.
    pub fn free(&self, buf: BytesMut) {
        let mut classes = self.classes.lock();

        if let Some(class) = classes
            .iter_mut()
            .find(|class| class.size == buf.capacity())
        {
            if class.free.len() < class.max {
                class.free.push(buf);
            }
        }
    }

    /// The number of cached buffers per class, smallest first.
    pub fn cached(&self) -> Vec<usize> {
        self.classes
            .lock()
            .iter()
            .map(|class| class.free.len())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    #[test]
    fn get_picks_smallest_class() {
        let pool = BufferPool::new();

        assert_eq!(pool.get(1).capacity(), 1024);
        assert_eq!(pool.get(1024).capacity(), 1024);
        assert_eq!(pool.get(1025).capacity(), 4 * 1024);
        assert_eq!(pool.get(600 * 1024).capacity(), 1536 * 1024);
        // Oversized requests are allocated exactly.
        assert_eq!(pool.get(2 * 1024 * 1024).capacity(), 2 * 1024 * 1024);
    }

    #[test]
    fn free_recycles_matching_buffers() {
        let pool = BufferPool::new();

        let mut buf = pool.get(100);
        buf.put_slice(b"stale");
        pool.free(buf);
        assert_eq!(pool.cached(), vec![1, 0, 0, 0, 0]);

        // The recycled buffer comes back cleared.
        let buf = pool.get(10);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(pool.cached(), vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn free_drops_foreign_buffers() {
        let pool = BufferPool::new();

        pool.free(BytesMut::with_capacity(1000));
        pool.free(BytesMut::with_capacity(2 * 1024 * 1024));

        assert_eq!(pool.cached(), vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn free_respects_class_cap() {
        let pool = BufferPool::new();

        for _ in 0..40 {
            pool.free(BytesMut::with_capacity(1536 * 1024));
        }

        assert_eq!(pool.cached()[4], 32);
    }
}
