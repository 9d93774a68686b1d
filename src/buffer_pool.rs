use bytes::BytesMut;
use std::sync::Mutex;

const NUM_CLASSES: usize = 33; // covers 2^0 .. 2^32

/// Pool of reusable buffers bucketed by power-of-two size class.
///
/// `get(n)` rounds `n` up to the next power of two and either pops a
/// recycled buffer from that shard or allocates a fresh one. `release`
/// clears and returns a buffer to the shard matching its capacity.
pub struct BufferPool {
    shards: Vec<Mutex<Vec<BytesMut>>>,
    max_per_shard: usize,
}

impl BufferPool {
    pub fn new(max_per_shard: usize) -> Self {
        let mut shards = Vec::with_capacity(NUM_CLASSES);
        for _ in 0..NUM_CLASSES {
            shards.push(Mutex::new(Vec::new()));
        }
        Self {
            shards,
            max_per_shard,
        }
    }

    fn class_of(n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        n.next_power_of_two().trailing_zeros() as usize
    }

    pub fn get(&self, n: usize) -> BytesMut {
        let class = Self::class_of(n);
        let cap = 1usize << class;
        if let Some(mut buf) = self.shards[class].lock().unwrap().pop() {
            buf.clear();
            return buf;
        }
        BytesMut::with_capacity(cap)
    }

    pub fn release(&self, mut buf: BytesMut) {
        let class = Self::class_of(buf.capacity());
        if class >= self.shards.len() {
            return;
        }
        buf.clear();
        let mut shard = self.shards[class].lock().unwrap();
        if shard.len() < self.max_per_shard {
            shard.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_of_rounds_up() {
        assert_eq!(BufferPool::class_of(1), 0);
        assert_eq!(BufferPool::class_of(513), 10);
        assert_eq!(BufferPool::class_of(1024), 10);
        assert_eq!(BufferPool::class_of(1025), 11);
    }

    #[test]
    fn get_then_release_reuses_buffer() {
        let pool = BufferPool::new(4);
        let buf = pool.get(4096);
        assert!(buf.capacity() >= 4096);
        pool.release(buf);
        let buf2 = pool.get(4096);
        assert!(buf2.capacity() >= 4096);
    }
}
