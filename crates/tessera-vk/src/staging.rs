//! Reusable host-mapped upload buffers.

use crate::resource::Buffer;

/// Idle staging buffers, reused best-fit by size.
#[derive(Debug)]
pub struct StagingPool {
    idle: Vec<Buffer>,
    min_size: u64,
    max_pooled: usize,
}

impl StagingPool {
    pub fn new(min_size: u64, max_pooled: usize) -> Self {
        Self {
            idle: Vec::new(),
            min_size: min_size.max(1),
            max_pooled,
        }
    }

    /// Size to create a new staging buffer with for a `requested`-byte upload.
    pub fn size_for(&self, requested: u64) -> u64 {
        requested.max(self.min_size).next_power_of_two()
    }

    /// Take the smallest idle buffer that can hold `size` bytes.
    pub fn acquire(&mut self, size: u64) -> Option<Buffer> {
        let index = self
            .idle
            .iter()
            .enumerate()
            .filter(|(_, buffer)| buffer.size >= size)
            .min_by_key(|(_, buffer)| buffer.size)
            .map(|(index, _)| index)?;
        Some(self.idle.swap_remove(index))
    }

    /// Return a buffer to the pool.
    ///
    /// Returns it back if the pool is full; the caller destroys it.
    pub fn release(&mut self, buffer: Buffer) -> Option<Buffer> {
        if self.idle.len() >= self.max_pooled {
            return Some(buffer);
        }
        self.idle.push(buffer);
        None
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Remove every idle buffer, for shutdown.
    pub fn drain(&mut self) -> Vec<Buffer> {
        std::mem::take(&mut self.idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::tests::fake_block;
    use ash::vk;
    use ash::vk::Handle;

    fn staging(raw: u64, size: u64) -> Buffer {
        Buffer {
            raw: vk::Buffer::from_raw(raw),
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: fake_block(size),
        }
    }

    #[test]
    fn new_buffers_are_rounded_up() {
        let pool = StagingPool::new(1024, 4);
        assert_eq!(pool.size_for(10), 1024);
        assert_eq!(pool.size_for(1500), 2048);
        assert_eq!(pool.size_for(4096), 4096);
    }

    #[test]
    fn acquire_picks_best_fit() {
        let mut pool = StagingPool::new(64, 8);
        for (raw, size) in [(1, 4096), (2, 256), (3, 1024)] {
            assert!(pool.release(staging(raw, size)).is_none());
        }

        let picked = pool.acquire(300).unwrap();
        assert_eq!(picked.size, 1024);
        assert!(pool.acquire(8192).is_none());
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn full_pool_hands_buffers_back() {
        let mut pool = StagingPool::new(64, 1);
        assert!(pool.release(staging(1, 64)).is_none());
        let rejected = pool.release(staging(2, 64)).unwrap();
        assert_eq!(rejected.raw, vk::Buffer::from_raw(2));
        assert_eq!(pool.drain().len(), 1);
        assert_eq!(pool.idle_count(), 0);
    }
}
