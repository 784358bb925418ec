//! Device configuration.

/// Chunk size for persistently host-mapped memory. Also the dedicated threshold.
pub const DEFAULT_MAPPED_CHUNK_SIZE: u64 = 64 * 1024 * 1024;
/// Chunk size for device-only memory. Also the dedicated threshold.
pub const DEFAULT_UNMAPPED_CHUNK_SIZE: u64 = 256 * 1024 * 1024;

/// Configuration for a [`Device`](crate::Device).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Size of each host-mapped chunk. Requests at or above this size are dedicated.
    pub mapped_chunk_size: u64,
    /// Size of each unmapped chunk. Requests at or above this size are dedicated.
    pub unmapped_chunk_size: u64,
    /// Use legacy wide barriers even when synchronization2 is available.
    pub force_legacy_barriers: bool,
    /// Assert that no two live sub-allocations overlap (default: debug builds only).
    pub check_allocation_overlap: bool,
    /// Smallest staging buffer the staging pool will create.
    pub min_staging_size: u64,
    /// Maximum number of idle staging buffers kept for reuse.
    pub max_pooled_staging_buffers: usize,
    /// Timeout used by blocking fence waits, in nanoseconds.
    pub fence_wait_timeout_ns: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mapped_chunk_size: DEFAULT_MAPPED_CHUNK_SIZE,
            unmapped_chunk_size: DEFAULT_UNMAPPED_CHUNK_SIZE,
            force_legacy_barriers: false,
            check_allocation_overlap: cfg!(debug_assertions),
            min_staging_size: 64 * 1024,
            max_pooled_staging_buffers: 16,
            fence_wait_timeout_ns: u64::MAX,
        }
    }
}

impl DeviceConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk sizes (and therefore dedicated thresholds).
    pub fn with_chunk_sizes(mut self, mapped: u64, unmapped: u64) -> Self {
        self.mapped_chunk_size = mapped;
        self.unmapped_chunk_size = unmapped;
        self
    }

    /// Force the legacy barrier path.
    pub fn with_legacy_barriers(mut self, force: bool) -> Self {
        self.force_legacy_barriers = force;
        self
    }

    /// Enable or disable the live-allocation overlap check.
    pub fn with_overlap_check(mut self, enable: bool) -> Self {
        self.check_allocation_overlap = enable;
        self
    }

    /// Configure the staging pool.
    pub fn with_staging_pool(mut self, min_size: u64, max_pooled: usize) -> Self {
        self.min_staging_size = min_size;
        self.max_pooled_staging_buffers = max_pooled;
        self
    }

    /// Set the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.fence_wait_timeout_ns = timeout_ns;
        self
    }

    /// Allocator settings derived from this config.
    pub fn allocator(&self) -> AllocatorConfig {
        AllocatorConfig {
            mapped_chunk_size: self.mapped_chunk_size,
            unmapped_chunk_size: self.unmapped_chunk_size,
            check_overlap: self.check_allocation_overlap,
        }
    }
}

/// Settings consumed by the [`MemoryAllocator`](crate::memory::MemoryAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub mapped_chunk_size: u64,
    pub unmapped_chunk_size: u64,
    pub check_overlap: bool,
}

impl AllocatorConfig {
    /// Chunk size (and dedicated threshold) for the given mapping mode.
    pub fn chunk_size(&self, host_mapped: bool) -> u64 {
        if host_mapped {
            self.mapped_chunk_size
        } else {
            self.unmapped_chunk_size
        }
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        DeviceConfig::default().allocator()
    }
}
