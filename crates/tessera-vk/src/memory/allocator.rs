//! Device-wide memory allocator.

use ash::vk;
use hashbrown::HashMap;

use super::chunk::Chunk;
use super::native::{DedicatedTarget, NativeMemory};
use super::{align_up, MemoryBlock};
use crate::config::AllocatorConfig;
use crate::error::{Result, VkError};

/// Parameters for a single allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRequest {
    /// Memory types the resource can live in (`VkMemoryRequirements::memoryTypeBits`).
    pub memory_type_bits: u32,
    /// Required property flags.
    pub properties: vk::MemoryPropertyFlags,
    /// Persistently map the memory for host access.
    pub host_mapped: bool,
    /// Size in bytes.
    pub size: u64,
    /// Required alignment of the block's offset.
    pub alignment: u64,
    /// The driver requires (or prefers) a dedicated allocation.
    pub dedicated: bool,
    /// Resource to attach to a dedicated allocation.
    pub dedicated_target: Option<DedicatedTarget>,
}

impl AllocationRequest {
    /// A plain request with no dedicated preference.
    pub fn new(
        memory_type_bits: u32,
        properties: vk::MemoryPropertyFlags,
        host_mapped: bool,
        size: u64,
        alignment: u64,
    ) -> Self {
        Self {
            memory_type_bits,
            properties,
            host_mapped,
            size,
            alignment,
            dedicated: false,
            dedicated_target: None,
        }
    }

    /// Request a dedicated allocation.
    pub fn dedicated(mut self, target: Option<DedicatedTarget>) -> Self {
        self.dedicated = true;
        self.dedicated_target = target;
        self
    }
}

/// Allocator usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub chunk_count: usize,
    pub chunk_bytes: u64,
    pub free_bytes: u64,
    pub dedicated_count: usize,
    pub dedicated_bytes: u64,
    pub live_blocks: usize,
}

/// All chunks for one (memory type, host-mapped) pair.
#[derive(Debug, Default)]
struct ChunkAllocatorSet {
    chunks: Vec<Chunk>,
}

/// Sub-allocator handing out [`MemoryBlock`]s from large native chunks.
pub struct MemoryAllocator<N: NativeMemory> {
    native: N,
    memory_types: Vec<vk::MemoryType>,
    granularity: u64,
    config: AllocatorConfig,
    sets: HashMap<(u32, bool), ChunkAllocatorSet>,
    dedicated_count: usize,
    dedicated_bytes: u64,
    live_blocks: usize,
}

impl<N: NativeMemory> MemoryAllocator<N> {
    /// Create an allocator over the device's memory types.
    ///
    /// `granularity` is the device's `bufferImageGranularity`; sub-allocated sizes
    /// are rounded up to it.
    pub fn new(
        native: N,
        memory_types: Vec<vk::MemoryType>,
        granularity: u64,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            native,
            memory_types,
            granularity: granularity.max(1),
            config,
            sets: HashMap::new(),
            dedicated_count: 0,
            dedicated_bytes: 0,
            live_blocks: 0,
        }
    }

    /// Native memory backend.
    pub fn native(&self) -> &N {
        &self.native
    }

    /// Resolve the first memory type allowed by `type_bits` that has all of `properties`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                *index < 32
                    && type_bits & (1 << index) != 0
                    && memory_type.property_flags.contains(properties)
            })
            .map(|(index, _)| index as u32)
            .ok_or(VkError::NoSuitableMemoryType {
                type_bits,
                properties,
            })
    }

    /// Allocate a block satisfying `request`.
    pub fn allocate(&mut self, request: &AllocationRequest) -> Result<MemoryBlock> {
        let mut properties = request.properties;
        if request.host_mapped {
            properties |= vk::MemoryPropertyFlags::HOST_VISIBLE;
        }
        let memory_type_index = self.find_memory_type(request.memory_type_bits, properties)?;

        let threshold = self.config.chunk_size(request.host_mapped);
        if request.dedicated || request.size >= threshold {
            return self.allocate_dedicated(memory_type_index, request);
        }

        let size = align_up(request.size.max(1), self.granularity);
        let alignment = request.alignment.max(1);
        let key = (memory_type_index, request.host_mapped);

        let set = self.sets.entry(key).or_default();
        for chunk in &mut set.chunks {
            if let Some(range) = chunk.allocate(size, alignment) {
                self.live_blocks += 1;
                return Ok(MemoryBlock {
                    memory: chunk.memory(),
                    offset: range.offset,
                    size: range.size,
                    memory_type_index,
                    mapped: chunk.mapped_at(range.offset),
                    host_mapped: request.host_mapped,
                    dedicated: false,
                });
            }
        }

        // Every chunk is exhausted: grow the set by one chunk and retry there.
        let memory = self.native.allocate(memory_type_index, threshold, None)?;
        let mapped_base = if request.host_mapped {
            match self.native.map(memory) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    self.native.free(memory);
                    return Err(err);
                }
            }
        } else {
            None
        };
        tracing::debug!(
            memory_type_index,
            host_mapped = request.host_mapped,
            size = threshold,
            "Allocated new memory chunk"
        );

        let mut chunk = Chunk::new(memory, threshold, mapped_base, self.config.check_overlap);
        let range = chunk
            .allocate(size, alignment)
            .ok_or_else(|| VkError::InvalidState("fresh chunk cannot fit request".to_string()))?;
        let block = MemoryBlock {
            memory,
            offset: range.offset,
            size: range.size,
            memory_type_index,
            mapped: chunk.mapped_at(range.offset),
            host_mapped: request.host_mapped,
            dedicated: false,
        };
        self.sets.entry(key).or_default().chunks.push(chunk);
        self.live_blocks += 1;
        Ok(block)
    }

    fn allocate_dedicated(
        &mut self,
        memory_type_index: u32,
        request: &AllocationRequest,
    ) -> Result<MemoryBlock> {
        let memory =
            self.native
                .allocate(memory_type_index, request.size, request.dedicated_target)?;
        let mapped = if request.host_mapped {
            match self.native.map(memory) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    self.native.free(memory);
                    return Err(err);
                }
            }
        } else {
            None
        };
        tracing::debug!(
            memory_type_index,
            size = request.size,
            required = request.dedicated,
            "Dedicated allocation"
        );

        self.dedicated_count += 1;
        self.dedicated_bytes += request.size;
        self.live_blocks += 1;
        Ok(MemoryBlock {
            memory,
            offset: 0,
            size: request.size,
            memory_type_index,
            mapped,
            host_mapped: request.host_mapped,
            dedicated: true,
        })
    }

    /// Return a block. Dedicated blocks release their native allocation.
    pub fn free(&mut self, block: MemoryBlock) {
        self.live_blocks = self.live_blocks.saturating_sub(1);
        if block.dedicated {
            self.dedicated_count = self.dedicated_count.saturating_sub(1);
            self.dedicated_bytes = self.dedicated_bytes.saturating_sub(block.size);
            self.native.free(block.memory);
            return;
        }

        let chunk = self
            .sets
            .get_mut(&(block.memory_type_index, block.host_mapped))
            .and_then(|set| set.chunks.iter_mut().find(|c| c.memory() == block.memory));
        match chunk {
            Some(chunk) => chunk.free(block.offset, block.size),
            None => {
                tracing::error!(?block, "Freed block does not belong to any chunk");
                debug_assert!(false, "freed block does not belong to any chunk");
            }
        }
    }

    /// Current usage counters.
    pub fn stats(&self) -> AllocatorStats {
        let mut stats = AllocatorStats {
            dedicated_count: self.dedicated_count,
            dedicated_bytes: self.dedicated_bytes,
            live_blocks: self.live_blocks,
            ..AllocatorStats::default()
        };
        for chunk in self.sets.values().flat_map(|set| &set.chunks) {
            stats.chunk_count += 1;
            stats.chunk_bytes += chunk.size();
            stats.free_bytes += chunk.free_bytes();
        }
        stats
    }

    /// Chunks for a (memory type, mapped) pair, for inspection.
    pub fn chunks(&self, memory_type_index: u32, host_mapped: bool) -> &[Chunk] {
        self.sets
            .get(&(memory_type_index, host_mapped))
            .map(|set| set.chunks.as_slice())
            .unwrap_or(&[])
    }

    /// Release every chunk. Blocks still alive become dangling.
    pub fn shutdown(&mut self) {
        if self.live_blocks > 0 {
            tracing::warn!(
                live_blocks = self.live_blocks,
                "Allocator shut down with live blocks"
            );
        }
        for (_, set) in self.sets.drain() {
            for chunk in set.chunks {
                self.native.free(chunk.memory());
            }
        }
    }
}

impl<N: NativeMemory> Drop for MemoryAllocator<N> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
