//! Device memory sub-allocation.
//!
//! Buffers and images are backed by [`MemoryBlock`]s carved out of large native
//! allocations ("chunks"), one chunk set per (memory type, host-mapped) pair.
//! Oversized requests, and requests the driver wants dedicated, get their own
//! native allocation instead.

mod allocator;
mod chunk;
mod native;

pub use allocator::{AllocationRequest, AllocatorStats, MemoryAllocator};
pub use chunk::{Chunk, FreeRange};
pub use native::{AshMemory, DedicatedTarget, NativeMemory};

#[cfg(test)]
pub(crate) use native::FakeMemory;

use ash::vk;
use std::ptr::NonNull;

/// Host pointer into persistently mapped device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer refers to device memory that stays mapped for the lifetime of
// the owning chunk or dedicated allocation. Access is coordinated by the engine.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Raw host pointer.
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer `bytes` past this one.
    pub(crate) fn offset(self, bytes: u64) -> Self {
        let ptr = self.0.as_ptr().wrapping_add(bytes as usize);
        // Offsets stay inside the mapping, which never ends at address zero.
        Self(NonNull::new(ptr).unwrap_or(self.0))
    }
}

/// A range of device memory owned by exactly one buffer or image.
///
/// Not `Clone`: a block is returned to the allocator exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    /// Native allocation this block lives in.
    pub memory: vk::DeviceMemory,
    /// Byte offset inside `memory`.
    pub offset: u64,
    /// Size in bytes.
    pub size: u64,
    /// Memory type the native allocation was made from.
    pub memory_type_index: u32,
    /// Host pointer to the start of this block, if host-mapped.
    pub mapped: Option<MappedPtr>,
    /// Whether the block came from the host-mapped chunk set.
    pub host_mapped: bool,
    /// Whether the block owns its whole native allocation.
    pub dedicated: bool,
}

impl MemoryBlock {
    /// End offset (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Host pointer to the start of the block.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped.map(MappedPtr::as_ptr)
    }
}

/// Round `value` up to a multiple of `alignment` (any non-zero alignment).
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}
