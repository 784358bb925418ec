//! Native `vkAllocateMemory`/`vkMapMemory`/`vkFreeMemory` access.

use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

use super::MappedPtr;
use crate::error::{Result, VkError};

/// The resource a dedicated allocation is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedicatedTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Native device-memory operations used by the allocator.
pub trait NativeMemory {
    /// Allocate `size` bytes from `memory_type_index`.
    fn allocate(
        &self,
        memory_type_index: u32,
        size: u64,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<vk::DeviceMemory>;

    /// Persistently map a whole allocation.
    fn map(&self, memory: vk::DeviceMemory) -> Result<MappedPtr>;

    /// Release a native allocation (implicitly unmapping it).
    fn free(&self, memory: vk::DeviceMemory);
}

/// [`NativeMemory`] backed by an `ash::Device`.
pub struct AshMemory {
    device: Arc<ash::Device>,
}

impl AshMemory {
    /// Wrap a logical device.
    ///
    /// # Safety
    /// The device must stay valid for as long as this value or any memory it
    /// allocated is alive.
    pub unsafe fn new(device: Arc<ash::Device>) -> Self {
        Self { device }
    }
}

impl NativeMemory for AshMemory {
    fn allocate(
        &self,
        memory_type_index: u32,
        size: u64,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<vk::DeviceMemory> {
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default();
        match dedicated {
            Some(DedicatedTarget::Buffer(buffer)) => dedicated_info = dedicated_info.buffer(buffer),
            Some(DedicatedTarget::Image(image)) => dedicated_info = dedicated_info.image(image),
            None => {}
        }

        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        if dedicated.is_some() {
            info = info.push_next(&mut dedicated_info);
        }

        // SAFETY: the device is valid per `AshMemory::new`.
        let memory = unsafe { self.device.allocate_memory(&info, None) }.map_err(VkError::from)?;
        Ok(memory)
    }

    fn map(&self, memory: vk::DeviceMemory) -> Result<MappedPtr> {
        // SAFETY: `memory` was allocated from this device from a host-visible type.
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        NonNull::new(ptr.cast::<u8>())
            .map(MappedPtr::new)
            .ok_or_else(|| VkError::InvalidState("vkMapMemory returned null".to_string()))
    }

    fn free(&self, memory: vk::DeviceMemory) {
        // SAFETY: callers only free allocations no resource still references.
        unsafe { self.device.free_memory(memory, None) };
    }
}

/// In-process stand-in for device memory, for allocator tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FakeMemory {
    next_handle: std::cell::Cell<u64>,
    live: std::cell::RefCell<Vec<(vk::DeviceMemory, u64, u32, bool)>>,
    pub fail_next: std::cell::Cell<bool>,
}

#[cfg(test)]
impl FakeMemory {
    /// Number of native allocations currently alive.
    pub fn live_count(&self) -> usize {
        self.live.borrow().len()
    }

    /// Sizes of the live native allocations, in allocation order.
    pub fn live_sizes(&self) -> Vec<u64> {
        self.live.borrow().iter().map(|(_, size, _, _)| *size).collect()
    }

    /// Number of live allocations made with a dedicated target.
    pub fn dedicated_count(&self) -> usize {
        self.live.borrow().iter().filter(|(.., d)| *d).count()
    }
}

#[cfg(test)]
impl NativeMemory for FakeMemory {
    fn allocate(
        &self,
        memory_type_index: u32,
        size: u64,
        dedicated: Option<DedicatedTarget>,
    ) -> Result<vk::DeviceMemory> {
        use ash::vk::Handle;
        if self.fail_next.replace(false) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
        }
        let handle = self.next_handle.get() + 1;
        self.next_handle.set(handle);
        let memory = vk::DeviceMemory::from_raw(handle);
        self.live
            .borrow_mut()
            .push((memory, size, memory_type_index, dedicated.is_some()));
        Ok(memory)
    }

    fn map(&self, _memory: vk::DeviceMemory) -> Result<MappedPtr> {
        Ok(MappedPtr::new(NonNull::dangling()))
    }

    fn free(&self, memory: vk::DeviceMemory) {
        let mut live = self.live.borrow_mut();
        let position = live.iter().position(|(m, ..)| *m == memory);
        assert!(position.is_some(), "freeing unknown memory {memory:?}");
        if let Some(position) = position {
            live.remove(position);
        }
    }
}
