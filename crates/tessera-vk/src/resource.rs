//! Buffers, images and the arena that owns them.
//!
//! Resources are addressed by generational [`ResourceHandle`]s. The arena also
//! holds each resource's global [`SyncState`] side table and its in-flight
//! count; destroying a resource that an unfinished submission still uses only
//! marks it, and the actual destruction happens when the count drops to zero.

use ash::vk;

use crate::error::{Result, VkError};
use crate::memory::MemoryBlock;
use crate::sync::{BarrierTarget, SubresourceMap, SubresourceRange, SyncState};

/// Generational handle to a buffer or image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle {
    index: u32,
    generation: u32,
}

impl ResourceHandle {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A buffer and the memory backing it.
#[derive(Debug)]
pub struct Buffer {
    pub raw: vk::Buffer,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryBlock,
}

impl Buffer {
    /// Host pointer to the start of the buffer, if host-mapped.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.memory.mapped_ptr()
    }

    /// Copy `data` into the mapped buffer at `offset`.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| VkError::InvalidState("Buffer not mapped".to_string()))?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| VkError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(VkError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }

        // SAFETY: the range was checked against the buffer size and the mapping
        // covers the whole block.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Copy typed data into the mapped buffer at `offset`.
    pub fn write<T: bytemuck::Pod>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Copy `len` bytes at `offset` out of the mapped buffer.
    pub fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| VkError::InvalidState("Buffer not mapped".to_string()))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| VkError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(VkError::InvalidState(
                "Read range exceeds buffer".to_string(),
            ));
        }

        let mut out = vec![0u8; len as usize];
        // SAFETY: the range was checked against the buffer size.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), out.len());
        }
        Ok(out)
    }
}

/// An image and the memory backing it.
#[derive(Debug)]
pub struct Image {
    pub raw: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub memory: MemoryBlock,
}

impl Image {
    /// Range covering every mip and layer.
    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange::new(0, self.mip_levels, 0, self.array_layers)
    }
}

/// Where a resource's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryLocation {
    /// Device-local, not host accessible.
    #[default]
    GpuOnly,
    /// Persistently mapped, for uploads.
    CpuToGpu,
    /// Persistently mapped, for readback.
    GpuToCpu,
}

impl MemoryLocation {
    /// Required memory properties.
    pub fn properties(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::CpuToGpu | Self::GpuToCpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    pub fn is_host_mapped(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

impl BufferDesc {
    pub fn new(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            location: MemoryLocation::GpuOnly,
        }
    }

    pub fn with_location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }
}

/// 2D image creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    pub fn new(format: vk::Format, extent: vk::Extent2D, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            usage,
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers.max(1);
        self
    }
}

/// Aspects barriers on an image of `format` must name.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// A GPU resource owned by the arena.
#[derive(Debug)]
pub enum Resource {
    Buffer(Buffer),
    Image(Image),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Image(_) => "image",
        }
    }

    /// (mip levels, array layers); buffers have a single subresource.
    pub fn subresource_counts(&self) -> (u32, u32) {
        match self {
            Self::Buffer(_) => (1, 1),
            Self::Image(image) => (image.mip_levels, image.array_layers),
        }
    }

    /// Native object barriers for this resource apply to.
    pub fn barrier_target(&self) -> BarrierTarget {
        match self {
            Self::Buffer(buffer) => BarrierTarget::Buffer { buffer: buffer.raw },
            Self::Image(image) => BarrierTarget::Image {
                image: image.raw,
                aspect: image.aspect,
            },
        }
    }

    pub fn memory(&self) -> &MemoryBlock {
        match self {
            Self::Buffer(buffer) => &buffer.memory,
            Self::Image(image) => &image.memory,
        }
    }

    pub fn as_buffer(&self) -> Option<&Buffer> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            Self::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Self::Image(image) => Some(image),
            Self::Buffer(_) => None,
        }
    }

    /// Destroy the native object and hand back its memory block.
    ///
    /// # Safety
    /// The device must be valid and no pending GPU work may use the resource.
    pub unsafe fn destroy(self, device: &ash::Device) -> MemoryBlock {
        match self {
            Self::Buffer(buffer) => {
                device.destroy_buffer(buffer.raw, None);
                buffer.memory
            }
            Self::Image(image) => {
                device.destroy_image(image.raw, None);
                image.memory
            }
        }
    }
}

struct Entry {
    resource: Resource,
    sync: SubresourceMap<SyncState>,
    in_flight: u32,
    destroy_requested: bool,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Generational storage for resources and their global sync state.
///
/// Only accessed under the device lock, so in-flight counts are plain integers.
#[derive(Default)]
pub struct ResourceArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    deferred: Vec<ResourceHandle>,
}

impl ResourceArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource and create its (untouched) sync state.
    pub fn insert(&mut self, resource: Resource) -> ResourceHandle {
        let (mips, layers) = resource.subresource_counts();
        let entry = Entry {
            resource,
            sync: SubresourceMap::new(mips, layers),
            in_flight: 0,
            destroy_requested: false,
        };

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return ResourceHandle::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        ResourceHandle::new(index, 0)
    }

    fn entry(&self, handle: ResourceHandle) -> Option<&Entry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, handle: ResourceHandle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn live_entry(&self, handle: ResourceHandle) -> Result<&Entry> {
        self.entry(handle)
            .filter(|entry| !entry.destroy_requested)
            .ok_or(VkError::ResourceDestroyed(handle))
    }

    /// Whether `handle` names a live resource (not destroyed or pending destruction).
    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.live_entry(handle).is_ok()
    }

    pub fn get(&self, handle: ResourceHandle) -> Result<&Resource> {
        self.live_entry(handle).map(|entry| &entry.resource)
    }

    pub fn buffer(&self, handle: ResourceHandle) -> Result<&Buffer> {
        self.get(handle)?
            .as_buffer()
            .ok_or(VkError::WrongResourceKind {
                handle,
                expected: "buffer",
            })
    }

    pub fn image(&self, handle: ResourceHandle) -> Result<&Image> {
        self.get(handle)?
            .as_image()
            .ok_or(VkError::WrongResourceKind {
                handle,
                expected: "image",
            })
    }

    /// Global sync state of a live resource.
    pub fn sync(&self, handle: ResourceHandle) -> Result<&SubresourceMap<SyncState>> {
        self.live_entry(handle).map(|entry| &entry.sync)
    }

    /// Global sync state, together with the resource it describes.
    pub fn sync_mut(
        &mut self,
        handle: ResourceHandle,
    ) -> Result<(&Resource, &mut SubresourceMap<SyncState>)> {
        match self.entry_mut(handle) {
            Some(entry) if !entry.destroy_requested => Ok((&entry.resource, &mut entry.sync)),
            _ => Err(VkError::ResourceDestroyed(handle)),
        }
    }

    /// Take an in-flight reference on a live resource.
    pub fn retain(&mut self, handle: ResourceHandle) -> Result<()> {
        match self.entry_mut(handle) {
            Some(entry) if !entry.destroy_requested => {
                entry.in_flight += 1;
                Ok(())
            }
            _ => Err(VkError::ResourceDestroyed(handle)),
        }
    }

    /// Drop an in-flight reference.
    ///
    /// Returns the resource if this was the last reference of a resource whose
    /// destruction was deferred; the caller destroys it.
    pub fn release(&mut self, handle: ResourceHandle) -> Option<Resource> {
        let entry = self.entry_mut(handle)?;
        debug_assert!(entry.in_flight > 0, "release without retain for {handle:?}");
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if entry.in_flight > 0 || !entry.destroy_requested {
            return None;
        }
        self.deferred.retain(|deferred| *deferred != handle);
        tracing::debug!(?handle, "Destroying deferred resource");
        self.remove(handle)
    }

    /// Destroy a resource now if nothing in flight uses it, otherwise defer.
    ///
    /// Returns the resource when the caller should destroy it immediately.
    pub fn request_destroy(&mut self, handle: ResourceHandle) -> Result<Option<Resource>> {
        let entry = match self.entry_mut(handle) {
            Some(entry) if !entry.destroy_requested => entry,
            _ => return Err(VkError::ResourceDestroyed(handle)),
        };
        if entry.in_flight == 0 {
            return Ok(self.remove(handle));
        }
        entry.destroy_requested = true;
        tracing::debug!(
            ?handle,
            in_flight = entry.in_flight,
            "Deferring resource destruction"
        );
        self.deferred.push(handle);
        Ok(None)
    }

    fn remove(&mut self, handle: ResourceHandle) -> Option<Resource> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(entry.resource)
    }

    /// In-flight reference count, if the handle is still present.
    pub fn in_flight(&self, handle: ResourceHandle) -> Option<u32> {
        self.entry(handle).map(|entry| entry.in_flight)
    }

    /// Resources waiting for their last submission to complete.
    pub fn deferred(&self) -> &[ResourceHandle] {
        &self.deferred
    }

    /// Number of resources present, including deferred ones.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every resource regardless of in-flight counts, for shutdown.
    pub fn drain(&mut self) -> Vec<Resource> {
        self.deferred.clear();
        self.free.clear();
        let mut resources = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.generation = slot.generation.wrapping_add(1);
                resources.push(entry.resource);
            }
            self.free.push(index as u32);
        }
        resources
    }
}
