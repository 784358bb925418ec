//! The device: resource arena, global sync state, submission and completion.
//!
//! Everything that mutates global state (sync state, the resource arena, fence
//! and semaphore pools, queue submission) happens behind one device-wide lock.
//! The memory allocator has its own lock, always taken after the device lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::capabilities::DeviceCapabilities;
use crate::command::{begin_command_buffer, end_command_buffer, submit_command_buffers, CommandList};
use crate::config::DeviceConfig;
use crate::error::{Result, VkError};
use crate::fence::{FencePool, SemaphorePool};
use crate::memory::{AllocationRequest, AllocatorStats, AshMemory, DedicatedTarget, MemoryAllocator};
use crate::recording::RecordingPhase;
use crate::resource::{
    aspect_for_format, Buffer, BufferDesc, Image, ImageDesc, MemoryLocation, Resource,
    ResourceArena, ResourceHandle,
};
use crate::staging::StagingPool;
use crate::submission::{commit_recording, CompletionCallback, InFlightSubmission, SubmissionTracker};
use crate::sync::{try_build_barrier, BarrierBatch, BarrierStrategy, BarrierTarget, SyncRequest};

/// Options for [`Device::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Caller-owned unsignaled fence; a pooled fence is used when `None`.
    pub fence: Option<vk::Fence>,
    /// Signal a pooled semaphore. The caller returns it with
    /// [`Device::recycle_semaphore`] once a wait on it has completed.
    pub signal_semaphore: bool,
    /// Semaphores to wait on, with the stages that wait.
    pub wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fence(mut self, fence: vk::Fence) -> Self {
        self.fence = Some(fence);
        self
    }

    pub fn with_signal_semaphore(mut self) -> Self {
        self.signal_semaphore = true;
        self
    }

    pub fn with_wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.wait_semaphores.push((semaphore, stage));
        self
    }
}

/// What a submission produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionInfo {
    pub fence: vk::Fence,
    pub signal_semaphore: Option<vk::Semaphore>,
}

/// Device-level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub in_flight_submissions: usize,
    pub submitted: u64,
    pub retired: u64,
    pub resources: usize,
    pub deferred_destructions: usize,
    pub pooled_fences: usize,
    pub pooled_semaphores: usize,
    pub pooled_staging_buffers: usize,
}

/// State guarded by the device lock.
struct SharedState {
    arena: ResourceArena,
    submissions: SubmissionTracker,
    fences: FencePool,
    semaphores: SemaphorePool,
    staging: StagingPool,
}

/// A logical device with automatic synchronization and sub-allocated memory.
pub struct Device {
    raw: Arc<ash::Device>,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family: u32,
    capabilities: DeviceCapabilities,
    strategy: BarrierStrategy,
    config: DeviceConfig,
    shared: Mutex<SharedState>,
    allocator: Mutex<MemoryAllocator<AshMemory>>,
}

impl Device {
    /// Take ownership of a logical device.
    ///
    /// `capabilities` must describe `physical_device`, with the synchronization2
    /// and dynamic rendering flags set only if those features were enabled on
    /// `device`. All work is submitted to queue 0 of `queue_family`.
    ///
    /// # Safety
    /// `device` must have been created from `physical_device` with a queue in
    /// `queue_family`, and must not be destroyed by the caller.
    pub unsafe fn new(
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        capabilities: DeviceCapabilities,
        config: DeviceConfig,
    ) -> Result<Arc<Self>> {
        let raw = Arc::new(device);
        let queue = raw.get_device_queue(queue_family, 0);
        let strategy = BarrierStrategy::select(
            capabilities.supports_synchronization2,
            config.force_legacy_barriers,
        );

        let allocator = MemoryAllocator::new(
            AshMemory::new(Arc::clone(&raw)),
            capabilities.memory_types.clone(),
            capabilities.buffer_image_granularity,
            config.allocator(),
        );

        tracing::info!(
            device = %capabilities.summary(),
            ?strategy,
            granularity = capabilities.buffer_image_granularity,
            "Device created"
        );

        let shared = SharedState {
            arena: ResourceArena::new(),
            submissions: SubmissionTracker::new(),
            fences: FencePool::new(),
            semaphores: SemaphorePool::new(),
            staging: StagingPool::new(config.min_staging_size, config.max_pooled_staging_buffers),
        };

        Ok(Arc::new(Self {
            raw,
            physical_device,
            queue,
            queue_family,
            capabilities,
            strategy,
            config,
            shared: Mutex::new(shared),
            allocator: Mutex::new(allocator),
        }))
    }

    /// Get the Vulkan device handle.
    pub fn raw(&self) -> &ash::Device {
        &self.raw
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Barrier form selected at creation.
    pub fn barrier_strategy(&self) -> BarrierStrategy {
        self.strategy
    }

    /// Create a buffer and register it in the arena.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<ResourceHandle> {
        let buffer = self.create_raw_buffer(desc.size, desc.usage, desc.location)?;
        let handle = self.shared.lock().arena.insert(Resource::Buffer(buffer));
        tracing::trace!(?handle, size = desc.size, "Buffer created");
        Ok(handle)
    }

    fn create_raw_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Buffer> {
        if size == 0 {
            return Err(VkError::InvalidState("Buffer size must be non-zero".to_string()));
        }
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { self.raw.create_buffer(&buffer_info, None)? };

        let info = vk::BufferMemoryRequirementsInfo2::default().buffer(raw);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements2 = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        unsafe {
            self.raw
                .get_buffer_memory_requirements2(&info, &mut requirements2);
        }
        let requirements = requirements2.memory_requirements;
        let wants_dedicated = dedicated.requires_dedicated_allocation == vk::TRUE
            || dedicated.prefers_dedicated_allocation == vk::TRUE;

        let mut request = AllocationRequest::new(
            requirements.memory_type_bits,
            location.properties(),
            location.is_host_mapped(),
            requirements.size,
            requirements.alignment,
        );
        if wants_dedicated {
            request = request.dedicated(Some(DedicatedTarget::Buffer(raw)));
        }

        let memory = match self.allocator.lock().allocate(&request) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.raw.destroy_buffer(raw, None) };
                return Err(err);
            }
        };
        if let Err(err) = unsafe { self.raw.bind_buffer_memory(raw, memory.memory, memory.offset) } {
            unsafe { self.raw.destroy_buffer(raw, None) };
            self.allocator.lock().free(memory);
            return Err(err.into());
        }

        Ok(Buffer {
            raw,
            size,
            usage,
            memory,
        })
    }

    /// Create a device-local 2D image and register it in the arena.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn create_image(&self, desc: &ImageDesc) -> Result<ResourceHandle> {
        let extent = vk::Extent3D {
            width: desc.extent.width,
            height: desc.extent.height,
            depth: 1,
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { self.raw.create_image(&image_info, None)? };

        let info = vk::ImageMemoryRequirementsInfo2::default().image(raw);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements2 = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        unsafe {
            self.raw
                .get_image_memory_requirements2(&info, &mut requirements2);
        }
        let requirements = requirements2.memory_requirements;
        let wants_dedicated = dedicated.requires_dedicated_allocation == vk::TRUE
            || dedicated.prefers_dedicated_allocation == vk::TRUE;

        let mut request = AllocationRequest::new(
            requirements.memory_type_bits,
            MemoryLocation::GpuOnly.properties(),
            false,
            requirements.size,
            requirements.alignment,
        );
        if wants_dedicated {
            request = request.dedicated(Some(DedicatedTarget::Image(raw)));
        }

        let memory = match self.allocator.lock().allocate(&request) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.raw.destroy_image(raw, None) };
                return Err(err);
            }
        };
        if let Err(err) = unsafe { self.raw.bind_image_memory(raw, memory.memory, memory.offset) } {
            unsafe { self.raw.destroy_image(raw, None) };
            self.allocator.lock().free(memory);
            return Err(err.into());
        }

        let image = Image {
            raw,
            format: desc.format,
            extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            usage: desc.usage,
            aspect: aspect_for_format(desc.format),
            memory,
        };
        let handle = self.shared.lock().arena.insert(Resource::Image(image));
        tracing::trace!(?handle, ?desc.format, "Image created");
        Ok(handle)
    }

    /// Destroy a resource, deferring until its last in-flight submission completes.
    pub fn destroy_resource(&self, handle: ResourceHandle) -> Result<()> {
        let mut shared = self.shared.lock();
        if let Some(resource) = shared.arena.request_destroy(handle)? {
            self.destroy_now(resource);
        }
        Ok(())
    }

    fn destroy_now(&self, resource: Resource) {
        let block = unsafe { resource.destroy(&self.raw) };
        self.allocator.lock().free(block);
    }

    fn destroy_raw_buffer(&self, buffer: Buffer) {
        unsafe { self.raw.destroy_buffer(buffer.raw, None) };
        self.allocator.lock().free(buffer.memory);
    }

    /// Barrier target and (mips, layers) of a live resource.
    pub(crate) fn describe(&self, handle: ResourceHandle) -> Result<(BarrierTarget, (u32, u32))> {
        let shared = self.shared.lock();
        let resource = shared.arena.get(handle)?;
        Ok((resource.barrier_target(), resource.subresource_counts()))
    }

    /// Native buffer behind a handle.
    pub fn raw_buffer(&self, handle: ResourceHandle) -> Result<vk::Buffer> {
        Ok(self.shared.lock().arena.buffer(handle)?.raw)
    }

    /// Native image behind a handle, for creating views.
    pub fn raw_image(&self, handle: ResourceHandle) -> Result<vk::Image> {
        Ok(self.shared.lock().arena.image(handle)?.raw)
    }

    /// Take a host-mapped transfer-source buffer of at least `size` bytes.
    pub(crate) fn acquire_staging(&self, size: u64) -> Result<Buffer> {
        let create_size = {
            let mut shared = self.shared.lock();
            if let Some(buffer) = shared.staging.acquire(size) {
                return Ok(buffer);
            }
            shared.staging.size_for(size)
        };
        tracing::debug!(requested = size, size = create_size, "Creating staging buffer");
        self.create_raw_buffer(
            create_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )
    }

    /// Return staging buffers no pending work uses.
    pub(crate) fn recycle_staging(&self, buffers: Vec<Buffer>) {
        let mut shared = self.shared.lock();
        for buffer in buffers {
            if let Some(rejected) = shared.staging.release(buffer) {
                self.destroy_raw_buffer(rejected);
            }
        }
    }

    /// Write into a host-mapped buffer from the CPU.
    ///
    /// The write is recorded as the buffer's last writer, so the next GPU access
    /// waits on it. Fails while a submission still uses the buffer.
    pub fn write_buffer(&self, handle: ResourceHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut shared = self.shared.lock();
        let buffer = shared.arena.buffer(handle)?;
        if buffer.mapped_ptr().is_none() {
            return Err(VkError::NotHostMapped(handle));
        }
        if shared.arena.in_flight(handle).unwrap_or(0) > 0 {
            return Err(VkError::InvalidState(format!(
                "Buffer {handle:?} is used by an in-flight submission"
            )));
        }
        buffer.write_bytes(offset, data)?;

        let (_, sync) = shared.arena.sync_mut(handle)?;
        try_build_barrier(sync.get_mut(0, 0), &SyncRequest::host_write(), false);
        Ok(())
    }

    /// Submit an ended command list.
    ///
    /// The list's recorded effects are reconciled with global state in lock
    /// order, the resulting barriers are recorded into the list's sync command
    /// buffer, and sync then main buffers go out in one queue submission. Global
    /// state only changes once the queue accepted the work.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, list: &mut CommandList, options: &SubmitOptions) -> Result<SubmissionInfo> {
        let (main, sync) = list.recorded()?;

        let mut guard = self.shared.lock();
        let shared = &mut *guard;

        let commit = commit_recording(&shared.arena, list.tracker())?;
        unsafe {
            begin_command_buffer(&self.raw, sync, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            if let Some(batch) = BarrierBatch::build(self.strategy, commit.barriers()) {
                batch.record(&self.raw, sync);
            }
            end_command_buffer(&self.raw, sync)?;
        }
        let barrier_count = commit.barriers().len();

        let (fence, fence_pooled) = match options.fence {
            Some(fence) => (fence, false),
            None => (unsafe { shared.fences.acquire(&self.raw)? }, true),
        };
        let signal_semaphore = if options.signal_semaphore {
            match unsafe { shared.semaphores.acquire(&self.raw) } {
                Ok(semaphore) => Some(semaphore),
                Err(err) => {
                    if fence_pooled {
                        shared.fences.release(fence);
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let handles = list.tracker().handles();
        for handle in handles {
            shared.arena.retain(*handle)?;
        }

        let wait_semaphores: Vec<vk::Semaphore> =
            options.wait_semaphores.iter().map(|(semaphore, _)| *semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> =
            options.wait_semaphores.iter().map(|(_, stage)| *stage).collect();
        let signal_semaphores: Vec<vk::Semaphore> = signal_semaphore.into_iter().collect();

        let submitted = unsafe {
            submit_command_buffers(
                &self.raw,
                self.queue,
                &[sync, main],
                &wait_semaphores,
                &wait_stages,
                &signal_semaphores,
                fence,
            )
        };
        if let Err(err) = submitted {
            for handle in handles {
                if let Some(resource) = shared.arena.release(*handle) {
                    self.destroy_now(resource);
                }
            }
            if fence_pooled {
                shared.fences.release(fence);
            }
            if let Some(semaphore) = signal_semaphore {
                shared.semaphores.release(semaphore);
            }
            return Err(err);
        }
        // Every touched resource is retained, so none can have been destroyed.
        if let Err(err) = commit.apply(&mut shared.arena) {
            tracing::warn!(%err, "Failed to publish committed sync state");
        }

        let submission = list.into_in_flight(fence, fence_pooled);
        tracing::trace!(
            ?fence,
            barriers = barrier_count,
            resources = submission.resources.len(),
            "Submitted command list"
        );
        shared.submissions.push(submission);

        Ok(SubmissionInfo {
            fence,
            signal_semaphore,
        })
    }

    /// Release everything retired submissions held. Returns their callbacks,
    /// which the caller runs after dropping the lock.
    fn finish_submissions(
        &self,
        shared: &mut SharedState,
        done: Vec<InFlightSubmission>,
    ) -> Vec<CompletionCallback> {
        let mut callbacks = Vec::new();
        for mut submission in done {
            if submission.fence_pooled {
                shared.fences.release(submission.fence);
            }
            match &submission.recycle {
                Some(recycle) => recycle.lock().append(&mut submission.command_buffers),
                None if !submission.command_buffers.is_empty() => {
                    tracing::warn!(
                        count = submission.command_buffers.len(),
                        "Retired command buffers have no pool to return to"
                    );
                }
                None => {}
            }
            for handle in submission.resources.drain(..) {
                if let Some(resource) = shared.arena.release(handle) {
                    self.destroy_now(resource);
                }
            }
            for staging in submission.staging.drain(..) {
                if let Some(rejected) = shared.staging.release(staging) {
                    self.destroy_raw_buffer(rejected);
                }
            }
            if let Some(completion) = &submission.completion {
                completion.store(true, Ordering::Release);
            }
            if let Some(callback) = submission.on_complete.take() {
                callbacks.push(callback);
            }
        }
        callbacks
    }

    /// Retire every submission whose fence has signaled, without blocking.
    ///
    /// Returns the number of retired submissions.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn poll_completions(&self) -> Result<usize> {
        let (count, callbacks) = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            let raw = &self.raw;
            let done = shared
                .submissions
                .retire(|fence| unsafe { FencePool::is_signaled(raw, fence) })?;
            let count = done.len();
            (count, self.finish_submissions(shared, done))
        };
        for callback in callbacks {
            callback();
        }
        Ok(count)
    }

    /// Block until the submission using `fence` completes, then retire it and
    /// everything submitted before it.
    ///
    /// Returns immediately for fences that are not in flight.
    pub fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        if !self.shared.lock().submissions.contains(fence) {
            return Ok(());
        }
        unsafe { FencePool::wait(&self.raw, fence, self.config.fence_wait_timeout_ns)? };

        let callbacks = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            let done = shared.submissions.retire_through(fence);
            self.finish_submissions(shared, done)
        };
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    /// Wait for the device to go idle and retire everything.
    pub fn wait_idle(&self) -> Result<()> {
        let callbacks = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            unsafe { self.raw.device_wait_idle()? };
            let done = shared.submissions.retire_all();
            self.finish_submissions(shared, done)
        };
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    /// Make a host-mapped buffer's contents visible to the host and map it.
    ///
    /// Submits a list holding only the host-read barrier and waits for it. The
    /// buffer cannot be destroyed or written while the returned guard lives.
    pub fn map_for_read(&self, handle: ResourceHandle) -> Result<MappedRead<'_>> {
        {
            let shared = self.shared.lock();
            if shared.arena.buffer(handle)?.mapped_ptr().is_none() {
                return Err(VkError::NotHostMapped(handle));
            }
        }

        let mut list = CommandList::new(self)?;
        let result = self
            .submit_host_read(&mut list, handle)
            .and_then(|fence| self.wait_for_fence(fence));
        if list.phase() == RecordingPhase::Submitted {
            tracing::warn!(?handle, "Readback submission unfinished, leaking its command pool");
        } else {
            unsafe { list.destroy(self) };
        }
        result?;

        let mut shared = self.shared.lock();
        shared.arena.retain(handle)?;
        let buffer = shared.arena.buffer(handle)?;
        let ptr = buffer.mapped_ptr().ok_or(VkError::NotHostMapped(handle))?;
        Ok(MappedRead {
            device: self,
            handle,
            ptr,
            len: buffer.size as usize,
        })
    }

    fn submit_host_read(&self, list: &mut CommandList, handle: ResourceHandle) -> Result<vk::Fence> {
        list.begin(self)?;
        list.sync_buffer(self, handle, &SyncRequest::host_read())?;
        list.end(self)?;
        Ok(self.submit(list, &SubmitOptions::default())?.fence)
    }

    /// Copy a host-mapped buffer's contents out after all prior GPU work on it.
    pub fn read_buffer(&self, handle: ResourceHandle) -> Result<Vec<u8>> {
        let mapped = self.map_for_read(handle)?;
        Ok(mapped.as_slice().to_vec())
    }

    /// Return a semaphore obtained from [`SubmitOptions::with_signal_semaphore`].
    pub fn recycle_semaphore(&self, semaphore: vk::Semaphore) {
        self.shared.lock().semaphores.release(semaphore);
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.lock().stats()
    }

    pub fn stats(&self) -> DeviceStats {
        let shared = self.shared.lock();
        let (submitted, retired) = shared.submissions.totals();
        DeviceStats {
            in_flight_submissions: shared.submissions.len(),
            submitted,
            retired,
            resources: shared.arena.len(),
            deferred_destructions: shared.arena.deferred().len(),
            pooled_fences: shared.fences.idle_count(),
            pooled_semaphores: shared.semaphores.idle_count(),
            pooled_staging_buffers: shared.staging.idle_count(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let callbacks = {
            let mut guard = self.shared.lock();
            let shared = &mut *guard;
            if let Err(err) = unsafe { self.raw.device_wait_idle() } {
                tracing::warn!(%err, "device_wait_idle failed during shutdown");
            }
            let done = shared.submissions.retire_all();
            let callbacks = self.finish_submissions(shared, done);

            for resource in shared.arena.drain() {
                self.destroy_now(resource);
            }
            for buffer in shared.staging.drain() {
                self.destroy_raw_buffer(buffer);
            }
            unsafe {
                shared.fences.destroy(&self.raw);
                shared.semaphores.destroy(&self.raw);
            }
            callbacks
        };
        for callback in callbacks {
            callback();
        }

        // Free every chunk before the device goes away.
        self.allocator.lock().shutdown();
        unsafe { self.raw.destroy_device(None) };
        tracing::info!("Device destroyed");
    }
}

/// Host view of a buffer made visible by [`Device::map_for_read`].
pub struct MappedRead<'a> {
    device: &'a Device,
    handle: ResourceHandle,
    ptr: *mut u8,
    len: usize,
}

impl MappedRead<'_> {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer is retained, so it is not destroyed while the guard
        // lives, and its mapping covers `len` bytes. Work submitted after the
        // guard was created may still write the buffer.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Reinterpret the contents as typed elements; trailing bytes that do not
    /// fill a whole element are ignored.
    pub fn cast<T: bytemuck::Pod>(&self) -> Result<&[T]> {
        cast_whole_elements(self.as_slice())
    }
}

fn cast_whole_elements<T: bytemuck::Pod>(bytes: &[u8]) -> Result<&[T]> {
    let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>().max(1);
    bytemuck::try_cast_slice(&bytes[..whole]).map_err(|err| {
        VkError::InvalidState(format!(
            "Cannot view mapped bytes as {}: {err}",
            std::any::type_name::<T>()
        ))
    })
}

impl Drop for MappedRead<'_> {
    fn drop(&mut self) {
        let mut shared = self.device.shared.lock();
        if let Some(resource) = shared.arena.release(self.handle) {
            self.device.destroy_now(resource);
        }
    }
}

impl std::fmt::Debug for MappedRead<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRead")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn submit_options_builder() {
        let options = SubmitOptions::new()
            .with_fence(vk::Fence::from_raw(9))
            .with_signal_semaphore()
            .with_wait(vk::Semaphore::from_raw(4), vk::PipelineStageFlags::TRANSFER);
        assert_eq!(options.fence, Some(vk::Fence::from_raw(9)));
        assert!(options.signal_semaphore);
        assert_eq!(
            options.wait_semaphores,
            vec![(vk::Semaphore::from_raw(4), vk::PipelineStageFlags::TRANSFER)]
        );
        assert!(SubmitOptions::default().fence.is_none());
    }

    #[test]
    fn mapped_bytes_cast_checks_alignment() {
        let words = [1u32, 2, 3, 4];
        let bytes: &[u8] = bytemuck::cast_slice(&words);

        assert_eq!(cast_whole_elements::<u32>(&bytes[..9]).unwrap(), &[1, 2]);
        assert!(cast_whole_elements::<u32>(&bytes[..3]).unwrap().is_empty());
        assert!(matches!(
            cast_whole_elements::<u32>(&bytes[1..]),
            Err(VkError::InvalidState(_))
        ));
    }
}
