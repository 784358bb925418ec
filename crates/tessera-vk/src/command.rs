//! Command pools and command lists.
//!
//! A [`CommandList`] records into its own pool, so lists can record on
//! independent threads. Every recording operation syncs its operands against
//! the list's local state and flushes the resulting barriers right before its
//! own command.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::device::Device;
use crate::error::{Result, VkError};
use crate::recording::{LocalTracker, RecordingPhase, RecordingState};
use crate::resource::{Buffer, ResourceHandle};
use crate::submission::{CompletionCallback, InFlightSubmission};
use crate::sync::{BarrierBatch, BarrierTarget, SubresourceRange, SyncRequest};

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self { pool, queue_family })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_command_buffers(
        &self,
        device: &ash::Device,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers)
    }

    /// Destroy the command pool, freeing every buffer allocated from it.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

/// Subresources touched by a buffer/image copy region.
fn region_range(layers: &vk::ImageSubresourceLayers, array_layers: u32) -> SubresourceRange {
    let layer_count = if layers.layer_count == vk::REMAINING_ARRAY_LAYERS {
        array_layers.saturating_sub(layers.base_array_layer)
    } else {
        layers.layer_count
    };
    SubresourceRange::new(layers.mip_level, 1, layers.base_array_layer, layer_count)
}

/// A color attachment for [`CommandList::begin_rendering`].
#[derive(Clone, Copy)]
pub struct ColorAttachment {
    pub image: ResourceHandle,
    pub view: vk::ImageView,
    /// Subresources the view covers.
    pub range: SubresourceRange,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearColorValue,
}

// `vk::ClearColorValue` is a union and has no `Debug` impl.
impl std::fmt::Debug for ColorAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColorAttachment")
            .field("image", &self.image)
            .field("view", &self.view)
            .field("range", &self.range)
            .field("load_op", &self.load_op)
            .field("store_op", &self.store_op)
            .finish_non_exhaustive()
    }
}

impl ColorAttachment {
    /// Clear-and-store attachment over mip 0, layer 0.
    pub fn new(image: ResourceHandle, view: vk::ImageView) -> Self {
        Self {
            image,
            view,
            range: SubresourceRange::single(0, 0),
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: vk::ClearColorValue::default(),
        }
    }

    pub fn with_clear(mut self, rgba: [f32; 4]) -> Self {
        self.clear_value = vk::ClearColorValue { float32: rgba };
        self
    }

    pub fn with_ops(mut self, load_op: vk::AttachmentLoadOp, store_op: vk::AttachmentStoreOp) -> Self {
        self.load_op = load_op;
        self.store_op = store_op;
        self
    }
}

/// A depth attachment for [`CommandList::begin_rendering`].
#[derive(Debug, Clone, Copy)]
pub struct DepthAttachment {
    pub image: ResourceHandle,
    pub view: vk::ImageView,
    pub range: SubresourceRange,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearDepthStencilValue,
}

impl DepthAttachment {
    /// Attachment cleared to depth 1.0 and stored.
    pub fn new(image: ResourceHandle, view: vk::ImageView) -> Self {
        Self {
            image,
            view,
            range: SubresourceRange::single(0, 0),
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        }
    }
}

/// Parameters of a dynamic rendering pass.
#[derive(Debug, Clone, Copy)]
pub struct RenderingDesc<'a> {
    pub render_area: vk::Rect2D,
    pub color_attachments: &'a [ColorAttachment],
    pub depth_attachment: Option<DepthAttachment>,
}

/// Records commands with automatic barrier placement.
pub struct CommandList {
    pool: CommandPool,
    /// Retired command buffers, returned by the device when a submission completes.
    recycle: Arc<Mutex<Vec<vk::CommandBuffer>>>,
    /// (main, sync) buffers of the current recording.
    buffers: Option<(vk::CommandBuffer, vk::CommandBuffer)>,
    state: RecordingState,
    staging: Vec<Buffer>,
    on_complete: Option<CompletionCallback>,
}

impl CommandList {
    /// Create a command list with its own pool on the device's queue family.
    pub fn new(device: &Device) -> Result<Self> {
        let pool = unsafe {
            CommandPool::new(
                device.raw(),
                device.queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        Ok(Self {
            pool,
            recycle: Arc::new(Mutex::new(Vec::new())),
            buffers: None,
            state: RecordingState::new(),
            staging: Vec::new(),
            on_complete: None,
        })
    }

    pub fn phase(&self) -> RecordingPhase {
        self.state.phase()
    }

    /// Main command buffer of the current recording, for binding pipelines and
    /// descriptor sets.
    pub fn raw(&self) -> Option<vk::CommandBuffer> {
        self.buffers.map(|(main, _)| main)
    }

    /// Start a new recording.
    ///
    /// A list that was ended but never submitted is discarded and its buffers reused.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin(&mut self, device: &Device) -> Result<()> {
        self.state.begin()?;

        if !self.staging.is_empty() {
            device.recycle_staging(std::mem::take(&mut self.staging));
        }
        self.on_complete = None;

        let (main, _) = match self.buffers {
            Some(buffers) => buffers,
            None => {
                let buffers = self.acquire_buffers(device)?;
                self.buffers = Some(buffers);
                buffers
            }
        };

        unsafe {
            begin_command_buffer(
                device.raw(),
                main,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            )?;
        }
        Ok(())
    }

    fn acquire_buffers(&self, device: &Device) -> Result<(vk::CommandBuffer, vk::CommandBuffer)> {
        let mut recycled = self.recycle.lock();
        if recycled.len() >= 2 {
            if let (Some(main), Some(sync)) = (recycled.pop(), recycled.pop()) {
                return Ok((main, sync));
            }
        }
        drop(recycled);

        let buffers = unsafe { self.pool.allocate_command_buffers(device.raw(), 2)? };
        match buffers.as_slice() {
            [main, sync] => Ok((*main, *sync)),
            _ => Err(VkError::InvalidState(
                "Command buffer allocation returned the wrong count".to_string(),
            )),
        }
    }

    fn main_buffer(&self, operation: &'static str) -> Result<vk::CommandBuffer> {
        self.state.ensure_recording(operation)?;
        self.raw().ok_or(VkError::InvalidRecordingState {
            operation,
            state: "without command buffers",
        })
    }

    /// Sync `range` of a resource for `request`.
    ///
    /// Returns whether barriers are queued and must be flushed before the access.
    pub fn sync_resource(
        &mut self,
        device: &Device,
        handle: ResourceHandle,
        range: SubresourceRange,
        request: &SyncRequest,
    ) -> Result<bool> {
        self.state.ensure_recording("sync")?;
        let (target, counts) = device.describe(handle)?;
        self.state.sync(handle, target, counts, range, request)
    }

    /// Sync a whole buffer.
    pub fn sync_buffer(
        &mut self,
        device: &Device,
        handle: ResourceHandle,
        request: &SyncRequest,
    ) -> Result<bool> {
        self.state.ensure_recording("sync")?;
        let (target, counts) = device.describe(handle)?;
        if !matches!(target, BarrierTarget::Buffer { .. }) {
            return Err(VkError::WrongResourceKind {
                handle,
                expected: "buffer",
            });
        }
        self.state
            .sync(handle, target, counts, SubresourceRange::WHOLE_BUFFER, request)
    }

    /// Sync every subresource of an image.
    pub fn sync_image(
        &mut self,
        device: &Device,
        handle: ResourceHandle,
        request: &SyncRequest,
    ) -> Result<bool> {
        self.state.ensure_recording("sync")?;
        let (target, (mips, layers)) = device.describe(handle)?;
        if !matches!(target, BarrierTarget::Image { .. }) {
            return Err(VkError::WrongResourceKind {
                handle,
                expected: "image",
            });
        }
        let range = SubresourceRange::new(0, mips, 0, layers);
        self.state.sync(handle, target, (mips, layers), range, request)
    }

    /// Record every queued barrier as one batched barrier command.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn emit_queued_barriers(&mut self, device: &Device) -> Result<()> {
        let main = self.main_buffer("emit barriers")?;
        self.flush(device, main);
        Ok(())
    }

    fn flush(&mut self, device: &Device, cmd: vk::CommandBuffer) {
        if !self.state.has_pending() {
            return;
        }
        let pending = self.state.take_pending();
        if let Some(batch) = BarrierBatch::build(device.barrier_strategy(), &pending) {
            tracing::trace!(barriers = batch.len(), "Flushing barriers");
            unsafe { batch.record(device.raw(), cmd) };
        }
    }

    /// Flush remaining barriers and close the main command buffer.
    pub fn end(&mut self, device: &Device) -> Result<()> {
        let main = self.main_buffer("end")?;
        self.flush(device, main);
        self.state.end()?;
        unsafe { end_command_buffer(device.raw(), main)? };
        Ok(())
    }

    /// Run `callback` once the submission of this recording has completed.
    pub fn on_complete(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_complete = Some(Box::new(callback));
    }

    /// Copy regions between two buffers.
    pub fn copy_buffer(
        &mut self,
        device: &Device,
        src: ResourceHandle,
        dst: ResourceHandle,
        regions: &[vk::BufferCopy],
    ) -> Result<()> {
        let main = self.main_buffer("copy_buffer")?;
        self.sync_buffer(device, src, &SyncRequest::transfer_read())?;
        self.sync_buffer(device, dst, &SyncRequest::transfer_write())?;
        self.flush(device, main);

        let src = device.raw_buffer(src)?;
        let dst = device.raw_buffer(dst)?;
        unsafe { device.raw().cmd_copy_buffer(main, src, dst, regions) };
        Ok(())
    }

    /// Fill `size` bytes at `offset` with a repeated 32-bit word.
    pub fn fill_buffer(
        &mut self,
        device: &Device,
        dst: ResourceHandle,
        offset: u64,
        size: u64,
        data: u32,
    ) -> Result<()> {
        let main = self.main_buffer("fill_buffer")?;
        self.sync_buffer(device, dst, &SyncRequest::clear_write())?;
        self.flush(device, main);

        let dst = device.raw_buffer(dst)?;
        unsafe { device.raw().cmd_fill_buffer(main, dst, offset, size, data) };
        Ok(())
    }

    /// Upload `data` to `dst` at `offset` through a pooled staging buffer.
    pub fn update_buffer(
        &mut self,
        device: &Device,
        dst: ResourceHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let main = self.main_buffer("update_buffer")?;
        if data.is_empty() {
            return Ok(());
        }
        self.sync_buffer(device, dst, &SyncRequest::transfer_write())?;

        let staging = device.acquire_staging(data.len() as u64)?;
        if let Err(err) = staging.write_bytes(0, data) {
            device.recycle_staging(vec![staging]);
            return Err(err);
        }
        self.flush(device, main);

        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(offset)
            .size(data.len() as u64);
        let dst = device.raw_buffer(dst)?;
        unsafe {
            device
                .raw()
                .cmd_copy_buffer(main, staging.raw, dst, std::slice::from_ref(&region));
        }
        self.staging.push(staging);
        Ok(())
    }

    /// Copy buffer data into image subresources, transitioning them to
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_image(
        &mut self,
        device: &Device,
        src: ResourceHandle,
        dst: ResourceHandle,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        let main = self.main_buffer("copy_buffer_to_image")?;
        self.sync_buffer(device, src, &SyncRequest::transfer_read())?;
        let (target, counts) = device.describe(dst)?;
        let request =
            SyncRequest::transfer_write().with_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        for region in regions {
            let range = region_range(&region.image_subresource, counts.1);
            self.state.sync(dst, target, counts, range, &request)?;
        }
        self.flush(device, main);

        let src = device.raw_buffer(src)?;
        let dst = device.raw_image(dst)?;
        unsafe {
            device.raw().cmd_copy_buffer_to_image(
                main,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            );
        }
        Ok(())
    }

    /// Copy image subresources into a buffer, transitioning them to
    /// `TRANSFER_SRC_OPTIMAL`.
    pub fn copy_image_to_buffer(
        &mut self,
        device: &Device,
        src: ResourceHandle,
        dst: ResourceHandle,
        regions: &[vk::BufferImageCopy],
    ) -> Result<()> {
        let main = self.main_buffer("copy_image_to_buffer")?;
        let (target, counts) = device.describe(src)?;
        let request =
            SyncRequest::transfer_read().with_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        for region in regions {
            let range = region_range(&region.image_subresource, counts.1);
            self.state.sync(src, target, counts, range, &request)?;
        }
        self.sync_buffer(device, dst, &SyncRequest::transfer_write())?;
        self.flush(device, main);

        let src = device.raw_image(src)?;
        let dst = device.raw_buffer(dst)?;
        unsafe {
            device.raw().cmd_copy_image_to_buffer(
                main,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                regions,
            );
        }
        Ok(())
    }

    /// Dispatch compute work. Resources the bound pipeline uses must have been
    /// synced with [`sync_resource`](Self::sync_resource) beforehand.
    pub fn dispatch(&mut self, device: &Device, x: u32, y: u32, z: u32) -> Result<()> {
        let main = self.main_buffer("dispatch")?;
        if self.state.in_render_pass() {
            return Err(VkError::InvalidRecordingState {
                operation: "dispatch",
                state: "inside a render pass",
            });
        }
        self.flush(device, main);
        unsafe { device.raw().cmd_dispatch(main, x, y, z) };
        Ok(())
    }

    /// Sync attachments, flush, and begin a dynamic rendering pass.
    pub fn begin_rendering(&mut self, device: &Device, desc: &RenderingDesc<'_>) -> Result<()> {
        let main = self.main_buffer("begin_rendering")?;
        if !device.capabilities().supports_dynamic_rendering {
            return Err(VkError::InvalidState(
                "Dynamic rendering is not supported by this device".to_string(),
            ));
        }

        for attachment in desc.color_attachments {
            self.sync_resource(
                device,
                attachment.image,
                attachment.range,
                &SyncRequest::color_attachment_write(),
            )?;
        }
        if let Some(depth) = &desc.depth_attachment {
            self.sync_resource(
                device,
                depth.image,
                depth.range,
                &SyncRequest::depth_attachment_write(),
            )?;
        }
        self.flush(device, main);

        let color_infos: Vec<vk::RenderingAttachmentInfo<'_>> = desc
            .color_attachments
            .iter()
            .map(|attachment| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(attachment.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(attachment.load_op)
                    .store_op(attachment.store_op)
                    .clear_value(vk::ClearValue {
                        color: attachment.clear_value,
                    })
            })
            .collect();
        let depth_info = desc.depth_attachment.map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(depth.load_op)
                .store_op(depth.store_op)
                .clear_value(vk::ClearValue {
                    depth_stencil: depth.clear_value,
                })
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(desc.render_area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth_info) = depth_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_info);
        }

        self.state.set_in_render_pass("begin_rendering", true)?;
        unsafe { device.raw().cmd_begin_rendering(main, &rendering_info) };
        Ok(())
    }

    pub fn end_rendering(&mut self, device: &Device) -> Result<()> {
        let main = self.main_buffer("end_rendering")?;
        self.state.set_in_render_pass("end_rendering", false)?;
        unsafe { device.raw().cmd_end_rendering(main) };
        Ok(())
    }

    /// Draw inside the current rendering pass.
    pub fn draw(
        &mut self,
        device: &Device,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        let main = self.main_buffer("draw")?;
        if !self.state.in_render_pass() {
            return Err(VkError::InvalidRecordingState {
                operation: "draw",
                state: "outside a render pass",
            });
        }
        unsafe {
            device.raw().cmd_draw(
                main,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
        Ok(())
    }

    /// Ended recording ready for submission: (main, sync) buffers.
    pub(crate) fn recorded(&self) -> Result<(vk::CommandBuffer, vk::CommandBuffer)> {
        self.state.ensure_ended()?;
        self.buffers.ok_or(VkError::InvalidRecordingState {
            operation: "submit",
            state: "without command buffers",
        })
    }

    pub(crate) fn tracker(&self) -> &LocalTracker {
        self.state.tracker()
    }

    /// Hand everything the submission holds over to it and mark the list submitted.
    pub(crate) fn into_in_flight(&mut self, fence: vk::Fence, fence_pooled: bool) -> InFlightSubmission {
        let mut submission = InFlightSubmission::new(fence, fence_pooled);
        if let Some((main, sync)) = self.buffers.take() {
            submission.command_buffers = vec![sync, main];
        }
        submission.recycle = Some(Arc::clone(&self.recycle));
        submission.resources = self.state.tracker().handles().to_vec();
        submission.staging = std::mem::take(&mut self.staging);
        submission.on_complete = self.on_complete.take();
        submission.completion = Some(self.state.mark_submitted());
        submission
    }

    /// Destroy the list's pool and return its staging buffers.
    ///
    /// # Safety
    /// No submission of this list may still be executing.
    pub unsafe fn destroy(&mut self, device: &Device) {
        if !self.staging.is_empty() {
            device.recycle_staging(std::mem::take(&mut self.staging));
        }
        self.buffers = None;
        self.recycle.lock().clear();
        self.pool.destroy(device.raw());
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("phase", &self.state.phase())
            .field("buffers", &self.buffers)
            .field("staging", &self.staging.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_range_covers_copied_layers() {
        let layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(2)
            .base_array_layer(1)
            .layer_count(3);
        assert_eq!(region_range(&layers, 6), SubresourceRange::new(2, 1, 1, 3));
    }

    #[test]
    fn region_range_resolves_remaining_layers() {
        let layers = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_array_layer(2)
            .layer_count(vk::REMAINING_ARRAY_LAYERS);
        assert_eq!(region_range(&layers, 6), SubresourceRange::new(0, 1, 2, 4));
    }

    #[test]
    fn color_attachment_defaults_clear_and_store() {
        let attachment = ColorAttachment::new(ResourceHandle::new(0, 0), vk::ImageView::null())
            .with_clear([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachment.range, SubresourceRange::single(0, 0));
        assert_eq!(unsafe { attachment.clear_value.float32 }, [1.0, 0.0, 0.0, 1.0]);
    }
}
