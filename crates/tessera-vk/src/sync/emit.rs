//! Translation of queued barriers into native barrier commands.

use ash::vk;

use super::access::{legacy_access, legacy_stages};
use super::pending::{BarrierTarget, PendingBarrier};

/// Native barrier ABI, chosen once per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierStrategy {
    /// `vkCmdPipelineBarrier` with one stage pair for the whole batch.
    Legacy,
    /// `vkCmdPipelineBarrier2` with per-barrier 64-bit stage/access masks.
    Synchronization2,
}

impl BarrierStrategy {
    pub fn select(supports_synchronization2: bool, force_legacy: bool) -> Self {
        if supports_synchronization2 && !force_legacy {
            Self::Synchronization2
        } else {
            Self::Legacy
        }
    }
}

/// One flush point's worth of native barriers.
#[derive(Debug, Clone)]
pub enum BarrierBatch {
    Legacy {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffers: Vec<vk::BufferMemoryBarrier<'static>>,
        images: Vec<vk::ImageMemoryBarrier<'static>>,
    },
    Synchronization2 {
        buffers: Vec<vk::BufferMemoryBarrier2<'static>>,
        images: Vec<vk::ImageMemoryBarrier2<'static>>,
    },
}

impl BarrierBatch {
    /// Build the native form of `barriers`, or `None` if there is nothing to emit.
    ///
    /// The legacy form unions every barrier's stages into a single source and
    /// destination mask for the whole batch.
    pub fn build(strategy: BarrierStrategy, barriers: &[PendingBarrier]) -> Option<Self> {
        if barriers.is_empty() {
            return None;
        }

        match strategy {
            BarrierStrategy::Legacy => {
                let mut src_stage = vk::PipelineStageFlags2::NONE;
                let mut dst_stage = vk::PipelineStageFlags2::NONE;
                let mut buffers = Vec::new();
                let mut images = Vec::new();

                for barrier in barriers {
                    let info = &barrier.info;
                    src_stage |= info.src.stage;
                    dst_stage |= info.dst.stage;
                    let src_access = legacy_access(info.src.access);
                    let dst_access = legacy_access(info.dst.access);

                    match barrier.target {
                        BarrierTarget::Buffer { buffer } => buffers.push(
                            vk::BufferMemoryBarrier::default()
                                .src_access_mask(src_access)
                                .dst_access_mask(dst_access)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .buffer(buffer)
                                .offset(0)
                                .size(vk::WHOLE_SIZE),
                        ),
                        BarrierTarget::Image { image, aspect } => images.push(
                            vk::ImageMemoryBarrier::default()
                                .src_access_mask(src_access)
                                .dst_access_mask(dst_access)
                                .old_layout(info.old_layout)
                                .new_layout(info.new_layout)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .image(image)
                                .subresource_range(barrier.range.to_vk(aspect)),
                        ),
                    }
                }

                let mut src_stage = legacy_stages(src_stage);
                if src_stage.is_empty() {
                    src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
                }
                let mut dst_stage = legacy_stages(dst_stage);
                if dst_stage.is_empty() {
                    dst_stage = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
                }

                Some(Self::Legacy {
                    src_stage,
                    dst_stage,
                    buffers,
                    images,
                })
            }
            BarrierStrategy::Synchronization2 => {
                let mut buffers = Vec::new();
                let mut images = Vec::new();

                for barrier in barriers {
                    let info = &barrier.info;
                    match barrier.target {
                        BarrierTarget::Buffer { buffer } => buffers.push(
                            vk::BufferMemoryBarrier2::default()
                                .src_stage_mask(info.src.stage)
                                .src_access_mask(info.src.access)
                                .dst_stage_mask(info.dst.stage)
                                .dst_access_mask(info.dst.access)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .buffer(buffer)
                                .offset(0)
                                .size(vk::WHOLE_SIZE),
                        ),
                        BarrierTarget::Image { image, aspect } => images.push(
                            vk::ImageMemoryBarrier2::default()
                                .src_stage_mask(info.src.stage)
                                .src_access_mask(info.src.access)
                                .dst_stage_mask(info.dst.stage)
                                .dst_access_mask(info.dst.access)
                                .old_layout(info.old_layout)
                                .new_layout(info.new_layout)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .image(image)
                                .subresource_range(barrier.range.to_vk(aspect)),
                        ),
                    }
                }

                Some(Self::Synchronization2 { buffers, images })
            }
        }
    }

    /// Number of buffer and image barriers in the batch.
    pub fn len(&self) -> usize {
        match self {
            Self::Legacy {
                buffers, images, ..
            } => buffers.len() + images.len(),
            Self::Synchronization2 { buffers, images } => buffers.len() + images.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the batch as a single barrier command.
    ///
    /// # Safety
    /// The device and command buffer must be valid, the command buffer must be
    /// recording, and every buffer/image in the batch must be alive.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        match self {
            Self::Legacy {
                src_stage,
                dst_stage,
                buffers,
                images,
            } => device.cmd_pipeline_barrier(
                cmd,
                *src_stage,
                *dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffers,
                images,
            ),
            Self::Synchronization2 { buffers, images } => {
                let dependency_info = vk::DependencyInfo::default()
                    .buffer_memory_barriers(buffers)
                    .image_memory_barriers(images);
                device.cmd_pipeline_barrier2(cmd, &dependency_info);
            }
        }
    }
}
