//! Stage/access masks and their classification.

use ash::vk;
use std::ops::{BitOr, BitOrAssign};

/// A pipeline stage mask paired with an access mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}

impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };

    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }

    /// No stages and no accesses.
    pub fn is_empty(&self) -> bool {
        self.stage.is_empty() && self.access.is_empty()
    }

    /// Whether any access bit is a write.
    pub fn is_write(&self) -> bool {
        self.access.intersects(WRITE_ACCESS)
    }

    /// Expand tessellation/geometry stages so any one of them implies all three.
    ///
    /// Some devices fuse these stages, so they are tracked as one.
    pub fn with_aliased_stages(mut self) -> Self {
        if self.stage.intersects(PRE_RASTER_ALIASED) {
            self.stage |= PRE_RASTER_ALIASED;
        }
        self
    }
}

/// Access bits that modify memory.
pub const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw()
        | vk::AccessFlags2::TRANSFORM_FEEDBACK_WRITE_EXT.as_raw()
        | vk::AccessFlags2::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT.as_raw(),
);

const PRE_RASTER_ALIASED: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER.as_raw()
        | vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER.as_raw()
        | vk::PipelineStageFlags2::GEOMETRY_SHADER.as_raw(),
);

const LEGACY_MASK: u64 = 0xFFFF_FFFF;

/// Narrow a 64-bit stage mask to the legacy 32-bit form.
///
/// Split stages fold back into their legacy parents; anything without a legacy
/// equivalent widens to `ALL_COMMANDS`.
pub fn legacy_stages(stages: vk::PipelineStageFlags2) -> vk::PipelineStageFlags {
    use vk::PipelineStageFlags as Legacy;
    use vk::PipelineStageFlags2 as S;

    let raw = stages.as_raw();
    let mut legacy = Legacy::from_raw((raw & LEGACY_MASK) as u32);
    let mut high = S::from_raw(raw & !LEGACY_MASK);
    if high.is_empty() {
        return legacy;
    }

    let transfer = S::COPY | S::RESOLVE | S::BLIT | S::CLEAR;
    if high.intersects(transfer) {
        legacy |= Legacy::TRANSFER;
        high &= !transfer;
    }
    let vertex_input = S::INDEX_INPUT | S::VERTEX_ATTRIBUTE_INPUT;
    if high.intersects(vertex_input) {
        legacy |= Legacy::VERTEX_INPUT;
        high &= !vertex_input;
    }
    if high.intersects(S::PRE_RASTERIZATION_SHADERS) {
        legacy |= Legacy::VERTEX_SHADER
            | Legacy::TESSELLATION_CONTROL_SHADER
            | Legacy::TESSELLATION_EVALUATION_SHADER
            | Legacy::GEOMETRY_SHADER;
        high &= !S::PRE_RASTERIZATION_SHADERS;
    }
    if !high.is_empty() {
        legacy |= Legacy::ALL_COMMANDS;
    }
    legacy
}

/// Narrow a 64-bit access mask to the legacy 32-bit form.
pub fn legacy_access(access: vk::AccessFlags2) -> vk::AccessFlags {
    use vk::AccessFlags as Legacy;
    use vk::AccessFlags2 as A;

    let raw = access.as_raw();
    let mut legacy = Legacy::from_raw((raw & LEGACY_MASK) as u32);
    let mut high = A::from_raw(raw & !LEGACY_MASK);
    if high.is_empty() {
        return legacy;
    }

    let reads = A::SHADER_SAMPLED_READ | A::SHADER_STORAGE_READ;
    if high.intersects(reads) {
        legacy |= Legacy::SHADER_READ;
        high &= !reads;
    }
    if high.intersects(A::SHADER_STORAGE_WRITE) {
        legacy |= Legacy::SHADER_WRITE;
        high &= !A::SHADER_STORAGE_WRITE;
    }
    if !high.is_empty() {
        if high.intersects(WRITE_ACCESS) {
            legacy |= Legacy::MEMORY_WRITE;
        }
        legacy |= Legacy::MEMORY_READ;
    }
    legacy
}
