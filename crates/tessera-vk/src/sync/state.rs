//! Per-subresource synchronization state.

use ash::vk;
use bitflags::bitflags;

use super::access::Access;

bitflags! {
    /// Read-access classes tracked per stage.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadClass: u16 {
        const INDIRECT_COMMAND         = 1 << 0;
        const INDEX                    = 1 << 1;
        const VERTEX_ATTRIBUTE         = 1 << 2;
        const UNIFORM                  = 1 << 3;
        const INPUT_ATTACHMENT         = 1 << 4;
        const SHADER_SAMPLED           = 1 << 5;
        const SHADER_STORAGE           = 1 << 6;
        const COLOR_ATTACHMENT         = 1 << 7;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 8;
        const TRANSFER                 = 1 << 9;
        const HOST                     = 1 << 10;
        /// Execution-only dependency (stage without access bits).
        const EXECUTION                = 1 << 11;
    }
}

const READ_CLASSES: [(vk::AccessFlags2, ReadClass); 12] = [
    (vk::AccessFlags2::INDIRECT_COMMAND_READ, ReadClass::INDIRECT_COMMAND),
    (vk::AccessFlags2::INDEX_READ, ReadClass::INDEX),
    (vk::AccessFlags2::VERTEX_ATTRIBUTE_READ, ReadClass::VERTEX_ATTRIBUTE),
    (vk::AccessFlags2::UNIFORM_READ, ReadClass::UNIFORM),
    (vk::AccessFlags2::INPUT_ATTACHMENT_READ, ReadClass::INPUT_ATTACHMENT),
    (
        vk::AccessFlags2::SHADER_READ,
        ReadClass::SHADER_SAMPLED.union(ReadClass::SHADER_STORAGE),
    ),
    (vk::AccessFlags2::SHADER_SAMPLED_READ, ReadClass::SHADER_SAMPLED),
    (vk::AccessFlags2::SHADER_STORAGE_READ, ReadClass::SHADER_STORAGE),
    (vk::AccessFlags2::COLOR_ATTACHMENT_READ, ReadClass::COLOR_ATTACHMENT),
    (
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
        ReadClass::DEPTH_STENCIL_ATTACHMENT,
    ),
    (vk::AccessFlags2::TRANSFER_READ, ReadClass::TRANSFER),
    (vk::AccessFlags2::HOST_READ, ReadClass::HOST),
];

const STAGE_SLOT_COUNT: usize = 17;

const STAGE_SLOTS: [vk::PipelineStageFlags2; STAGE_SLOT_COUNT] = [
    vk::PipelineStageFlags2::DRAW_INDIRECT,
    vk::PipelineStageFlags2::INDEX_INPUT,
    vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
    vk::PipelineStageFlags2::VERTEX_SHADER,
    vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER,
    vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER,
    vk::PipelineStageFlags2::GEOMETRY_SHADER,
    vk::PipelineStageFlags2::FRAGMENT_SHADER,
    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
    vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    vk::PipelineStageFlags2::COMPUTE_SHADER,
    vk::PipelineStageFlags2::COPY,
    vk::PipelineStageFlags2::BLIT,
    vk::PipelineStageFlags2::RESOLVE,
    vk::PipelineStageFlags2::CLEAR,
    vk::PipelineStageFlags2::HOST,
];

/// Slot bitmask for a stage mask, or `None` if it names an untracked stage.
fn stage_slots(stage: vk::PipelineStageFlags2) -> Option<u32> {
    use vk::PipelineStageFlags2 as S;

    let mut remaining = stage;
    if remaining.intersects(S::VERTEX_INPUT) {
        remaining = (remaining & !S::VERTEX_INPUT) | S::INDEX_INPUT | S::VERTEX_ATTRIBUTE_INPUT;
    }
    if remaining.intersects(S::TRANSFER) {
        remaining = (remaining & !S::TRANSFER) | S::COPY | S::BLIT | S::RESOLVE | S::CLEAR;
    }

    let mut slots = 0u32;
    for (index, slot) in STAGE_SLOTS.iter().enumerate() {
        if remaining.intersects(*slot) {
            slots |= 1 << index;
            remaining &= !*slot;
        }
    }
    (remaining.is_empty() && slots != 0).then_some(slots)
}

/// Read classes for an access mask, or `None` if it names an untracked access.
fn read_classes(access: vk::AccessFlags2) -> Option<ReadClass> {
    if access.is_empty() {
        return Some(ReadClass::EXECUTION);
    }
    let mut remaining = access;
    let mut classes = ReadClass::empty();
    for (bits, class) in READ_CLASSES {
        if remaining.intersects(bits) {
            classes |= class;
            remaining &= !bits;
        }
    }
    remaining.is_empty().then_some(classes)
}

const UNTRACKED_ENTRIES: usize = 4;

/// Which (stage, read access) pairs already waited on the current writer.
///
/// Reads naming stages or accesses outside the tracked slots are kept as raw
/// (stage, access) entries, one per distinct stage mask. When the entries run
/// out, further untracked reads are not recorded and stay uncovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerStageReaders {
    slots: [ReadClass; STAGE_SLOT_COUNT],
    untracked: [Access; UNTRACKED_ENTRIES],
}

impl PerStageReaders {
    /// Whether every (stage, access) pair of `access` is already satisfied.
    pub fn covers(&self, access: Access) -> bool {
        if let (Some(slots), Some(classes)) =
            (stage_slots(access.stage), read_classes(access.access))
        {
            let tracked = (0..STAGE_SLOT_COUNT)
                .filter(|index| slots & (1 << index) != 0)
                .all(|index| self.slots[index].contains(classes));
            if tracked {
                return true;
            }
        }
        !access.stage.is_empty()
            && self.untracked.iter().any(|entry| {
                !entry.stage.is_empty()
                    && entry.stage.contains(access.stage)
                    && entry.access.contains(access.access)
            })
    }

    /// Mark every (stage, access) pair of `access` as satisfied.
    pub fn mark(&mut self, access: Access) {
        if let (Some(slots), Some(classes)) =
            (stage_slots(access.stage), read_classes(access.access))
        {
            for (index, slot) in self.slots.iter_mut().enumerate() {
                if slots & (1 << index) != 0 {
                    *slot |= classes;
                }
            }
            return;
        }
        self.mark_untracked(access);
    }

    fn mark_untracked(&mut self, access: Access) {
        if access.stage.is_empty() {
            return;
        }
        if let Some(entry) = self
            .untracked
            .iter_mut()
            .find(|entry| entry.stage == access.stage)
        {
            entry.access |= access.access;
        } else if let Some(free) = self.untracked.iter_mut().find(|entry| entry.stage.is_empty()) {
            *free = access;
        } else {
            tracing::trace!(?access, "Untracked reader entries full");
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_empty())
            && self.untracked.iter().all(|entry| entry.stage.is_empty())
    }

    /// Union with another record.
    pub fn union(&mut self, other: &PerStageReaders) {
        for (slot, other) in self.slots.iter_mut().zip(other.slots) {
            *slot |= other;
        }
        for entry in other.untracked {
            self.mark_untracked(entry);
        }
    }
}

/// Synchronization state of one subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncState {
    /// Most recent write-class access; empty if none.
    pub last_writer: Access,
    /// Reads since the last write that no write has waited on yet.
    pub ongoing_readers: Access,
    /// Reads already synchronized with `last_writer`.
    pub per_stage_readers: PerStageReaders,
    /// Current image layout; `UNDEFINED` means unknown (and is used for buffers).
    pub layout: vk::ImageLayout,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_writer: Access::NONE,
            ongoing_readers: Access::NONE,
            per_stage_readers: PerStageReaders::default(),
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl SyncState {
    /// A state whose image layout is known.
    pub fn with_layout(layout: vk::ImageLayout) -> Self {
        Self {
            layout,
            ..Self::default()
        }
    }

    pub fn layout_known(&self) -> bool {
        self.layout != vk::ImageLayout::UNDEFINED
    }

    /// Whether nothing has touched this subresource.
    pub fn is_untouched(&self) -> bool {
        self.last_writer.is_empty() && self.ongoing_readers.is_empty() && !self.layout_known()
    }
}

/// A rectangle of mip levels × array layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    /// The single subresource of a buffer.
    pub const WHOLE_BUFFER: SubresourceRange = SubresourceRange::new(0, 1, 0, 1);

    pub const fn new(base_mip: u32, mip_count: u32, base_layer: u32, layer_count: u32) -> Self {
        Self {
            base_mip,
            mip_count,
            base_layer,
            layer_count,
        }
    }

    /// One (mip, layer) subresource.
    pub const fn single(mip: u32, layer: u32) -> Self {
        Self::new(mip, 1, layer, 1)
    }

    pub fn is_empty(&self) -> bool {
        self.mip_count == 0 || self.layer_count == 0
    }

    /// One past the last mip; saturates so oversized ranges never fit a resource.
    pub fn mip_end(&self) -> u32 {
        self.base_mip.saturating_add(self.mip_count)
    }

    pub fn layer_end(&self) -> u32 {
        self.base_layer.saturating_add(self.layer_count)
    }

    /// Replace `REMAINING_MIP_LEVELS` / `REMAINING_ARRAY_LAYERS` with the counts
    /// left after the base, then check the range fits the resource.
    pub fn resolve(&self, mip_levels: u32, array_layers: u32) -> Option<SubresourceRange> {
        let mip_count = if self.mip_count == vk::REMAINING_MIP_LEVELS {
            mip_levels.checked_sub(self.base_mip)?
        } else {
            self.mip_count
        };
        let layer_count = if self.layer_count == vk::REMAINING_ARRAY_LAYERS {
            array_layers.checked_sub(self.base_layer)?
        } else {
            self.layer_count
        };
        let resolved = Self::new(self.base_mip, mip_count, self.base_layer, layer_count);
        SubresourceRange::new(0, mip_levels, 0, array_layers)
            .contains(&resolved)
            .then_some(resolved)
    }

    /// Whether `other` lies entirely inside this range.
    pub fn contains(&self, other: &SubresourceRange) -> bool {
        self.base_mip <= other.base_mip
            && other.mip_end() <= self.mip_end()
            && self.base_layer <= other.base_layer
            && other.layer_end() <= self.layer_end()
    }

    /// Merge two ranges when their union is still a rectangle.
    ///
    /// Succeeds when one contains the other, or when one dimension matches exactly
    /// and the other is contiguous or overlapping.
    pub fn merge(&self, other: &SubresourceRange) -> Option<SubresourceRange> {
        if self.contains(other) {
            return Some(*self);
        }
        if other.contains(self) {
            return Some(*other);
        }
        let same_mips = self.base_mip == other.base_mip && self.mip_count == other.mip_count;
        let same_layers =
            self.base_layer == other.base_layer && self.layer_count == other.layer_count;

        if same_mips && self.base_layer <= other.layer_end() && other.base_layer <= self.layer_end()
        {
            let base = self.base_layer.min(other.base_layer);
            let end = self.layer_end().max(other.layer_end());
            return Some(Self::new(self.base_mip, self.mip_count, base, end - base));
        }
        if same_layers && self.base_mip <= other.mip_end() && other.base_mip <= self.mip_end() {
            let base = self.base_mip.min(other.base_mip);
            let end = self.mip_end().max(other.mip_end());
            return Some(Self::new(base, end - base, self.base_layer, self.layer_count));
        }
        None
    }

    /// Native range for the given aspect.
    pub fn to_vk(&self, aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: self.base_mip,
            level_count: self.mip_count,
            base_array_layer: self.base_layer,
            layer_count: self.layer_count,
        }
    }
}

/// One value per (mip, layer) subresource of a resource.
#[derive(Debug, Clone)]
pub struct SubresourceMap<T> {
    mip_levels: u32,
    array_layers: u32,
    entries: Vec<T>,
}

impl<T: Default + Clone> SubresourceMap<T> {
    pub fn new(mip_levels: u32, array_layers: u32) -> Self {
        let mip_levels = mip_levels.max(1);
        let array_layers = array_layers.max(1);
        Self {
            mip_levels,
            array_layers,
            entries: vec![T::default(); (mip_levels * array_layers) as usize],
        }
    }
}

impl<T> SubresourceMap<T> {
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    /// Range covering every subresource.
    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange::new(0, self.mip_levels, 0, self.array_layers)
    }

    /// Whether `range` lies within this resource.
    pub fn contains_range(&self, range: &SubresourceRange) -> bool {
        self.full_range().contains(range)
    }

    fn index(&self, mip: u32, layer: u32) -> usize {
        debug_assert!(mip < self.mip_levels && layer < self.array_layers);
        (layer * self.mip_levels + mip) as usize
    }

    pub fn get(&self, mip: u32, layer: u32) -> &T {
        &self.entries[self.index(mip, layer)]
    }

    pub fn get_mut(&mut self, mip: u32, layer: u32) -> &mut T {
        let index = self.index(mip, layer);
        &mut self.entries[index]
    }

    /// All (mip, layer) pairs of `range`, layer-major.
    pub fn positions(range: SubresourceRange) -> impl Iterator<Item = (u32, u32)> {
        (range.base_layer..range.layer_end())
            .flat_map(move |layer| (range.base_mip..range.mip_end()).map(move |mip| (mip, layer)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> {
        let mip_levels = self.mip_levels;
        self.entries.iter().enumerate().map(move |(index, entry)| {
            let index = index as u32;
            (index % mip_levels, index / mip_levels, entry)
        })
    }
}
