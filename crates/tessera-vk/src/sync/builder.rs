//! Barrier decisions for a single subresource.

use ash::vk;

use super::access::Access;
use super::state::SyncState;

/// Stage/access (and optionally the image layout) an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SyncRequest {
    pub access: Access,
    /// Target layout; `None` for buffers and "don't care" image accesses.
    pub layout: Option<vk::ImageLayout>,
}

impl SyncRequest {
    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self {
            access: Access::new(stage, access),
            layout: None,
        }
    }

    pub const fn with_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// No access and no layout: syncing it is a no-op.
    pub fn is_empty(&self) -> bool {
        self.access.is_empty() && self.layout.is_none()
    }

    pub const fn transfer_read() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_READ,
        )
    }

    pub const fn transfer_write() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
        )
    }

    /// Transfer write through the clear stage (`vkCmdFillBuffer`, clears).
    pub const fn clear_write() -> Self {
        Self::new(
            vk::PipelineStageFlags2::CLEAR,
            vk::AccessFlags2::TRANSFER_WRITE,
        )
    }

    pub const fn compute_read() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_READ,
        )
    }

    pub const fn compute_write() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        )
    }

    pub const fn vertex_input() -> Self {
        Self::new(
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        )
    }

    pub const fn index_input() -> Self {
        Self::new(
            vk::PipelineStageFlags2::INDEX_INPUT,
            vk::AccessFlags2::INDEX_READ,
        )
    }

    pub const fn indirect_command() -> Self {
        Self::new(
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::INDIRECT_COMMAND_READ,
        )
    }

    pub const fn uniform(stage: vk::PipelineStageFlags2) -> Self {
        Self::new(stage, vk::AccessFlags2::UNIFORM_READ)
    }

    /// Sampled image read in `stage`, in `SHADER_READ_ONLY_OPTIMAL`.
    pub const fn sampled(stage: vk::PipelineStageFlags2) -> Self {
        Self::new(stage, vk::AccessFlags2::SHADER_SAMPLED_READ)
            .with_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    }

    pub const fn color_attachment_write() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::from_raw(
                vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                    | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
            ),
        )
        .with_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
    }

    pub const fn depth_attachment_write() -> Self {
        Self::new(
            vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
            ),
            vk::AccessFlags2::from_raw(
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
            ),
        )
        .with_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
    }

    pub const fn host_read() -> Self {
        Self::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ)
    }

    pub const fn host_write() -> Self {
        Self::new(vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_WRITE)
    }
}

/// One computed barrier. All-empty with equal layouts means "no barrier".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrierInfo {
    pub src: Access,
    pub dst: Access,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

impl Default for ResourceBarrierInfo {
    fn default() -> Self {
        Self {
            src: Access::NONE,
            dst: Access::NONE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl ResourceBarrierInfo {
    pub fn is_empty(&self) -> bool {
        self.src.is_empty() && self.dst.is_empty() && self.old_layout == self.new_layout
    }

    pub fn is_transition(&self) -> bool {
        self.old_layout != self.new_layout
    }

    /// Union `other` into this barrier if both use the same layout pair.
    pub fn try_merge(&mut self, other: &ResourceBarrierInfo) -> bool {
        if self.old_layout != other.old_layout || self.new_layout != other.new_layout {
            return false;
        }
        self.src |= other.src;
        self.dst |= other.dst;
        true
    }
}

/// Result of [`try_build_barrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BarrierOutcome {
    pub barrier: Option<ResourceBarrierInfo>,
    pub is_write: bool,
}

impl BarrierOutcome {
    pub fn needed(&self) -> bool {
        self.barrier.is_some()
    }
}

/// Decide whether `request` needs a barrier against `state`, and advance `state`.
///
/// `allow_transition_from_unknown` lets an unknown current layout transition to
/// the requested one; it is only set when committing into global state.
pub fn try_build_barrier(
    state: &mut SyncState,
    request: &SyncRequest,
    allow_transition_from_unknown: bool,
) -> BarrierOutcome {
    if request.is_empty() {
        return BarrierOutcome::default();
    }

    let access = request.access.with_aliased_stages();
    let transition = match request.layout {
        Some(target) => {
            target != state.layout && (state.layout_known() || allow_transition_from_unknown)
        }
        None => false,
    };
    let is_write = access.is_write() || transition;

    let src = if is_write {
        let src = if state.ongoing_readers.is_empty() {
            state.last_writer
        } else {
            state.ongoing_readers
        };
        state.last_writer = access;
        state.ongoing_readers = Access::NONE;
        state.per_stage_readers.clear();
        if !access.is_write() {
            // A transition leaves the data readable by the requesting stages.
            state.ongoing_readers = access;
            state.per_stage_readers.mark(access);
        }
        src
    } else {
        let src = if !state.last_writer.is_empty() && !state.per_stage_readers.covers(access) {
            state.last_writer
        } else {
            Access::NONE
        };
        state.ongoing_readers |= access;
        state.per_stage_readers.mark(access);
        src
    };

    let (old_layout, new_layout) = match request.layout {
        Some(target) if transition => (state.layout, target),
        Some(target) => (target, target),
        None => (state.layout, state.layout),
    };
    if let Some(target) = request.layout {
        state.layout = target;
    }

    let barrier = (!src.is_empty() || transition).then_some(ResourceBarrierInfo {
        src,
        dst: access,
        old_layout,
        new_layout,
    });
    BarrierOutcome { barrier, is_write }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    #[test]
    fn empty_request_is_a_no_op() {
        let mut state = SyncState::default();
        state.last_writer = SyncRequest::transfer_write().access;
        let before = state;
        let outcome = try_build_barrier(&mut state, &SyncRequest::default(), true);
        assert!(!outcome.needed());
        assert_eq!(state, before);
    }

    #[test]
    fn first_write_needs_no_barrier() {
        let mut state = SyncState::default();
        let outcome = try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);
        assert!(!outcome.needed());
        assert!(outcome.is_write);
        assert_eq!(state.last_writer, SyncRequest::transfer_write().access);
    }

    #[test]
    fn read_after_write_waits_on_writer_once() {
        let mut state = SyncState::default();
        try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);

        let first = try_build_barrier(&mut state, &SyncRequest::compute_read(), false);
        let barrier = first.barrier.unwrap();
        assert_eq!(barrier.src, SyncRequest::transfer_write().access);
        assert_eq!(barrier.dst, SyncRequest::compute_read().access);
        assert!(!first.is_write);

        let second = try_build_barrier(&mut state, &SyncRequest::compute_read(), false);
        assert!(!second.needed(), "identical read must not barrier twice");
    }

    #[test]
    fn identical_untracked_reads_barrier_once() {
        for read in [
            SyncRequest::new(S::ALL_GRAPHICS, A::UNIFORM_READ),
            SyncRequest::new(S::ALL_COMMANDS, A::MEMORY_READ),
            SyncRequest::new(S::PRE_RASTERIZATION_SHADERS, A::SHADER_STORAGE_READ),
            SyncRequest::new(S::RAY_TRACING_SHADER_KHR, A::ACCELERATION_STRUCTURE_READ_KHR),
            SyncRequest::new(S::MESH_SHADER_EXT, A::SHADER_STORAGE_READ),
        ] {
            let mut state = SyncState::default();
            try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);
            assert!(try_build_barrier(&mut state, &read, false).needed());
            assert!(
                !try_build_barrier(&mut state, &read, false).needed(),
                "{read:?} barriered twice"
            );
        }
    }

    #[test]
    fn untracked_read_does_not_cover_other_untracked_stages() {
        let mut state = SyncState::default();
        try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);
        try_build_barrier(
            &mut state,
            &SyncRequest::new(S::ALL_GRAPHICS, A::UNIFORM_READ),
            false,
        );
        let outcome = try_build_barrier(
            &mut state,
            &SyncRequest::new(S::ALL_COMMANDS, A::UNIFORM_READ),
            false,
        );
        assert_eq!(
            outcome.barrier.unwrap().src,
            SyncRequest::transfer_write().access
        );
    }

    #[test]
    fn reads_in_new_stage_wait_on_writer_not_on_other_reads() {
        let mut state = SyncState::default();
        let fragment = SyncRequest::new(S::FRAGMENT_SHADER, A::SHADER_STORAGE_READ);
        try_build_barrier(&mut state, &fragment, false);
        assert!(!try_build_barrier(&mut state, &SyncRequest::compute_read(), false).needed());

        try_build_barrier(&mut state, &SyncRequest::compute_write(), false);
        try_build_barrier(&mut state, &fragment, false);
        let transfer = try_build_barrier(&mut state, &SyncRequest::transfer_read(), false);
        assert_eq!(
            transfer.barrier.unwrap().src,
            SyncRequest::compute_write().access
        );
    }

    #[test]
    fn write_after_reads_waits_on_all_readers() {
        let mut state = SyncState::default();
        try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);
        try_build_barrier(&mut state, &SyncRequest::compute_read(), false);
        try_build_barrier(&mut state, &SyncRequest::vertex_input(), false);

        let outcome = try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);
        let barrier = outcome.barrier.unwrap();
        assert_eq!(
            barrier.src,
            SyncRequest::compute_read().access | SyncRequest::vertex_input().access
        );
        assert!(state.ongoing_readers.is_empty());
        assert!(state.per_stage_readers.is_empty());
    }

    #[test]
    fn write_after_write_waits_on_prior_writer() {
        let mut state = SyncState::default();
        try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);
        let outcome = try_build_barrier(&mut state, &SyncRequest::compute_write(), false);
        assert_eq!(
            outcome.barrier.unwrap().src,
            SyncRequest::transfer_write().access
        );
        assert_eq!(state.last_writer, SyncRequest::compute_write().access);
    }

    #[test]
    fn read_after_write_is_needed_again_after_new_write() {
        let mut state = SyncState::default();
        try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);
        try_build_barrier(&mut state, &SyncRequest::compute_read(), false);
        try_build_barrier(&mut state, &SyncRequest::transfer_write(), false);
        assert!(try_build_barrier(&mut state, &SyncRequest::compute_read(), false).needed());
    }

    #[test]
    fn unknown_layout_does_not_transition_while_recording() {
        let mut state = SyncState::default();
        let request = SyncRequest::transfer_read().with_layout(L::TRANSFER_SRC_OPTIMAL);
        let outcome = try_build_barrier(&mut state, &request, false);
        assert!(!outcome.needed());
        assert!(!outcome.is_write);
        assert_eq!(state.layout, L::TRANSFER_SRC_OPTIMAL);
    }

    #[test]
    fn unknown_layout_transitions_when_allowed() {
        let mut state = SyncState::default();
        let request = SyncRequest::transfer_write().with_layout(L::TRANSFER_DST_OPTIMAL);
        let outcome = try_build_barrier(&mut state, &request, true);
        let barrier = outcome.barrier.unwrap();
        assert_eq!(barrier.old_layout, L::UNDEFINED);
        assert_eq!(barrier.new_layout, L::TRANSFER_DST_OPTIMAL);
        assert!(barrier.src.is_empty());
    }

    #[test]
    fn read_only_transition_reseeds_readers() {
        let mut state = SyncState::with_layout(L::TRANSFER_DST_OPTIMAL);
        try_build_barrier(
            &mut state,
            &SyncRequest::transfer_write().with_layout(L::TRANSFER_DST_OPTIMAL),
            false,
        );

        let sampled = SyncRequest::sampled(S::FRAGMENT_SHADER);
        let outcome = try_build_barrier(&mut state, &sampled, false);
        assert!(outcome.is_write);
        let barrier = outcome.barrier.unwrap();
        assert_eq!(barrier.src, SyncRequest::transfer_write().access);
        assert_eq!(barrier.old_layout, L::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, L::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(state.ongoing_readers, sampled.access);

        assert!(!try_build_barrier(&mut state, &sampled, false).needed());
    }

    #[test]
    fn same_layout_read_keeps_layout_pair() {
        let mut state = SyncState::with_layout(L::GENERAL);
        try_build_barrier(&mut state, &SyncRequest::compute_write().with_layout(L::GENERAL), false);
        let outcome =
            try_build_barrier(&mut state, &SyncRequest::compute_read().with_layout(L::GENERAL), false);
        let barrier = outcome.barrier.unwrap();
        assert!(!barrier.is_transition());
        assert_eq!(barrier.old_layout, L::GENERAL);
    }

    #[test]
    fn tessellation_and_geometry_share_reader_slot() {
        let mut state = SyncState::default();
        try_build_barrier(&mut state, &SyncRequest::compute_write(), false);
        let tes = SyncRequest::new(S::TESSELLATION_EVALUATION_SHADER, A::SHADER_STORAGE_READ);
        assert!(try_build_barrier(&mut state, &tes, false).needed());

        let gs = SyncRequest::new(S::GEOMETRY_SHADER, A::SHADER_STORAGE_READ);
        assert!(!try_build_barrier(&mut state, &gs, false).needed());
    }

    #[test]
    fn barrier_merge_requires_matching_layouts() {
        let mut a = ResourceBarrierInfo {
            src: SyncRequest::transfer_write().access,
            dst: SyncRequest::compute_read().access,
            old_layout: L::GENERAL,
            new_layout: L::GENERAL,
        };
        let b = ResourceBarrierInfo {
            dst: SyncRequest::vertex_input().access,
            ..a
        };
        assert!(a.try_merge(&b));
        assert_eq!(
            a.dst,
            SyncRequest::compute_read().access | SyncRequest::vertex_input().access
        );

        let c = ResourceBarrierInfo {
            new_layout: L::TRANSFER_SRC_OPTIMAL,
            ..a
        };
        assert!(!a.try_merge(&c));
    }
}
