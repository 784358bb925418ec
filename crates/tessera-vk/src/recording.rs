//! Per-command-list recording state.
//!
//! While a list records, every access is checked against a *local* view of each
//! touched subresource; the list never reads global state. The first accesses a
//! list makes to a subresource (up to and including its first write) are kept
//! as the subresource's entry request, which is reconciled with global state
//! when the list is submitted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;

use crate::error::{Result, VkError};
use crate::resource::ResourceHandle;
use crate::sync::{
    try_build_barrier, BarrierTarget, PendingBarrier, PendingBarrierQueue, SubresourceMap,
    SubresourceRange, SyncRequest, SyncState,
};

/// Lifecycle of a command list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingPhase {
    Initial,
    Recording,
    Ended,
    Submitted,
    Completed,
}

impl RecordingPhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Recording => "recording",
            Self::Ended => "ended",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
        }
    }
}

/// Local view of one subresource during recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalSubresource {
    /// State as observed by this list alone.
    pub state: SyncState,
    /// What global state must be synchronized against at submit.
    pub entry: Option<SyncRequest>,
    /// Set once the list wrote (or transitioned) the subresource; later accesses
    /// are synchronized locally.
    pub sealed: bool,
}

impl LocalSubresource {
    fn record_entry(&mut self, request: &SyncRequest) {
        if self.sealed {
            return;
        }
        let layout_unknown = !self.state.layout_known();
        match self.entry.as_mut() {
            None => self.entry = Some(*request),
            Some(entry) => {
                entry.access |= request.access;
                if entry.layout.is_none() && layout_unknown {
                    entry.layout = request.layout;
                }
            }
        }
    }
}

/// A resource touched by the current recording.
#[derive(Debug, Clone)]
pub struct LocalResource {
    pub target: BarrierTarget,
    pub subresources: SubresourceMap<LocalSubresource>,
}

/// Local sync state of every resource a recording touched, in first-touch order.
#[derive(Debug, Default)]
pub struct LocalTracker {
    resources: HashMap<ResourceHandle, LocalResource>,
    order: Vec<ResourceHandle>,
}

impl LocalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync `range` of a resource for `request`, queueing any barriers into `queue`.
    ///
    /// Returns whether a barrier was queued.
    pub fn sync(
        &mut self,
        handle: ResourceHandle,
        target: BarrierTarget,
        counts: (u32, u32),
        range: SubresourceRange,
        request: &SyncRequest,
        queue: &mut PendingBarrierQueue,
    ) -> Result<bool> {
        if request.is_empty() || range.is_empty() {
            return Ok(false);
        }
        let range = range
            .resolve(counts.0.max(1), counts.1.max(1))
            .ok_or(VkError::SubresourceOutOfRange(handle))?;
        if range.is_empty() {
            return Ok(false);
        }

        let resource = match self.resources.entry(handle) {
            hashbrown::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            hashbrown::hash_map::Entry::Vacant(entry) => {
                let subresources = SubresourceMap::new(counts.0, counts.1);
                self.order.push(handle);
                entry.insert(LocalResource {
                    target,
                    subresources,
                })
            }
        };
        if !resource.subresources.contains_range(&range) {
            return Err(VkError::SubresourceOutOfRange(handle));
        }

        let mut queued = false;
        for (mip, layer) in SubresourceMap::<LocalSubresource>::positions(range) {
            let local = resource.subresources.get_mut(mip, layer);
            local.record_entry(request);
            let outcome = try_build_barrier(&mut local.state, request, false);
            if outcome.is_write {
                local.sealed = true;
            }
            if let Some(barrier) = outcome.barrier {
                queued |= queue.enqueue(
                    handle,
                    resource.target,
                    SubresourceRange::single(mip, layer),
                    barrier,
                );
            }
        }
        Ok(queued)
    }

    /// Touched resources in first-touch order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceHandle, &LocalResource)> {
        self.order
            .iter()
            .filter_map(|handle| self.resources.get(handle).map(|res| (*handle, res)))
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&LocalResource> {
        self.resources.get(&handle)
    }

    /// Handles of every touched resource, in first-touch order.
    pub fn handles(&self) -> &[ResourceHandle] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.resources.clear();
        self.order.clear();
    }
}

/// Everything a command list accumulates between `begin` and submission.
#[derive(Debug)]
pub struct RecordingState {
    phase: RecordingPhase,
    tracker: LocalTracker,
    pending: PendingBarrierQueue,
    in_render_pass: bool,
    completion: Arc<AtomicBool>,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self {
            phase: RecordingPhase::Initial,
            tracker: LocalTracker::new(),
            pending: PendingBarrierQueue::new(),
            in_render_pass: false,
            completion: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl RecordingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase; a submitted list reports `Completed` once its fence retired.
    pub fn phase(&self) -> RecordingPhase {
        if self.phase == RecordingPhase::Submitted && self.completion.load(Ordering::Acquire) {
            return RecordingPhase::Completed;
        }
        self.phase
    }

    fn invalid(&self, operation: &'static str) -> VkError {
        VkError::InvalidRecordingState {
            operation,
            state: self.phase().name(),
        }
    }

    /// Reset all per-recording structures and enter `Recording`.
    pub fn begin(&mut self) -> Result<()> {
        if self.phase == RecordingPhase::Recording {
            return Err(self.invalid("begin"));
        }
        self.tracker.clear();
        self.pending.clear();
        self.in_render_pass = false;
        self.completion = Arc::new(AtomicBool::new(false));
        self.phase = RecordingPhase::Recording;
        Ok(())
    }

    /// Check that recording commands is allowed right now.
    pub fn ensure_recording(&self, operation: &'static str) -> Result<()> {
        if self.phase != RecordingPhase::Recording {
            return Err(self.invalid(operation));
        }
        Ok(())
    }

    /// Leave `Recording`. The caller flushes pending barriers first.
    pub fn end(&mut self) -> Result<()> {
        self.ensure_recording("end")?;
        if self.in_render_pass {
            return Err(VkError::InvalidRecordingState {
                operation: "end",
                state: "inside a render pass",
            });
        }
        self.phase = RecordingPhase::Ended;
        Ok(())
    }

    /// Sync a resource range for `request`.
    ///
    /// Returns whether barriers are waiting to be flushed.
    pub fn sync(
        &mut self,
        handle: ResourceHandle,
        target: BarrierTarget,
        counts: (u32, u32),
        range: SubresourceRange,
        request: &SyncRequest,
    ) -> Result<bool> {
        self.ensure_recording("sync")?;
        if self.in_render_pass {
            return Err(VkError::InvalidRecordingState {
                operation: "sync",
                state: "inside a render pass",
            });
        }
        self.tracker
            .sync(handle, target, counts, range, request, &mut self.pending)?;
        Ok(!self.pending.is_empty())
    }

    /// Coalesced barriers queued since the last flush.
    pub fn take_pending(&mut self) -> Vec<PendingBarrier> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn set_in_render_pass(&mut self, operation: &'static str, inside: bool) -> Result<()> {
        self.ensure_recording(operation)?;
        if self.in_render_pass == inside {
            return Err(VkError::InvalidRecordingState {
                operation,
                state: if inside {
                    "inside a render pass"
                } else {
                    "outside a render pass"
                },
            });
        }
        self.in_render_pass = inside;
        Ok(())
    }

    pub fn in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    pub fn tracker(&self) -> &LocalTracker {
        &self.tracker
    }

    /// Check the list can be submitted.
    pub fn ensure_ended(&self) -> Result<()> {
        if self.phase != RecordingPhase::Ended {
            return Err(self.invalid("submit"));
        }
        Ok(())
    }

    /// Mark the list submitted; returns the flag set when its fence retires.
    pub fn mark_submitted(&mut self) -> Arc<AtomicBool> {
        self.phase = RecordingPhase::Submitted;
        Arc::clone(&self.completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use ash::vk::Handle;

    fn buffer_target() -> BarrierTarget {
        BarrierTarget::Buffer {
            buffer: vk::Buffer::from_raw(1),
        }
    }

    fn image_target() -> BarrierTarget {
        BarrierTarget::Image {
            image: vk::Image::from_raw(2),
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    fn recording() -> RecordingState {
        let mut state = RecordingState::new();
        state.begin().unwrap();
        state
    }

    #[test]
    fn lifecycle_errors() {
        let mut state = RecordingState::new();
        assert_eq!(state.phase(), RecordingPhase::Initial);
        assert!(matches!(
            state.end(),
            Err(VkError::InvalidRecordingState {
                operation: "end",
                state: "initial"
            })
        ));

        state.begin().unwrap();
        assert!(matches!(
            state.begin(),
            Err(VkError::InvalidRecordingState {
                operation: "begin",
                ..
            })
        ));
        assert!(state.ensure_ended().is_err());
        state.end().unwrap();
        assert!(state.end().is_err());
        state.ensure_ended().unwrap();

        let done = state.mark_submitted();
        assert_eq!(state.phase(), RecordingPhase::Submitted);
        done.store(true, Ordering::Release);
        assert_eq!(state.phase(), RecordingPhase::Completed);

        state.begin().unwrap();
        assert_eq!(state.phase(), RecordingPhase::Recording);
    }

    #[test]
    fn sync_queues_barrier_only_for_local_hazards() {
        let mut state = recording();
        let handle = ResourceHandle::new(0, 0);
        let range = SubresourceRange::WHOLE_BUFFER;

        assert!(!state
            .sync(handle, buffer_target(), (1, 1), range, &SyncRequest::transfer_write())
            .unwrap());
        assert!(state
            .sync(handle, buffer_target(), (1, 1), range, &SyncRequest::compute_read())
            .unwrap());
        assert_eq!(state.take_pending().len(), 1);
        assert!(!state
            .sync(handle, buffer_target(), (1, 1), range, &SyncRequest::compute_read())
            .unwrap());
    }

    #[test]
    fn entry_accumulates_reads_until_first_write() {
        let mut state = recording();
        let handle = ResourceHandle::new(0, 0);
        let range = SubresourceRange::WHOLE_BUFFER;
        for request in [
            SyncRequest::compute_read(),
            SyncRequest::vertex_input(),
            SyncRequest::transfer_write(),
            SyncRequest::index_input(),
        ] {
            state
                .sync(handle, buffer_target(), (1, 1), range, &request)
                .unwrap();
        }

        let local = state.tracker().get(handle).unwrap().subresources.get(0, 0);
        assert!(local.sealed);
        assert_eq!(
            local.entry.unwrap().access,
            SyncRequest::compute_read().access
                | SyncRequest::vertex_input().access
                | SyncRequest::transfer_write().access
        );
        assert_eq!(local.state.last_writer, SyncRequest::transfer_write().access);
    }

    #[test]
    fn entry_layout_is_first_named_layout() {
        let mut state = recording();
        let handle = ResourceHandle::new(4, 0);
        let mip0 = SubresourceRange::single(0, 0);
        let write = SyncRequest::transfer_write().with_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let sampled = SyncRequest::sampled(vk::PipelineStageFlags2::FRAGMENT_SHADER);

        state.sync(handle, image_target(), (2, 1), mip0, &write).unwrap();
        assert!(state.sync(handle, image_target(), (2, 1), mip0, &sampled).unwrap());

        let local = state.tracker().get(handle).unwrap().subresources.get(0, 0);
        assert_eq!(
            local.entry.unwrap().layout,
            Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        );
        assert_eq!(local.state.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        let untouched = state.tracker().get(handle).unwrap().subresources.get(1, 0);
        assert!(untouched.entry.is_none());
    }

    #[test]
    fn entry_is_frozen_once_sealed() {
        let mut state = recording();
        let handle = ResourceHandle::new(4, 0);
        let mip0 = SubresourceRange::single(0, 0);
        state
            .sync(handle, image_target(), (1, 1), mip0, &SyncRequest::transfer_write())
            .unwrap();
        state
            .sync(
                handle,
                image_target(),
                (1, 1),
                mip0,
                &SyncRequest::sampled(vk::PipelineStageFlags2::FRAGMENT_SHADER),
            )
            .unwrap();

        let local = state.tracker().get(handle).unwrap().subresources.get(0, 0);
        assert_eq!(local.entry, Some(SyncRequest::transfer_write()));
        assert_eq!(local.state.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    fn write_then_read(
        written: SubresourceRange,
        read: SubresourceRange,
    ) -> (bool, Vec<PendingBarrier>) {
        let mut state = recording();
        let handle = ResourceHandle::new(9, 0);
        state
            .sync(handle, image_target(), (4, 2), written, &SyncRequest::compute_write())
            .unwrap();
        assert!(!state.has_pending());
        let queued = state
            .sync(handle, image_target(), (4, 2), read, &SyncRequest::compute_read())
            .unwrap();
        (queued, state.take_pending())
    }

    #[test]
    fn disjoint_ranges_need_no_barrier() {
        let (queued, barriers) = write_then_read(
            SubresourceRange::new(0, 2, 0, 1),
            SubresourceRange::new(2, 2, 0, 2),
        );
        assert!(!queued);
        assert!(barriers.is_empty());
    }

    #[test]
    fn nested_range_barriers_cover_the_inner_range() {
        let (queued, barriers) = write_then_read(
            SubresourceRange::new(0, 4, 0, 2),
            SubresourceRange::new(1, 2, 1, 1),
        );
        assert!(queued);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range, SubresourceRange::new(1, 2, 1, 1));
        assert_eq!(barriers[0].info.src, SyncRequest::compute_write().access);
        assert_eq!(barriers[0].info.dst, SyncRequest::compute_read().access);
    }

    #[test]
    fn partial_overlap_barriers_cover_only_the_intersection() {
        let (queued, barriers) = write_then_read(
            SubresourceRange::new(0, 2, 0, 2),
            SubresourceRange::new(1, 3, 1, 1),
        );
        assert!(queued);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range, SubresourceRange::single(1, 1));

        let (_, barriers) = write_then_read(
            SubresourceRange::new(0, 2, 0, 2),
            SubresourceRange::new(1, 3, 0, 2),
        );
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range, SubresourceRange::new(1, 1, 0, 2));
    }

    #[test]
    fn remaining_counts_clamp_to_the_resource() {
        let (queued, barriers) = write_then_read(
            SubresourceRange::new(0, 4, 0, 2),
            SubresourceRange::new(1, vk::REMAINING_MIP_LEVELS, 1, vk::REMAINING_ARRAY_LAYERS),
        );
        assert!(queued);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range, SubresourceRange::new(1, 3, 1, 1));

        let mut state = recording();
        for range in [
            SubresourceRange::new(5, vk::REMAINING_MIP_LEVELS, 0, 1),
            SubresourceRange::new(1, u32::MAX - 1, 0, 1),
            SubresourceRange::new(0, 1, 3, vk::REMAINING_ARRAY_LAYERS),
            SubresourceRange::new(0, 1, 1, u32::MAX - 1),
        ] {
            let result = state.sync(
                ResourceHandle::new(9, 0),
                image_target(),
                (4, 2),
                range,
                &SyncRequest::compute_read(),
            );
            assert!(matches!(result, Err(VkError::SubresourceOutOfRange(_))));
        }
        assert!(state.tracker().is_empty());
    }

    #[test]
    fn syncing_inside_render_pass_is_rejected() {
        let mut state = recording();
        state.set_in_render_pass("begin_rendering", true).unwrap();
        assert!(state
            .set_in_render_pass("begin_rendering", true)
            .is_err());
        let result = state.sync(
            ResourceHandle::new(0, 0),
            buffer_target(),
            (1, 1),
            SubresourceRange::WHOLE_BUFFER,
            &SyncRequest::compute_read(),
        );
        assert!(matches!(
            result,
            Err(VkError::InvalidRecordingState {
                operation: "sync",
                ..
            })
        ));
        assert!(state.end().is_err());
        state.set_in_render_pass("end_rendering", false).unwrap();
        state.end().unwrap();
    }

    #[test]
    fn out_of_range_subresources_are_rejected() {
        let mut state = recording();
        let result = state.sync(
            ResourceHandle::new(0, 0),
            image_target(),
            (2, 1),
            SubresourceRange::new(1, 2, 0, 1),
            &SyncRequest::transfer_read(),
        );
        assert!(matches!(result, Err(VkError::SubresourceOutOfRange(_))));
        assert!(state.tracker().is_empty());
    }

    #[test]
    fn first_touch_order_is_preserved() {
        let mut state = recording();
        let handles = [
            ResourceHandle::new(5, 0),
            ResourceHandle::new(1, 0),
            ResourceHandle::new(3, 0),
        ];
        for handle in handles.iter().chain(handles.iter().rev()) {
            state
                .sync(
                    *handle,
                    buffer_target(),
                    (1, 1),
                    SubresourceRange::WHOLE_BUFFER,
                    &SyncRequest::transfer_read(),
                )
                .unwrap();
        }
        assert_eq!(state.tracker().handles(), &handles);
    }
}
