//! Submit-time commit of recorded effects and tracking of in-flight work.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::error::Result;
use crate::recording::LocalTracker;
use crate::resource::{Buffer, ResourceArena, ResourceHandle};
use crate::sync::{
    try_build_barrier, PendingBarrier, PendingBarrierQueue, SubresourceMap, SubresourceRange,
    SyncState,
};

/// Callback run once a submission's fence has signaled.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Global sync state a recording will leave behind, computed but not yet applied.
#[derive(Debug)]
pub struct PendingCommit {
    barriers: Vec<PendingBarrier>,
    states: Vec<(ResourceHandle, SubresourceMap<SyncState>)>,
}

impl PendingCommit {
    /// Barriers that must run before the recording's commands.
    pub fn barriers(&self) -> &[PendingBarrier] {
        &self.barriers
    }

    /// Publish the new state once the recording is actually on the queue.
    ///
    /// Dropping the commit instead leaves global state as it was.
    pub fn apply(self, arena: &mut ResourceArena) -> Result<()> {
        for (handle, state) in self.states {
            let (_, global) = arena.sync_mut(handle)?;
            *global = state;
        }
        Ok(())
    }
}

/// Reconcile a recording with global state.
///
/// For every subresource the recording touched, its entry request is synchronized
/// against the global state (unknown layouts may transition here), then the
/// recording's final local state is folded in. The result is built on copies of
/// the touched resources' state; nothing changes until [`PendingCommit::apply`].
/// Must be called under the device lock, in queue submission order.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn commit_recording(arena: &ResourceArena, tracker: &LocalTracker) -> Result<PendingCommit> {
    let mut queue = PendingBarrierQueue::new();
    let mut states = Vec::with_capacity(tracker.handles().len());
    for (handle, local) in tracker.iter() {
        let target = arena.get(handle)?.barrier_target();
        let mut global = arena.sync(handle)?.clone();
        for (mip, layer, subresource) in local.subresources.iter() {
            let Some(entry) = subresource.entry else {
                continue;
            };
            let state = global.get_mut(mip, layer);
            if let Some(barrier) = try_build_barrier(state, &entry, true).barrier {
                queue.enqueue(handle, target, SubresourceRange::single(mip, layer), barrier);
            }
            fold_local_state(state, &subresource.state);
        }
        states.push((handle, global));
    }
    Ok(PendingCommit {
        barriers: queue.take(),
        states,
    })
}

/// Fold a recording's final view of a subresource into its global state.
fn fold_local_state(global: &mut SyncState, local: &SyncState) {
    if local.last_writer.is_empty() {
        global.ongoing_readers |= local.ongoing_readers;
        global.per_stage_readers.union(&local.per_stage_readers);
    } else {
        global.last_writer = local.last_writer;
        global.ongoing_readers = local.ongoing_readers;
        global.per_stage_readers = local.per_stage_readers;
    }
    if local.layout_known() {
        global.layout = local.layout;
    }
}

/// Everything a submission holds until its fence signals.
pub struct InFlightSubmission {
    pub fence: vk::Fence,
    /// Whether `fence` came from the device's fence pool.
    pub fence_pooled: bool,
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Where the owning command list takes reusable command buffers from.
    pub recycle: Option<Arc<Mutex<Vec<vk::CommandBuffer>>>>,
    pub resources: Vec<ResourceHandle>,
    pub staging: Vec<Buffer>,
    pub on_complete: Option<CompletionCallback>,
    pub completion: Option<Arc<AtomicBool>>,
}

impl InFlightSubmission {
    /// A submission holding only a fence.
    pub fn new(fence: vk::Fence, fence_pooled: bool) -> Self {
        Self {
            fence,
            fence_pooled,
            command_buffers: Vec::new(),
            recycle: None,
            resources: Vec::new(),
            staging: Vec::new(),
            on_complete: None,
            completion: None,
        }
    }
}

impl std::fmt::Debug for InFlightSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightSubmission")
            .field("fence", &self.fence)
            .field("command_buffers", &self.command_buffers.len())
            .field("resources", &self.resources.len())
            .field("staging", &self.staging.len())
            .finish_non_exhaustive()
    }
}

/// In-flight submissions, in queue order.
#[derive(Debug, Default)]
pub struct SubmissionTracker {
    in_flight: VecDeque<InFlightSubmission>,
    submitted: u64,
    retired: u64,
}

impl SubmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, submission: InFlightSubmission) {
        self.submitted += 1;
        tracing::trace!(fence = ?submission.fence, "Submission in flight");
        self.in_flight.push_back(submission);
    }

    /// Pop every completed submission from the front of the queue.
    ///
    /// Fences on one queue signal in submission order, so polling stops at the
    /// first one still pending.
    pub fn retire(
        &mut self,
        mut is_signaled: impl FnMut(vk::Fence) -> Result<bool>,
    ) -> Result<Vec<InFlightSubmission>> {
        let mut done = Vec::new();
        while let Some(front) = self.in_flight.front() {
            if !is_signaled(front.fence)? {
                break;
            }
            if let Some(submission) = self.in_flight.pop_front() {
                tracing::trace!(fence = ?submission.fence, "Submission retired");
                done.push(submission);
            }
        }
        self.retired += done.len() as u64;
        Ok(done)
    }

    /// Pop every submission up to and including the one using `fence`.
    pub fn retire_through(&mut self, fence: vk::Fence) -> Vec<InFlightSubmission> {
        let Some(position) = self.in_flight.iter().position(|s| s.fence == fence) else {
            return Vec::new();
        };
        let done: Vec<_> = self.in_flight.drain(..=position).collect();
        self.retired += done.len() as u64;
        done
    }

    /// Pop everything, for use after the device went idle.
    pub fn retire_all(&mut self) -> Vec<InFlightSubmission> {
        let done: Vec<_> = self.in_flight.drain(..).collect();
        self.retired += done.len() as u64;
        done
    }

    pub fn contains(&self, fence: vk::Fence) -> bool {
        self.in_flight.iter().any(|s| s.fence == fence)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// (submitted, retired) totals.
    pub fn totals(&self) -> (u64, u64) {
        (self.submitted, self.retired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VkError;
    use crate::recording::RecordingState;
    use crate::resource::tests::{fake_buffer, fake_image};
    use crate::sync::{SubresourceRange, SyncRequest};
    use ash::vk::Handle;

    fn commit(arena: &mut ResourceArena, tracker: &LocalTracker) -> Vec<PendingBarrier> {
        let pending = commit_recording(arena, tracker).unwrap();
        let barriers = pending.barriers().to_vec();
        pending.apply(arena).unwrap();
        barriers
    }

    fn record(arena: &ResourceArena, handle: ResourceHandle, request: SyncRequest) -> RecordingState {
        let resource = arena.get(handle).unwrap();
        let mut recording = RecordingState::new();
        recording.begin().unwrap();
        recording
            .sync(
                handle,
                resource.barrier_target(),
                resource.subresource_counts(),
                SubresourceRange::new(0, resource.subresource_counts().0, 0, 1),
                &request,
            )
            .unwrap();
        recording.end().unwrap();
        recording
    }

    #[test]
    fn later_submission_owns_last_writer() {
        let mut arena = ResourceArena::new();
        let buffer = arena.insert(fake_buffer(1, 1024));

        let list_a = record(&arena, buffer, SyncRequest::transfer_write());
        let list_b = record(&arena, buffer, SyncRequest::compute_write());

        let barriers_b = commit(&mut arena, list_b.tracker());
        assert!(barriers_b.is_empty());
        let barriers_a = commit(&mut arena, list_a.tracker());

        let state = arena.sync(buffer).unwrap().get(0, 0);
        assert_eq!(state.last_writer, SyncRequest::transfer_write().access);
        assert_eq!(barriers_a.len(), 1);
        assert_eq!(barriers_a[0].info.src, SyncRequest::compute_write().access);
        assert_eq!(barriers_a[0].info.dst, SyncRequest::transfer_write().access);
    }

    #[test]
    fn read_only_list_waits_on_global_writer_and_keeps_it() {
        let mut arena = ResourceArena::new();
        let buffer = arena.insert(fake_buffer(1, 1024));

        let writer = record(&arena, buffer, SyncRequest::transfer_write());
        commit(&mut arena, writer.tracker());

        let reader = record(&arena, buffer, SyncRequest::vertex_input());
        let barriers = commit(&mut arena, reader.tracker());
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].info.src, SyncRequest::transfer_write().access);

        let state = arena.sync(buffer).unwrap().get(0, 0);
        assert_eq!(state.last_writer, SyncRequest::transfer_write().access);
        assert_eq!(state.ongoing_readers, SyncRequest::vertex_input().access);

        let again = record(&arena, buffer, SyncRequest::vertex_input());
        assert!(commit(&mut arena, again.tracker())
            .is_empty());
    }

    #[test]
    fn commit_transitions_unknown_layouts() {
        let mut arena = ResourceArena::new();
        let image = arena.insert(fake_image(2, 2, 1));
        let request = SyncRequest::transfer_write().with_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        let list = record(&arena, image, request);

        let barriers = commit(&mut arena, list.tracker());
        assert_eq!(barriers.len(), 1, "both mips merge into one barrier");
        assert_eq!(barriers[0].range, SubresourceRange::new(0, 2, 0, 1));
        assert_eq!(barriers[0].info.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            barriers[0].info.new_layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        let state = arena.sync(image).unwrap().get(1, 0);
        assert_eq!(state.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    fn record_range(
        arena: &ResourceArena,
        handle: ResourceHandle,
        range: SubresourceRange,
        request: SyncRequest,
    ) -> RecordingState {
        let resource = arena.get(handle).unwrap();
        let mut recording = RecordingState::new();
        recording.begin().unwrap();
        recording
            .sync(
                handle,
                resource.barrier_target(),
                resource.subresource_counts(),
                range,
                &request,
            )
            .unwrap();
        recording.end().unwrap();
        recording
    }

    #[test]
    fn commit_skips_disjoint_ranges_and_covers_nested_ones() {
        let mut arena = ResourceArena::new();
        let image = arena.insert(fake_image(3, 4, 2));
        let writer = record_range(
            &arena,
            image,
            SubresourceRange::new(0, 2, 0, 2),
            SyncRequest::compute_write(),
        );
        commit(&mut arena, writer.tracker());

        let disjoint = record_range(
            &arena,
            image,
            SubresourceRange::new(2, 2, 0, 2),
            SyncRequest::compute_read(),
        );
        assert!(commit(&mut arena, disjoint.tracker())
            .is_empty());

        let nested = record_range(
            &arena,
            image,
            SubresourceRange::new(1, 1, 0, 2),
            SyncRequest::compute_read(),
        );
        let barriers = commit(&mut arena, nested.tracker());
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].range, SubresourceRange::new(1, 1, 0, 2));
        assert_eq!(barriers[0].info.src, SyncRequest::compute_write().access);
    }

    #[test]
    fn commit_partial_overlap_splits_by_layout_history() {
        let mut arena = ResourceArena::new();
        let image = arena.insert(fake_image(3, 4, 2));
        let general = vk::ImageLayout::GENERAL;
        let writer = record_range(
            &arena,
            image,
            SubresourceRange::new(0, 2, 0, 2),
            SyncRequest::compute_write().with_layout(general),
        );
        commit(&mut arena, writer.tracker());

        let reader = record_range(
            &arena,
            image,
            SubresourceRange::new(1, 3, 1, 1),
            SyncRequest::compute_read().with_layout(general),
        );
        let barriers = commit(&mut arena, reader.tracker());
        assert_eq!(barriers.len(), 2);

        assert_eq!(barriers[0].range, SubresourceRange::single(1, 1));
        assert_eq!(barriers[0].info.src, SyncRequest::compute_write().access);
        assert_eq!(barriers[0].info.old_layout, general);
        assert_eq!(barriers[0].info.new_layout, general);

        assert_eq!(barriers[1].range, SubresourceRange::new(2, 2, 1, 1));
        assert!(barriers[1].info.src.is_empty());
        assert_eq!(barriers[1].info.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barriers[1].info.new_layout, general);

        let untouched = arena.sync(image).unwrap().get(3, 0);
        assert!(untouched.is_untouched());
    }

    #[test]
    fn unapplied_commit_leaves_global_state_alone() {
        let mut arena = ResourceArena::new();
        let buffer = arena.insert(fake_buffer(1, 1024));
        let writer = record(&arena, buffer, SyncRequest::transfer_write());
        commit(&mut arena, writer.tracker());
        let before = *arena.sync(buffer).unwrap().get(0, 0);

        // A list whose submission never reaches the queue.
        let abandoned = record(&arena, buffer, SyncRequest::compute_read());
        let pending = commit_recording(&arena, abandoned.tracker()).unwrap();
        assert_eq!(pending.barriers().len(), 1);
        drop(pending);
        assert_eq!(*arena.sync(buffer).unwrap().get(0, 0), before);

        let reader = record(&arena, buffer, SyncRequest::compute_read());
        let barriers = commit(&mut arena, reader.tracker());
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].info.src, SyncRequest::transfer_write().access);
    }

    #[test]
    fn apply_fails_for_resources_destroyed_since_commit() {
        let mut arena = ResourceArena::new();
        let buffer = arena.insert(fake_buffer(1, 1024));
        let first = record(&arena, buffer, SyncRequest::transfer_write());
        let pending = commit_recording(&arena, first.tracker()).unwrap();
        pending.apply(&mut arena).unwrap();

        let second = record(&arena, buffer, SyncRequest::compute_write());
        let pending = commit_recording(&arena, second.tracker()).unwrap();
        assert_eq!(
            pending.barriers()[0].info.src,
            SyncRequest::transfer_write().access
        );
        arena.request_destroy(buffer).unwrap();
        assert!(matches!(
            pending.apply(&mut arena),
            Err(VkError::ResourceDestroyed(h)) if h == buffer
        ));
    }

    #[test]
    fn commit_fails_for_destroyed_resources_without_side_effects() {
        let mut arena = ResourceArena::new();
        let live = arena.insert(fake_buffer(1, 64));
        let doomed = arena.insert(fake_buffer(2, 64));

        let mut recording = RecordingState::new();
        recording.begin().unwrap();
        for handle in [live, doomed] {
            let target = arena.get(handle).unwrap().barrier_target();
            recording
                .sync(
                    handle,
                    target,
                    (1, 1),
                    SubresourceRange::WHOLE_BUFFER,
                    &SyncRequest::transfer_write(),
                )
                .unwrap();
        }
        arena.request_destroy(doomed).unwrap();

        let result = commit_recording(&arena, recording.tracker());
        assert!(matches!(result, Err(VkError::ResourceDestroyed(h)) if h == doomed));
        assert!(arena.sync(live).unwrap().get(0, 0).last_writer.is_empty());
    }

    #[test]
    fn retire_stops_at_first_pending_fence() {
        let mut tracker = SubmissionTracker::new();
        for raw in 1..=3 {
            tracker.push(InFlightSubmission::new(vk::Fence::from_raw(raw), true));
        }

        let done = tracker
            .retire(|fence| Ok(fence.as_raw() != 2))
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(tracker.len(), 2);

        let done = tracker.retire_through(vk::Fence::from_raw(3));
        assert_eq!(done.len(), 2);
        assert!(tracker.is_empty());
        assert_eq!(tracker.totals(), (3, 3));
    }

    #[test]
    fn retire_propagates_fence_errors() {
        let mut tracker = SubmissionTracker::new();
        tracker.push(InFlightSubmission::new(vk::Fence::from_raw(1), false));
        let result = tracker.retire(|_| Err(VkError::DeviceLost));
        assert!(matches!(result, Err(VkError::DeviceLost)));
        assert_eq!(tracker.len(), 1);
    }
}
