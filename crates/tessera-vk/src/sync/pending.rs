//! Barriers queued between flush points.

use ash::vk;

use super::builder::ResourceBarrierInfo;
use super::state::SubresourceRange;
use crate::resource::ResourceHandle;

/// Native object a barrier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierTarget {
    Buffer {
        buffer: vk::Buffer,
    },
    Image {
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
    },
}

/// One queued barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBarrier {
    pub resource: ResourceHandle,
    pub target: BarrierTarget,
    pub range: SubresourceRange,
    pub info: ResourceBarrierInfo,
}

impl PendingBarrier {
    /// Fold `other` into this barrier if it is for the same resource, uses the
    /// same layouts and its range merges into a rectangle.
    fn try_merge(&mut self, other: &PendingBarrier) -> bool {
        if self.resource != other.resource || self.target != other.target {
            return false;
        }
        if self.info.old_layout != other.info.old_layout
            || self.info.new_layout != other.info.new_layout
        {
            return false;
        }
        let Some(range) = self.range.merge(&other.range) else {
            return false;
        };
        self.range = range;
        self.info.try_merge(&other.info)
    }
}

/// Barriers gathered until the next flush point, in enqueue order.
#[derive(Debug, Default)]
pub struct PendingBarrierQueue {
    entries: Vec<PendingBarrier>,
}

impl PendingBarrierQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a barrier. Empty barriers and empty ranges are dropped.
    ///
    /// Returns whether the barrier was kept.
    pub fn enqueue(
        &mut self,
        resource: ResourceHandle,
        target: BarrierTarget,
        range: SubresourceRange,
        info: ResourceBarrierInfo,
    ) -> bool {
        if info.is_empty() || range.is_empty() {
            return false;
        }
        self.entries.push(PendingBarrier {
            resource,
            target,
            range,
            info,
        });
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[PendingBarrier] {
        &self.entries
    }

    /// Merge runs of adjacent entries for the same resource.
    pub fn coalesce(&mut self) {
        if self.entries.len() < 2 {
            return;
        }
        let mut merged: Vec<PendingBarrier> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.try_merge(&entry) {
                    continue;
                }
            }
            merged.push(entry);
        }
        self.entries = merged;
    }

    /// Coalesce and hand out everything queued so far.
    pub fn take(&mut self) -> Vec<PendingBarrier> {
        self.coalesce();
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Access, SyncRequest};
    use ash::vk::Handle;

    fn image_target() -> BarrierTarget {
        BarrierTarget::Image {
            image: vk::Image::from_raw(7),
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    fn transition(old: vk::ImageLayout, new: vk::ImageLayout, dst: Access) -> ResourceBarrierInfo {
        ResourceBarrierInfo {
            src: SyncRequest::transfer_write().access,
            dst,
            old_layout: old,
            new_layout: new,
        }
    }

    #[test]
    fn empty_barriers_and_ranges_are_discarded() {
        let mut queue = PendingBarrierQueue::new();
        let handle = ResourceHandle::new(0, 0);
        let target = BarrierTarget::Buffer {
            buffer: vk::Buffer::from_raw(1),
        };
        assert!(!queue.enqueue(
            handle,
            target,
            SubresourceRange::WHOLE_BUFFER,
            ResourceBarrierInfo::default()
        ));
        let info = transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::UNDEFINED,
            SyncRequest::compute_read().access,
        );
        assert!(!queue.enqueue(handle, target, SubresourceRange::new(0, 0, 0, 1), info));
        assert!(queue.enqueue(handle, target, SubresourceRange::WHOLE_BUFFER, info));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn adjacent_mips_with_same_layouts_merge() {
        let mut queue = PendingBarrierQueue::new();
        let handle = ResourceHandle::new(3, 1);
        let sampled = SyncRequest::sampled(vk::PipelineStageFlags2::FRAGMENT_SHADER).access;
        let info = transition(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            sampled,
        );
        for mip in 0..4 {
            queue.enqueue(handle, image_target(), SubresourceRange::single(mip, 0), info);
        }

        let merged = queue.take();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].range, SubresourceRange::new(0, 4, 0, 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn different_layouts_or_resources_stay_separate() {
        let mut queue = PendingBarrierQueue::new();
        let a = ResourceHandle::new(0, 0);
        let b = ResourceHandle::new(1, 0);
        let dst = SyncRequest::compute_read().access;
        let general = transition(vk::ImageLayout::GENERAL, vk::ImageLayout::GENERAL, dst);
        let to_src = transition(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
        );

        queue.enqueue(a, image_target(), SubresourceRange::single(0, 0), general);
        queue.enqueue(a, image_target(), SubresourceRange::single(1, 0), to_src);
        queue.enqueue(b, image_target(), SubresourceRange::single(2, 0), to_src);
        queue.coalesce();
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn contained_range_merges_payloads() {
        let mut queue = PendingBarrierQueue::new();
        let handle = ResourceHandle::new(0, 0);
        let layout = vk::ImageLayout::GENERAL;
        let compute = transition(layout, layout, SyncRequest::compute_read().access);
        let copy = transition(layout, layout, SyncRequest::transfer_read().access);

        queue.enqueue(handle, image_target(), SubresourceRange::new(0, 4, 0, 2), compute);
        queue.enqueue(handle, image_target(), SubresourceRange::single(2, 1), copy);
        let merged = queue.take();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].range, SubresourceRange::new(0, 4, 0, 2));
        assert_eq!(
            merged[0].info.dst,
            SyncRequest::compute_read().access | SyncRequest::transfer_read().access
        );
    }
}
