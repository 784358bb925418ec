//! Fences, semaphores and their pools.

use crate::error::Result;
use ash::vk;

/// Retired fences ready for reuse.
///
/// Fences come back still signaled and are reset when handed out again, so a
/// late waiter on a retired fence never blocks.
#[derive(Debug, Default)]
pub struct FencePool {
    idle: Vec<vk::Fence>,
}

impl FencePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an unsignaled fence, creating one if the pool is empty.
    ///
    /// Pooled fences that fail to reset are destroyed and skipped.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn acquire(&mut self, device: &ash::Device) -> Result<vk::Fence> {
        while let Some(fence) = self.idle.pop() {
            match device.reset_fences(&[fence]) {
                Ok(()) => return Ok(fence),
                Err(err) => {
                    tracing::warn!(?fence, %err, "Failed to reset pooled fence, destroying it");
                    device.destroy_fence(fence, None);
                }
            }
        }
        let fence = device.create_fence(&vk::FenceCreateInfo::default(), None)?;
        tracing::trace!(?fence, "Created pooled fence");
        Ok(fence)
    }

    /// Non-blocking poll of a fence this pool handed out.
    ///
    /// # Safety
    /// The device and fence must be valid.
    pub unsafe fn is_signaled(device: &ash::Device, fence: vk::Fence) -> Result<bool> {
        Ok(device.get_fence_status(fence)?)
    }

    /// Block until `fence` signals or `timeout_ns` elapses.
    ///
    /// # Safety
    /// The device and fence must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn wait(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        device.wait_for_fences(&[fence], true, timeout_ns)?;
        Ok(())
    }

    /// Keep a retired fence for reuse. No pending submission may use it.
    pub fn release(&mut self, fence: vk::Fence) {
        self.idle.push(fence);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Destroy every pooled fence.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for fence in self.idle.drain(..) {
            device.destroy_fence(fence, None);
        }
    }
}

/// Binary semaphores ready for reuse.
#[derive(Debug, Default)]
pub struct SemaphorePool {
    idle: Vec<vk::Semaphore>,
}

impl SemaphorePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an unsignaled semaphore, creating one if the pool is empty.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn acquire(&mut self, device: &ash::Device) -> Result<vk::Semaphore> {
        if let Some(semaphore) = self.idle.pop() {
            return Ok(semaphore);
        }
        let semaphore = device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
        tracing::trace!(?semaphore, "Created pooled semaphore");
        Ok(semaphore)
    }

    /// Return a semaphore whose signal has been waited on.
    pub fn release(&mut self, semaphore: vk::Semaphore) {
        self.idle.push(semaphore);
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Destroy every pooled semaphore.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for semaphore in self.idle.drain(..) {
            device.destroy_semaphore(semaphore, None);
        }
    }
}
