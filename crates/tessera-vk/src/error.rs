//! Engine error types.

use ash::vk;
use thiserror::Error;

use crate::resource::ResourceHandle;

/// Errors produced by the synchronization engine and memory allocator.
#[derive(Error, Debug)]
pub enum VkError {
    /// Unexpected Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// The device was lost. Fatal for the device.
    #[error("Device lost")]
    DeviceLost,

    /// A native memory allocation failed.
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// No memory type satisfies the requested type mask and property flags.
    #[error("No suitable memory type (type bits {type_bits:#x}, properties {properties:?})")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    /// A command list operation was called in the wrong recording state.
    #[error("Cannot {operation} a command list in state {state}")]
    InvalidRecordingState {
        operation: &'static str,
        state: &'static str,
    },

    /// The handle refers to a destroyed (or destroying) resource.
    #[error("Resource {0:?} has been destroyed")]
    ResourceDestroyed(ResourceHandle),

    /// The handle refers to a resource of the wrong kind.
    #[error("Resource {handle:?} is not a {expected}")]
    WrongResourceKind {
        handle: ResourceHandle,
        expected: &'static str,
    },

    /// A subresource range exceeds the resource's mip/layer counts.
    #[error("Subresource range out of bounds for {0:?}")]
    SubresourceOutOfRange(ResourceHandle),

    /// Host access was requested for memory that is not host-mapped.
    #[error("Resource {0:?} is not host-mapped")]
    NotHostMapped(ResourceHandle),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<vk::Result> for VkError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfDeviceMemory
            }
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, VkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_results_map_to_fatal_variants() {
        assert!(matches!(
            VkError::from(vk::Result::ERROR_DEVICE_LOST),
            VkError::DeviceLost
        ));
        assert!(matches!(
            VkError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            VkError::OutOfDeviceMemory
        ));
        assert!(matches!(
            VkError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            VkError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }
}
