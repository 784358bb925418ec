//! Vulkan execution core for the Tessera engine.
//!
//! This crate provides:
//! - Automatic pipeline barrier placement from per-subresource hazard tracking
//! - Barrier batching in legacy or synchronization2 form
//! - Submission ordering, completion polling and deferred resource destruction
//! - Device memory sub-allocation from large chunks
//! - Command lists with copy, dispatch and dynamic rendering operations

pub mod capabilities;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod fence;
pub mod memory;
pub mod recording;
pub mod resource;
pub mod staging;
pub mod submission;
pub mod sync;

pub use capabilities::{DeviceCapabilities, GpuVendor};
pub use command::{ColorAttachment, CommandList, DepthAttachment, RenderingDesc};
pub use config::{AllocatorConfig, DeviceConfig};
pub use device::{Device, DeviceStats, MappedRead, SubmissionInfo, SubmitOptions};
pub use error::{Result, VkError};
pub use memory::{AllocatorStats, MemoryAllocator, MemoryBlock};
pub use recording::RecordingPhase;
pub use resource::{BufferDesc, ImageDesc, MemoryLocation, ResourceHandle};
pub use sync::{BarrierStrategy, SubresourceRange, SyncRequest};
