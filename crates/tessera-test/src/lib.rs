//! Test harness for the Tessera engine.
//!
//! Provides headless device creation, off-screen render targets with readback,
//! and comparison of read-back images.

pub mod harness;
pub mod instance;

pub use harness::{
    image_difference, init_test_logging, HeadlessDevice, HeadlessDeviceBuilder, OffscreenTarget,
};

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("Engine error: {0}")]
    Engine(#[from] tessera_vk::VkError),
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("No suitable GPU found")]
    NoSuitableDevice,
    #[error("Setup failed: {0}")]
    Setup(String),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
}

pub type Result<T> = std::result::Result<T, TestError>;
