//! Headless device setup, off-screen rendering and image comparison.

use ash::vk;
use image::{ImageBuffer, RgbaImage};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tessera_vk::{
    BufferDesc, ColorAttachment, CommandList, Device, DeviceConfig, ImageDesc, MemoryLocation,
    RenderingDesc, ResourceHandle, SubmitOptions,
};

use crate::instance::{
    create_device, create_instance, find_graphics_queue_family, select_physical_device,
};
use crate::{Result, TestError};

/// Install a test-friendly `tracing` subscriber, once per process.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Builder for a [`HeadlessDevice`].
pub struct HeadlessDeviceBuilder {
    app_name: String,
    enable_validation: bool,
    config: DeviceConfig,
}

impl Default for HeadlessDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "tessera-test".to_string(),
            enable_validation: cfg!(debug_assertions),
            config: DeviceConfig::default(),
        }
    }
}

impl HeadlessDeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Load Vulkan, pick a device and wrap it in a [`Device`].
    pub fn build(self) -> Result<HeadlessDevice> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| TestError::Setup(format!("Failed to load Vulkan: {e}")))?;
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation)? };

        match unsafe { Self::open_device(&instance, self.config) } {
            Ok(device) => Ok(HeadlessDevice {
                entry,
                instance,
                device: ManuallyDrop::new(device),
            }),
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    unsafe fn open_device(instance: &ash::Instance, config: DeviceConfig) -> Result<Arc<Device>> {
        let physical_device = select_physical_device(instance)?;
        let queue_family =
            find_graphics_queue_family(instance, physical_device).ok_or(TestError::NoSuitableDevice)?;
        let (raw, capabilities) = create_device(instance, physical_device, queue_family)?;
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let device = Device::new(raw, physical_device, queue_family, capabilities, config)?;
        Ok(device)
    }
}

/// A [`Device`] on its own instance, with no surface.
pub struct HeadlessDevice {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    device: ManuallyDrop<Arc<Device>>,
}

impl HeadlessDevice {
    /// Create with default settings.
    pub fn new() -> Result<Self> {
        HeadlessDeviceBuilder::new().build()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        // SAFETY: the field is never touched again.
        let device = unsafe { ManuallyDrop::take(&mut self.device) };
        if Arc::strong_count(&device) > 1 {
            tracing::warn!("Device still shared when the harness dropped, leaking the instance");
            return;
        }
        drop(device);
        unsafe { self.instance.destroy_instance(None) };
    }
}

/// An RGBA8 color image with a host-visible readback buffer.
pub struct OffscreenTarget {
    image: ResourceHandle,
    view: vk::ImageView,
    readback: ResourceHandle,
    list: CommandList,
    width: u32,
    height: u32,
}

impl OffscreenTarget {
    pub fn new(device: &Device, width: u32, height: u32) -> Result<Self> {
        let extent = vk::Extent2D { width, height };
        let image = device.create_image(&ImageDesc::new(
            vk::Format::R8G8B8A8_UNORM,
            extent,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
        ))?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(device.raw_image(image)?)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let view = unsafe { device.raw().create_image_view(&view_info, None)? };

        let readback = device.create_buffer(
            &BufferDesc::new(
                u64::from(width) * u64::from(height) * 4,
                vk::BufferUsageFlags::TRANSFER_DST,
            )
            .with_location(MemoryLocation::GpuToCpu),
        )?;
        let list = CommandList::new(device)?;

        Ok(Self {
            image,
            view,
            readback,
            list,
            width,
            height,
        })
    }

    /// Clear the target to `rgba` in a rendering pass and read it back.
    pub fn render_clear(&mut self, device: &Device, rgba: [f32; 4]) -> Result<RgbaImage> {
        let attachment = ColorAttachment::new(self.image, self.view).with_clear(rgba);
        let extent = vk::Extent2D {
            width: self.width,
            height: self.height,
        };

        self.list.begin(device)?;
        self.list.begin_rendering(
            device,
            &RenderingDesc {
                render_area: vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                },
                color_attachments: std::slice::from_ref(&attachment),
                depth_attachment: None,
            },
        )?;
        self.list.end_rendering(device)?;

        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            });
        self.list
            .copy_image_to_buffer(device, self.image, self.readback, &[region])?;
        self.list.end(device)?;
        device.submit(&mut self.list, &SubmitOptions::default())?;

        let data = device.read_buffer(self.readback)?;
        ImageBuffer::from_raw(self.width, self.height, data)
            .ok_or_else(|| TestError::Setup("Readback size does not match target".to_string()))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Release the target's resources after waiting for the device.
    pub fn destroy(&mut self, device: &Device) -> Result<()> {
        device.wait_idle()?;
        unsafe {
            self.list.destroy(device);
            device.raw().destroy_image_view(self.view, None);
        }
        device.destroy_resource(self.image)?;
        device.destroy_resource(self.readback)?;
        Ok(())
    }
}

/// Normalized RGB difference between two images (0.0-1.0).
pub fn image_difference(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();

    let max_diff = (u64::from(a.width()) * u64::from(a.height()) * 3 * 255).max(1) as f64;
    Ok(total_diff as f64 / max_diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tessera_vk::{BarrierStrategy, RecordingPhase, VkError};

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
        ImageBuffer::from_pixel(width, height, Rgba(rgba))
    }

    #[test]
    fn identical_images_have_no_difference() {
        let a = solid(4, 4, [10, 20, 30, 255]);
        assert_eq!(image_difference(&a, &a.clone()).unwrap(), 0.0);
    }

    #[test]
    fn opposite_images_differ_fully() {
        let black = solid(2, 2, [0, 0, 0, 255]);
        let white = solid(2, 2, [255, 255, 255, 0]);
        assert!((image_difference(&black, &white).unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mismatched_dimensions_are_reported() {
        let a = solid(2, 2, [0, 0, 0, 255]);
        let b = solid(3, 2, [0, 0, 0, 255]);
        assert!(matches!(
            image_difference(&a, &b),
            Err(TestError::ImageComparison(_))
        ));
    }

    // These tests require a GPU and will be skipped in CI without GPU support

    fn upload_copy_readback(device: &Device) -> Vec<u8> {
        let data: Vec<u8> = (0..=255).collect();
        let size = data.len() as u64;
        let upload = device
            .create_buffer(
                &BufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_SRC)
                    .with_location(MemoryLocation::CpuToGpu),
            )
            .unwrap();
        let gpu = device
            .create_buffer(&BufferDesc::new(
                size,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            ))
            .unwrap();
        let readback = device
            .create_buffer(
                &BufferDesc::new(size, vk::BufferUsageFlags::TRANSFER_DST)
                    .with_location(MemoryLocation::GpuToCpu),
            )
            .unwrap();

        device.write_buffer(upload, 0, &data).unwrap();
        let region = vk::BufferCopy::default().size(size);
        let mut list = CommandList::new(device).unwrap();
        list.begin(device).unwrap();
        list.copy_buffer(device, upload, gpu, &[region]).unwrap();
        list.copy_buffer(device, gpu, readback, &[region]).unwrap();
        list.end(device).unwrap();
        device.submit(&mut list, &SubmitOptions::default()).unwrap();

        let result = device.read_buffer(readback).unwrap();
        device.wait_idle().unwrap();
        unsafe { list.destroy(device) };
        for handle in [upload, gpu, readback] {
            device.destroy_resource(handle).unwrap();
        }
        result
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_device_creation() {
        init_test_logging();
        let headless = HeadlessDevice::new().unwrap();
        assert_eq!(headless.device().stats().in_flight_submissions, 0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffer_round_trip() {
        init_test_logging();
        let headless = HeadlessDevice::new().unwrap();
        let expected: Vec<u8> = (0..=255).collect();
        assert_eq!(upload_copy_readback(headless.device()), expected);
        assert_eq!(headless.device().allocator_stats().live_blocks, 0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffer_round_trip_with_legacy_barriers() {
        init_test_logging();
        let headless = HeadlessDeviceBuilder::new()
            .config(DeviceConfig::new().with_legacy_barriers(true))
            .build()
            .unwrap();
        assert_eq!(headless.device().barrier_strategy(), BarrierStrategy::Legacy);
        let expected: Vec<u8> = (0..=255).collect();
        assert_eq!(upload_copy_readback(headless.device()), expected);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn update_and_fill_through_staging() {
        init_test_logging();
        let headless = HeadlessDevice::new().unwrap();
        let device = headless.device();
        let buffer = device
            .create_buffer(
                &BufferDesc::new(64, vk::BufferUsageFlags::TRANSFER_DST)
                    .with_location(MemoryLocation::GpuToCpu),
            )
            .unwrap();

        let mut list = CommandList::new(device).unwrap();
        list.begin(device).unwrap();
        list.fill_buffer(device, buffer, 0, 64, 0xABAB_ABAB).unwrap();
        list.update_buffer(device, buffer, 8, &[1, 2, 3, 4]).unwrap();
        list.end(device).unwrap();
        device.submit(&mut list, &SubmitOptions::default()).unwrap();

        let data = device.read_buffer(buffer).unwrap();
        assert_eq!(&data[..8], &[0xAB; 8]);
        assert_eq!(&data[8..12], &[1, 2, 3, 4]);
        assert_eq!(&data[12..], &[0xAB; 52][..]);
        assert_eq!(device.stats().pooled_staging_buffers, 1);

        unsafe { list.destroy(device) };
        device.destroy_resource(buffer).unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn destruction_waits_for_completion() {
        init_test_logging();
        let headless = HeadlessDevice::new().unwrap();
        let device = headless.device();
        let buffer = device
            .create_buffer(&BufferDesc::new(1024, vk::BufferUsageFlags::TRANSFER_DST))
            .unwrap();

        let completed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&completed);
        let mut list = CommandList::new(device).unwrap();
        list.begin(device).unwrap();
        list.fill_buffer(device, buffer, 0, 1024, 0).unwrap();
        list.end(device).unwrap();
        list.on_complete(move || flag.store(true, Ordering::SeqCst));
        let info = device.submit(&mut list, &SubmitOptions::default()).unwrap();

        device.destroy_resource(buffer).unwrap();
        assert_eq!(device.stats().deferred_destructions, 1);
        assert!(matches!(
            device.raw_buffer(buffer),
            Err(VkError::ResourceDestroyed(_))
        ));

        device.wait_for_fence(info.fence).unwrap();
        assert!(completed.load(Ordering::SeqCst));
        assert_eq!(list.phase(), RecordingPhase::Completed);
        let stats = device.stats();
        assert_eq!(stats.deferred_destructions, 0);
        assert_eq!(stats.resources, 0);
        assert_eq!(stats.pooled_fences, 1);

        unsafe { list.destroy(device) };
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn recording_contract_violations() {
        init_test_logging();
        let headless = HeadlessDevice::new().unwrap();
        let device = headless.device();
        let mut list = CommandList::new(device).unwrap();

        assert!(matches!(
            list.end(device),
            Err(VkError::InvalidRecordingState { .. })
        ));
        list.begin(device).unwrap();
        assert!(matches!(
            list.begin(device),
            Err(VkError::InvalidRecordingState { .. })
        ));
        assert!(matches!(
            list.draw(device, 3, 1, 0, 0),
            Err(VkError::InvalidRecordingState { .. })
        ));
        list.end(device).unwrap();
        unsafe { list.destroy(device) };
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn clear_renders_solid_color() {
        init_test_logging();
        let headless = HeadlessDevice::new().unwrap();
        let device = headless.device();
        let mut target = OffscreenTarget::new(device, 32, 32).unwrap();

        let image = target.render_clear(device, [1.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(image.dimensions(), (32, 32));
        let expected = solid(32, 32, [255, 0, 0, 255]);
        assert_eq!(image_difference(&image, &expected).unwrap(), 0.0);

        // A second frame transitions from the copy-source layout back to attachment.
        let image = target.render_clear(device, [0.0, 0.0, 1.0, 1.0]).unwrap();
        assert_eq!(image.get_pixel(5, 5), &Rgba([0, 0, 255, 255]));

        target.destroy(device).unwrap();
    }
}
