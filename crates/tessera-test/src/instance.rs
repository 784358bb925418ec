//! Headless instance and logical device negotiation.

use ash::vk;
use std::ffi::{CStr, CString};

use tessera_vk::DeviceCapabilities;

use crate::{Result, TestError};

/// Validation layers to enable when requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Instance extensions needed without a surface.
fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Create a Vulkan 1.3 instance with no surface extensions.
///
/// Missing validation layers are skipped with a warning.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| TestError::Setup(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Tessera")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const i8> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let available_layers = entry.enumerate_instance_layer_properties()?;
    let layers: Vec<&CStr> = if enable_validation {
        validation_layers()
            .into_iter()
            .filter(|layer| {
                let found = available_layers
                    .iter()
                    .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
                if !found {
                    tracing::warn!(?layer, "Validation layer not available");
                }
                found
            })
            .collect()
    } else {
        Vec::new()
    };
    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;
    Ok(instance)
}

/// Select the best Vulkan 1.3 physical device with a graphics queue.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    devices
        .into_iter()
        .filter(|device| find_graphics_queue_family(instance, *device).is_some())
        .map(|device| (score_physical_device(instance, device), device))
        .filter(|(score, _)| *score >= 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(TestError::NoSuitableDevice)
}

/// Score a physical device for selection; negative means unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = instance.get_physical_device_properties(device);

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        // Software rasterizers still run the tests.
        vk::PhysicalDeviceType::CPU => 10,
        _ => 0,
    };

    let memory = instance.get_physical_device_memory_properties(device);
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024 * 1024))
        .sum();
    score += vram_gb as i64;

    score
}

/// First queue family supporting graphics (and therefore compute and transfer).
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

/// Create a logical device with one graphics queue.
///
/// Synchronization2 and dynamic rendering are enabled when supported; the
/// returned capabilities report exactly what was enabled.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, DeviceCapabilities)> {
    let capabilities = DeviceCapabilities::query(instance, physical_device);

    let queue_priority = 1.0_f32;
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority));

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(capabilities.supports_synchronization2)
        .dynamic_rendering(capabilities.supports_dynamic_rendering);
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .push_next(&mut features2);

    let device = instance.create_device(physical_device, &device_create_info, None)?;
    Ok((device, capabilities))
}
