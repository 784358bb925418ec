//! Device capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// What the engine needs to know about a physical device.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    /// `vkCmdPipelineBarrier2` is available (and must have been enabled on the device).
    pub supports_synchronization2: bool,
    /// `vkCmdBeginRendering` is available.
    pub supports_dynamic_rendering: bool,
    /// `bufferImageGranularity`; sub-allocation sizes are rounded up to it.
    pub buffer_image_granularity: u64,
    /// Memory types, indexed by memory type index.
    pub memory_types: Vec<vk::MemoryType>,
    /// Total device-local heap size in MiB.
    pub device_local_memory_mb: u64,
}

impl DeviceCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default();
        let has_vulkan_1_3 = vk::api_version_major(properties.api_version) >= 1
            && vk::api_version_minor(properties.api_version) >= 3;
        if has_vulkan_1_3 {
            let mut features2 =
                vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_3_features);
            instance.get_physical_device_features2(physical_device, &mut features2);
        }

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Self::from_parts(
            device_name,
            &properties,
            &memory_properties,
            vulkan_1_3_features.synchronization2 == vk::TRUE,
            vulkan_1_3_features.dynamic_rendering == vk::TRUE,
        )
    }

    /// Build capabilities from already-queried device data.
    pub fn from_parts(
        device_name: String,
        properties: &vk::PhysicalDeviceProperties,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        supports_synchronization2: bool,
        supports_dynamic_rendering: bool,
    ) -> Self {
        let memory_types = memory_properties
            .memory_types
            .iter()
            .take(memory_properties.memory_type_count as usize)
            .copied()
            .collect();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            supports_synchronization2,
            supports_dynamic_rendering,
            buffer_image_granularity: properties.limits.buffer_image_granularity.max(1),
            memory_types,
            device_local_memory_mb,
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn from_parts_collects_memory_types_and_heaps() {
        let mut properties = vk::PhysicalDeviceProperties {
            vendor_id: 0x8086,
            api_version: vk::API_VERSION_1_3,
            ..Default::default()
        };
        properties.limits.buffer_image_granularity = 0;

        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            memory_heap_count: 2,
            ..Default::default()
        };
        memory_properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory_properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        memory_properties.memory_types[1].heap_index = 1;
        memory_properties.memory_heaps[0] = vk::MemoryHeap {
            size: 2048 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory_properties.memory_heaps[1] = vk::MemoryHeap {
            size: 512 * 1024 * 1024,
            flags: vk::MemoryHeapFlags::empty(),
        };

        let caps = DeviceCapabilities::from_parts(
            "Test GPU".to_string(),
            &properties,
            &memory_properties,
            true,
            false,
        );
        assert_eq!(caps.vendor, GpuVendor::Intel);
        assert_eq!(caps.memory_types.len(), 2);
        assert_eq!(caps.device_local_memory_mb, 2048);
        assert_eq!(caps.buffer_image_granularity, 1);
        assert!(caps.summary().starts_with("Test GPU (Intel) - Vulkan 1.3"));
    }
}
