//! GPU memory allocation.
//!
//! [`Allocator`] wraps the Vulkan Memory Allocator (VMA). It is created by
//! [`VulkanDevice`](crate::VulkanDevice) and shared by every [`Buffer`](crate::Buffer)
//! allocated through it. Buffer device addresses are always enabled since
//! acceleration structures and shader binding tables are addressed that way.

use std::{ops::Deref, sync::Arc};

use ash::{prelude::VkResult, vk};

/// Reference-counted VMA allocator. Cheap to clone.
#[derive(Clone)]
pub struct Allocator(Arc<AllocatorInner>);
struct AllocatorInner {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    inner: vk_mem::Allocator,
}

impl Allocator {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Self> {
        let mut info = vk_mem::AllocatorCreateInfo::new(instance, device, physical_device);
        info.flags |= vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;
        let alloc = unsafe { vk_mem::Allocator::new(info)? };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        Ok(Self(Arc::new(AllocatorInner {
            device: device.clone(),
            memory_properties,
            inner: alloc,
        })))
    }

    pub fn device(&self) -> &ash::Device {
        &self.0.device
    }

    /// Property flags of the memory type with the given index.
    pub fn memory_type_properties(&self, memory_type: u32) -> vk::MemoryPropertyFlags {
        self.0
            .memory_properties
            .memory_types
            .get(memory_type as usize)
            .map(|ty| ty.property_flags)
            .unwrap_or_default()
    }
}

impl Deref for Allocator {
    type Target = vk_mem::Allocator;

    fn deref(&self) -> &Self::Target {
        &self.0.inner
    }
}
