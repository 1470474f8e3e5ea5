//! Vulkan buffers backed by VMA.
//!
//! - [`MemoryLocation::Private`]: GPU exclusive memory. Acceleration structure
//!   storage and scratch space live here.
//! - [`MemoryLocation::Upload`]: device local memory the host can write. Used for
//!   TLAS instance records.
//! - [`MemoryLocation::Host`]: host memory the device reads over the bus. Used for
//!   shader binding tables.
//!
//! Every buffer created with `SHADER_DEVICE_ADDRESS` usage caches its device address.

use std::{fmt::Debug, ops::RangeBounds};

use ash::{prelude::VkResult, vk};
use vk_mem::Alloc;

use crate::{Allocator, device::BufferInfo, device::MemoryLocation, utils::AsVkHandle};

/// Common interface for buffers handed out by a [`Device`](crate::Device).
///
/// Buffers may or may not be host visible depending on where they were allocated.
/// [`as_slice`](BufferLike::as_slice) and [`as_slice_mut`](BufferLike::as_slice_mut)
/// return `None` for buffers the host cannot map.
pub trait BufferLike: AsVkHandle<Handle = vk::Buffer> + Send + Sync + 'static {
    fn offset(&self) -> vk::DeviceSize;

    /// Zero unless created with `SHADER_DEVICE_ADDRESS` usage.
    fn device_address(&self) -> vk::DeviceAddress;

    fn size(&self) -> vk::DeviceSize;

    fn as_slice(&self) -> Option<&[u8]>;

    fn as_slice_mut(&mut self) -> Option<&mut [u8]>;

    fn flush(&mut self, range: impl RangeBounds<vk::DeviceSize>) -> VkResult<()>;
}

pub trait BufferExt: BufferLike {
    /// Copies `data` to the start of a host visible buffer and flushes it.
    fn update_contents(&mut self, data: &[u8]) -> VkResult<()> {
        let slice = self
            .as_slice_mut()
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let Some(dst) = slice.get_mut(..data.len()) else {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        };
        dst.copy_from_slice(data);
        self.flush(..data.len() as vk::DeviceSize)
    }
}
impl<T: BufferLike> BufferExt for T {}

fn range_to_offset_size(
    range: impl RangeBounds<vk::DeviceSize>,
    size: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let offset = match range.start_bound() {
        std::ops::Bound::Included(start) => *start,
        std::ops::Bound::Excluded(start) => start + 1,
        std::ops::Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        std::ops::Bound::Included(end) => end + 1,
        std::ops::Bound::Excluded(end) => *end,
        std::ops::Bound::Unbounded => size,
    };
    (offset, end - offset)
}

pub struct Buffer {
    allocator: Allocator,
    allocation: vk_mem::Allocation,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    device_address: vk::DeviceAddress,

    memory_properties: vk::MemoryPropertyFlags,
}
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}
impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("device_address", &self.device_address)
            .field("memory_properties", &self.memory_properties)
            .finish_non_exhaustive()
    }
}
impl AsVkHandle for Buffer {
    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
    type Handle = vk::Buffer;
}
impl BufferLike for Buffer {
    fn offset(&self) -> vk::DeviceSize {
        0
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn as_slice(&self) -> Option<&[u8]> {
        if !self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return None;
        }
        let mapped_data = self
            .allocator
            .get_allocation_info(&self.allocation)
            .mapped_data as *const u8;
        if mapped_data.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(mapped_data, self.size as usize) })
    }

    fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        if !self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return None;
        }
        let mapped_data = self
            .allocator
            .get_allocation_info(&self.allocation)
            .mapped_data as *mut u8;
        if mapped_data.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(mapped_data, self.size as usize) })
    }

    fn flush(&mut self, range: impl RangeBounds<vk::DeviceSize>) -> VkResult<()> {
        if self
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }
        let (offset, size) = range_to_offset_size(range, self.size);
        self.allocator
            .flush_allocation(&self.allocation, offset, size)
    }
}
impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.allocator
                .destroy_buffer(self.buffer, &mut self.allocation);
        }
    }
}

impl Buffer {
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.memory_properties
    }

    pub fn from_raw(
        allocator: Allocator,
        buffer: vk::Buffer,
        allocation: vk_mem::Allocation,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Self {
        let info = allocator.get_allocation_info(&allocation);
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            unsafe {
                allocator
                    .device()
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            }
        } else {
            0
        };

        Self {
            memory_properties: allocator.memory_type_properties(info.memory_type),
            allocator,
            buffer,
            allocation,
            size,
            device_address,
        }
    }

    pub fn new(allocator: Allocator, info: &BufferInfo<'_>) -> VkResult<Self> {
        let (usage, flags) = match info.location {
            MemoryLocation::Private => (
                vk_mem::MemoryUsage::AutoPreferDevice,
                vk_mem::AllocationCreateFlags::empty(),
            ),
            MemoryLocation::Host => (
                vk_mem::MemoryUsage::AutoPreferHost,
                vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
            MemoryLocation::Upload => (
                vk_mem::MemoryUsage::AutoPreferDevice,
                vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ),
        };
        unsafe {
            let (buffer, allocation) = allocator.create_buffer_with_alignment(
                &vk::BufferCreateInfo {
                    size: info.size,
                    usage: info.usage,
                    ..Default::default()
                },
                &vk_mem::AllocationCreateInfo {
                    usage,
                    flags,
                    ..Default::default()
                },
                info.alignment.max(1),
            )?;
            tracing::trace!(name = info.name, size = info.size, "Allocated buffer");
            Ok(Self::from_raw(
                allocator, buffer, allocation, info.usage, info.size,
            ))
        }
    }
}
