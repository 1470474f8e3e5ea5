use std::fmt::Debug;

use ash::vk;

use crate::{
    buffer::{BufferLike, BufferExt},
    device::{BufferInfo, Device, MemoryLocation, RayTracingProperties, SbtRegions},
    error::{Error, Result},
    utils::align_up,
};

/// Placement of one SBT region within the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegionLayout {
    /// Byte offset from the start of the table. Always a multiple of the base alignment.
    pub offset: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub count: u32,
}

impl SbtRegionLayout {
    fn region(&self, base: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        if self.count == 0 {
            return vk::StridedDeviceAddressRegionKHR::default();
        }
        vk::StridedDeviceAddressRegionKHR {
            device_address: base + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Byte layout of a shader binding table: raygen, miss, hit, then callable regions.
///
/// With handle size `H`, handle alignment `A` and base alignment `B`:
/// - the raygen region holds one record; its stride and size are `H` rounded up to `A`, then to `B`
/// - every other region has stride `H` rounded up to `A`, and size `count * stride` rounded up to `B`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub raygen: SbtRegionLayout,
    pub miss: SbtRegionLayout,
    pub hit: SbtRegionLayout,
    pub callable: SbtRegionLayout,
}

impl SbtLayout {
    pub fn compute(
        properties: &RayTracingProperties,
        miss_count: u32,
        hit_count: u32,
        callable_count: u32,
    ) -> Self {
        let handle_size = properties.shader_group_handle_size as vk::DeviceSize;
        let handle_alignment = properties.shader_group_handle_alignment.max(1) as vk::DeviceSize;
        let base_alignment = properties.shader_group_base_alignment.max(1) as vk::DeviceSize;

        let raygen_stride = align_up(align_up(handle_size, handle_alignment), base_alignment);
        let raygen = SbtRegionLayout {
            offset: 0,
            stride: raygen_stride,
            size: raygen_stride,
            count: 1,
        };
        let record_stride = align_up(handle_size, handle_alignment);
        let region = |offset: vk::DeviceSize, count: u32| SbtRegionLayout {
            offset,
            stride: record_stride,
            size: align_up(count as vk::DeviceSize * record_stride, base_alignment),
            count,
        };
        let miss = region(raygen.offset + raygen.size, miss_count);
        let hit = region(miss.offset + miss.size, hit_count);
        let callable = region(hit.offset + hit.size, callable_count);
        Self {
            handle_size: properties.shader_group_handle_size,
            raygen,
            miss,
            hit,
            callable,
        }
    }

    /// Regions in group order.
    pub fn regions(&self) -> [&SbtRegionLayout; 4] {
        [&self.raygen, &self.miss, &self.hit, &self.callable]
    }

    pub fn group_count(&self) -> u32 {
        self.regions().iter().map(|region| region.count).sum()
    }

    pub fn total_size(&self) -> vk::DeviceSize {
        self.callable.offset + self.callable.size
    }

    /// Copies tightly packed group handles, in group order, to their records in `dst`.
    /// Padding bytes are left untouched.
    pub fn write_handles(&self, dst: &mut [u8], handles: &[u8]) -> Result<()> {
        let handle_size = self.handle_size as usize;
        if handles.len() < self.group_count() as usize * handle_size
            || (dst.len() as vk::DeviceSize) < self.total_size()
        {
            return Err(Error::SbtQueryFailed(vk::Result::INCOMPLETE));
        }
        let mut handles = handles.chunks_exact(handle_size);
        for region in self.regions() {
            for (i, handle) in (0..region.count).zip(handles.by_ref()) {
                let start = (region.offset + i as vk::DeviceSize * region.stride) as usize;
                dst[start..start + handle_size].copy_from_slice(handle);
            }
        }
        Ok(())
    }

    /// Device address ranges of each region for a table starting at `base`.
    pub fn device_regions(&self, base: vk::DeviceAddress) -> SbtRegions {
        SbtRegions {
            raygen: self.raygen.region(base),
            miss: self.miss.region(base),
            hit: self.hit.region(base),
            callable: self.callable.region(base),
        }
    }
}

/// A host visible buffer holding the group handles of a ray tracing pipeline.
pub struct ShaderBindingTable<D: Device> {
    buffer: D::Buffer,
    layout: SbtLayout,
    regions: SbtRegions,
}

impl<D: Device> ShaderBindingTable<D> {
    pub fn new(
        device: &D,
        pipeline: vk::Pipeline,
        miss_count: u32,
        hit_count: u32,
        callable_count: u32,
    ) -> Result<Self> {
        let properties = device.ray_tracing_properties();
        let layout = SbtLayout::compute(properties, miss_count, hit_count, callable_count);
        let handles = device
            .ray_tracing_shader_group_handles(pipeline, 0, layout.group_count())
            .map_err(Error::SbtQueryFailed)?;

        let size = layout.total_size();
        let mut buffer = device
            .create_buffer(&BufferInfo {
                size,
                alignment: properties.shader_group_base_alignment.max(1) as vk::DeviceSize,
                usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::Host,
                name: "shader binding table",
            })
            .map_err(|err| Error::from_alloc(size, err))?;
        let mut contents = vec![0u8; size as usize];
        layout.write_handles(&mut contents, &handles)?;
        buffer.update_contents(&contents)?;

        let regions = layout.device_regions(buffer.device_address());
        tracing::info!(
            size,
            miss = miss_count,
            hit = hit_count,
            callable = callable_count,
            "Created shader binding table"
        );
        Ok(Self {
            buffer,
            layout,
            regions,
        })
    }

    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }
}

impl<D: Device> Debug for ShaderBindingTable<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderBindingTable")
            .field("layout", &self.layout)
            .field("regions", &self.regions)
            .finish_non_exhaustive()
    }
}
