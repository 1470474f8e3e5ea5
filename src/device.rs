//! The device seam.
//!
//! Every object in this crate talks to the GPU through the [`Device`] trait
//! instead of calling into a driver directly. [`VulkanDevice`](crate::VulkanDevice)
//! is the production implementation, backed by `ash` and `vk-mem`. Tests use
//! an in-memory implementation that records every call.
//!
//! The trait speaks in plain Vulkan handles and a few crate-owned descriptions
//! ([`BufferInfo`], [`DescriptorWrite`], [`AccelBuildInfo`],
//! [`RayTracingPipelineDesc`]) so that no pointer chains cross the seam.
//!
//! Implementations are expected to be cheap to clone: every object keeps its
//! own copy of the device it was created from.

use std::ffi::CStr;

use ash::{prelude::VkResult, vk};
use glam::UVec3;

use crate::buffer::BufferLike;

/// Ray tracing limits of a physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size in bytes of one shader group handle.
    pub shader_group_handle_size: u32,
    /// Required alignment of each SBT record.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of the start of each SBT region.
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    /// `minAccelerationStructureScratchOffsetAlignment`
    pub min_scratch_offset_alignment: u32,
}

impl Default for RayTracingProperties {
    /// Values reported by most desktop drivers.
    fn default() -> Self {
        Self {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 31,
            min_scratch_offset_alignment: 128,
        }
    }
}

/// Where a buffer lives and whether the host can see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device local memory, not host visible.
    Private,
    /// Host visible memory, mapped for its whole lifetime.
    Host,
    /// Device local memory that is also host visible, mapped. Falls back to
    /// host memory on devices without resizable BAR.
    Upload,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferInfo<'a> {
    pub size: vk::DeviceSize,
    /// Minimum alignment of the allocation. 1 means no extra requirement.
    pub alignment: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Debug name.
    pub name: &'a str,
}

impl Default for BufferInfo<'_> {
    fn default() -> Self {
        Self {
            size: 0,
            alignment: 1,
            usage: vk::BufferUsageFlags::empty(),
            location: MemoryLocation::Private,
            name: "",
        }
    }
}

/// The descriptors written to one binding.
#[derive(Debug, Clone, Copy)]
pub enum DescriptorResources<'a> {
    Buffers(&'a [vk::DescriptorBufferInfo]),
    Images(&'a [vk::DescriptorImageInfo]),
    AccelerationStructures(&'a [vk::AccelerationStructureKHR]),
}

impl DescriptorResources<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Buffers(b) => b.len(),
            Self::Images(i) => i.len(),
            Self::AccelerationStructures(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One descriptor write, always starting at array element 0.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite<'a> {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub resources: DescriptorResources<'a>,
}

/// Geometry consumed by an acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelGeometry {
    Triangles {
        vertex_format: vk::Format,
        vertex_data: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        /// Highest vertex index referenced by the index buffer.
        max_vertex: u32,
        index_type: vk::IndexType,
        index_data: vk::DeviceAddress,
    },
    Instances {
        /// Tightly packed `VkAccelerationStructureInstanceKHR` records.
        data: vk::DeviceAddress,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct AccelBuildInfo<'a> {
    pub level: vk::AccelerationStructureTypeKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometry_flags: vk::GeometryFlagsKHR,
    pub geometry: &'a AccelGeometry,
    /// Triangle count for bottom level builds, instance count for top level.
    pub primitive_count: u32,
    /// Null for a full build. Equal to `dst` for an in-place update.
    pub src: vk::AccelerationStructureKHR,
    /// Null when only querying sizes.
    pub dst: vk::AccelerationStructureKHR,
    /// Ignored when querying sizes.
    pub scratch: vk::DeviceAddress,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineStage<'a> {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: &'a CStr,
}

#[derive(Debug, Clone, Copy)]
pub struct RayTracingPipelineDesc<'a> {
    pub stages: &'a [PipelineStage<'a>],
    pub groups: &'a [vk::RayTracingShaderGroupCreateInfoKHR<'static>],
    pub max_ray_recursion_depth: u32,
    pub layout: vk::PipelineLayout,
}

/// Device addresses of the four SBT regions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

pub trait Device: Clone + Send + Sync + 'static {
    type Buffer: BufferLike + Send + Sync;

    fn ray_tracing_properties(&self) -> &RayTracingProperties;

    fn create_buffer(&self, info: &BufferInfo<'_>) -> VkResult<Self::Buffer>;

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    /// Allocates one set from the device's shared pool.
    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn free_descriptor_set(&self, set: vk::DescriptorSet);
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite<'_>]);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_>)
    -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    /// Handles of `group_count` groups starting at `first_group`, tightly packed.
    fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> VkResult<Vec<u8>>;

    fn acceleration_structure_build_sizes(
        &self,
        info: &AccelBuildInfo<'_>,
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static>;
    /// Creates an acceleration structure occupying the whole of `buffer`.
    fn create_acceleration_structure(
        &self,
        buffer: &Self::Buffer,
        level: vk::AccelerationStructureTypeKHR,
    ) -> VkResult<vk::AccelerationStructureKHR>;
    fn acceleration_structure_device_address(
        &self,
        accel: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress;
    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR);

    /// Records `record` into a fresh command buffer, submits it and waits for completion.
    fn submit_and_wait(&self, record: &mut dyn FnMut(vk::CommandBuffer)) -> VkResult<()>;

    fn cmd_build_acceleration_structure(&self, cmd: vk::CommandBuffer, info: &AccelBuildInfo<'_>);
    /// Makes acceleration structure writes from earlier builds visible to later
    /// builds and ray tracing shaders.
    fn cmd_acceleration_structure_barrier(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    );
    fn cmd_trace_rays(&self, cmd: vk::CommandBuffer, regions: &SbtRegions, extent: UVec3);
}

/// Types associated with a [`Device`].
pub trait HasDevice {
    type Device: Device;

    fn device(&self) -> &Self::Device;

    fn ray_tracing_properties(&self) -> &RayTracingProperties {
        self.device().ray_tracing_properties()
    }
}
