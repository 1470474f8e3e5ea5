//! Hardware ray tracing support.
//!
//! - [`Blas`]: a bottom-level acceleration structure over one triangle mesh.
//! - [`Tlas`]: a top-level acceleration structure over [`InstanceRecord`]s, with
//!   full rebuilds and cheap in-place updates.
//! - [`RayTracingPipeline`]: the shader groups of a ray tracing pipeline and the
//!   [`ShaderBindingTable`] built from them.
//!
//! All of these need the `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline` extensions, plus buffer device addresses.

mod blas;
mod pipeline;
mod sbt;
mod tlas;

pub use blas::{Blas, BlasCreateInfo};
pub use pipeline::{
    HitGroup, RayTracingPipeline, RayTracingPipelineCreateInfo, ShaderGroup, ShaderGroupKind,
};
pub use sbt::{SbtLayout, SbtRegionLayout, ShaderBindingTable};
pub use tlas::{InstanceMap, InstanceRecord, Tlas, TlasCreateInfo, TlasState};

use ash::vk;

use crate::{
    buffer::BufferLike,
    device::{BufferInfo, Device, HasDevice, MemoryLocation},
    error::{Error, Result},
    utils::AsVkHandle,
};

/// An acceleration structure together with the buffer backing it.
///
/// Destroyed on drop, before the backing buffer is released.
pub struct AccelStruct<D: Device> {
    device: D,
    raw: vk::AccelerationStructureKHR,
    level: vk::AccelerationStructureTypeKHR,
    device_address: vk::DeviceAddress,
    buffer: D::Buffer,
}

impl<D: Device> AccelStruct<D> {
    /// Allocates `size` bytes of private storage and creates an acceleration structure on it.
    pub fn new(
        device: D,
        size: vk::DeviceSize,
        level: vk::AccelerationStructureTypeKHR,
    ) -> Result<Self> {
        let name = if level == vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL {
            "BLAS backing buffer"
        } else {
            "TLAS backing buffer"
        };
        let buffer = device
            .create_buffer(&BufferInfo {
                size,
                alignment: 256,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::Private,
                name,
            })
            .map_err(|err| Error::from_alloc(size, err))?;
        Self::create_on_buffer(device, buffer, level)
    }

    /// Creates an acceleration structure occupying the whole of `buffer`.
    pub fn create_on_buffer(
        device: D,
        buffer: D::Buffer,
        level: vk::AccelerationStructureTypeKHR,
    ) -> Result<Self> {
        let raw = device
            .create_acceleration_structure(&buffer, level)
            .map_err(|err| Error::from_alloc(buffer.size(), err))?;
        let device_address = device.acceleration_structure_device_address(raw);
        Ok(Self {
            device,
            raw,
            level,
            device_address,
            buffer,
        })
    }

    pub fn level(&self) -> vk::AccelerationStructureTypeKHR {
        self.level
    }

    /// The address instances use to reference this structure.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Size of the backing buffer in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }
}

impl<D: Device> Drop for AccelStruct<D> {
    fn drop(&mut self) {
        self.device.destroy_acceleration_structure(self.raw);
    }
}

impl<D: Device> HasDevice for AccelStruct<D> {
    type Device = D;
    fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> AsVkHandle for AccelStruct<D> {
    fn vk_handle(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }
    type Handle = vk::AccelerationStructureKHR;
}

/// Allocates scratch space for a build, aligned for use as a scratch address.
pub(crate) fn create_scratch_buffer<D: Device>(device: &D, size: vk::DeviceSize) -> Result<D::Buffer> {
    let alignment = device
        .ray_tracing_properties()
        .min_scratch_offset_alignment
        .max(1) as vk::DeviceSize;
    device
        .create_buffer(&BufferInfo {
            size: size.max(1),
            alignment,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::Private,
            name: "acceleration structure scratch",
        })
        .map_err(|err| Error::from_alloc(size, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    #[test]
    fn test_accel_struct_lifecycle() {
        let device = MockDevice::new();
        let accel =
            AccelStruct::new(device.clone(), 1024, vk::AccelerationStructureTypeKHR::TOP_LEVEL)
                .unwrap();
        assert_eq!(accel.size(), 1024);
        assert_ne!(accel.device_address(), 0);
        assert_eq!(device.live_acceleration_structures(), 1);
        drop(accel);
        assert_eq!(device.live_acceleration_structures(), 0);
    }

    #[test]
    fn test_scratch_is_aligned() {
        let device = MockDevice::new();
        let scratch = create_scratch_buffer(&device, 100).unwrap();
        let alignment = device.ray_tracing_properties().min_scratch_offset_alignment as u64;
        assert_eq!(scratch.device_address() % alignment, 0);
    }

    #[test]
    fn test_one_triangle_scene() {
        use crate::{pipeline::Shader, testing::SpirvBuilder};
        use glam::Affine3A;

        let device = MockDevice::new();
        let shader = |stage| Shader::new(device.clone(), SpirvBuilder::new().finish(), stage).unwrap();
        let rgen = shader(vk::ShaderStageFlags::RAYGEN_KHR);
        let miss = shader(vk::ShaderStageFlags::MISS_KHR);
        let chit = shader(vk::ShaderStageFlags::CLOSEST_HIT_KHR);

        let blas = Blas::new(
            device.clone(),
            &BlasCreateInfo {
                vertex_data: 0x1000,
                vertex_count: 3,
                index_data: 0x2000,
                triangle_count: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let mut tlas = Tlas::new(device.clone(), TlasCreateInfo::default());
        tlas.build(&[InstanceRecord::new(&blas, Affine3A::IDENTITY)])
            .unwrap();
        assert_eq!(tlas.instance_count(), 1);
        let builds = device.accel_builds();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[0].level, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        assert_eq!(builds[0].primitive_count, 1);
        assert_eq!(builds[1].level, vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        assert_eq!(builds[1].primitive_count, 1);

        let pipeline = RayTracingPipeline::new(
            device.clone(),
            &RayTracingPipelineCreateInfo {
                miss: &[&miss],
                hit_groups: &[HitGroup::triangles(&chit)],
                ..RayTracingPipelineCreateInfo::new(&rgen)
            },
        )
        .unwrap();

        let props = device.ray_tracing_properties();
        let record = crate::utils::align_up(
            props.shader_group_handle_size as u64,
            props.shader_group_handle_alignment as u64,
        );
        let single_record = crate::utils::align_up(record, props.shader_group_base_alignment as u64);
        let regions = pipeline.regions();
        assert_eq!(regions.raygen.size, single_record);
        assert_eq!(regions.raygen.stride, single_record);
        assert_eq!(regions.miss.size, single_record);
        assert_eq!(regions.hit.size, single_record);
        assert_eq!(regions.hit.stride, record);
        assert_eq!(regions.callable.size, 0);
    }

    #[test]
    fn test_trace_a_scene() {
        use crate::{
            descriptor::{DescriptorSet, Resource},
            pipeline::Shader,
            testing::{SpirvBuilder, init_tracing},
        };
        use ash::vk::Handle;
        use glam::{Affine3A, UVec3, Vec3};

        init_tracing();
        let device = MockDevice::new();
        let shader = |spv: SpirvBuilder, stage| Shader::new(device.clone(), spv.finish(), stage).unwrap();

        let mut spv = SpirvBuilder::new();
        spv.acceleration_structure("topLevelAS", 0, 0);
        spv.storage_image("image", 0, 1);
        spv.uniform_buffer("camera", 0, 2);
        let rgen = shader(spv, vk::ShaderStageFlags::RAYGEN_KHR);
        let miss = shader(SpirvBuilder::new(), vk::ShaderStageFlags::MISS_KHR);
        let mut spv = SpirvBuilder::new();
        spv.acceleration_structure("topLevelAS", 0, 0);
        let chit = shader(spv, vk::ShaderStageFlags::CLOSEST_HIT_KHR);

        let blas = Blas::new(
            device.clone(),
            &BlasCreateInfo {
                vertex_data: 0x1000,
                vertex_count: 3,
                index_data: 0x2000,
                triangle_count: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let mut instances = vec![
            InstanceRecord::new(&blas, Affine3A::IDENTITY),
            InstanceRecord::new(&blas, Affine3A::from_translation(Vec3::X * 2.0)),
        ];
        let mut tlas = Tlas::new(device.clone(), TlasCreateInfo::default());
        tlas.build(&instances).unwrap();

        let mut set = DescriptorSet::new(device.clone(), &[&rgen, &miss, &chit]).unwrap();
        set.record("topLevelAS", &[tlas.descriptor().unwrap()]).unwrap();
        set.record("image", &[Resource::storage_image(vk::ImageView::from_raw(0x77))])
            .unwrap();
        set.update().unwrap();
        let contents = device.descriptor_contents(set.raw());
        assert_eq!(contents[&0], vec![tlas.raw().unwrap().as_raw()]);
        assert_eq!(contents[&1], vec![0x77]);
        assert!(!contents.contains_key(&2), "camera was never recorded");

        let pipeline = RayTracingPipeline::new(
            device.clone(),
            &RayTracingPipelineCreateInfo {
                miss: &[&miss],
                hit_groups: &[HitGroup::triangles(&chit)],
                set_layouts: &[set.layout()],
                ..RayTracingPipelineCreateInfo::new(&rgen)
            },
        )
        .unwrap();

        let props = device.ray_tracing_properties();
        let single_record = crate::utils::align_up(
            crate::utils::align_up(
                props.shader_group_handle_size as u64,
                props.shader_group_handle_alignment as u64,
            ),
            props.shader_group_base_alignment as u64,
        );
        assert_eq!(pipeline.regions().raygen.size, single_record);
        assert_eq!(pipeline.regions().hit.size, single_record);

        let cmd = vk::CommandBuffer::from_raw(9);
        pipeline.bind(cmd);
        set.bind(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.layout());
        pipeline.trace_rays(cmd, UVec3::new(64, 64, 1));

        instances[1] = instances[1].with_transform(Affine3A::from_translation(Vec3::Y));
        tlas.update(cmd, &instances).unwrap();
        assert_eq!(tlas.state(), TlasState::Stale);

        assert_eq!(device.descriptor_binds(), 1);
        let traces = device.traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].regions.hit.size, pipeline.regions().hit.size);
        let last = device.accel_builds().last().copied().unwrap();
        assert_eq!(last.mode, vk::BuildAccelerationStructureModeKHR::UPDATE);
        assert_eq!(last.primitive_count, 2);
    }
}
