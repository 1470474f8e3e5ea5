use ash::vk;

use super::{AccelStruct, create_scratch_buffer};
use crate::{
    buffer::BufferLike,
    device::{AccelBuildInfo, AccelGeometry, Device, HasDevice},
    error::{Error, Result},
    utils::AsVkHandle,
};

/// Describes the triangle mesh a [`Blas`] is built over.
///
/// Vertex and index data are read through their device addresses and must stay
/// alive until the build completes.
#[derive(Debug, Clone, Copy)]
pub struct BlasCreateInfo<'a> {
    /// Device address of the first vertex position.
    pub vertex_data: vk::DeviceAddress,
    /// Bytes between consecutive vertex positions. Defaults to a tightly packed `vec3`.
    pub vertex_stride: vk::DeviceSize,
    pub vertex_count: u32,
    /// Format of the position attribute. Defaults to `R32G32B32_SFLOAT`.
    pub vertex_format: vk::Format,
    /// Device address of the index buffer, three indices per triangle.
    pub index_data: vk::DeviceAddress,
    pub index_type: vk::IndexType,
    pub triangle_count: u32,
    /// Defaults to `OPAQUE`, which skips any-hit shaders.
    pub geometry_flags: vk::GeometryFlagsKHR,
    /// Defaults to `PREFER_FAST_TRACE | ALLOW_UPDATE`.
    pub build_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Debug name, used in logs.
    pub name: &'a str,
}

impl Default for BlasCreateInfo<'_> {
    fn default() -> Self {
        Self {
            vertex_data: 0,
            vertex_stride: 12,
            vertex_count: 0,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            index_data: 0,
            index_type: vk::IndexType::UINT32,
            triangle_count: 0,
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            build_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            name: "",
        }
    }
}

/// Bottom-level acceleration structure over a single indexed triangle mesh.
///
/// [`Blas::new`] builds it synchronously; the structure is usable as soon as it returns.
pub struct Blas<D: Device> {
    accel: AccelStruct<D>,
    scratch: D::Buffer,
    geometry: AccelGeometry,
    geometry_flags: vk::GeometryFlagsKHR,
    build_flags: vk::BuildAccelerationStructureFlagsKHR,
    triangle_count: u32,
}

impl<D: Device> Blas<D> {
    pub fn new(device: D, info: &BlasCreateInfo<'_>) -> Result<Self> {
        const LEVEL: vk::AccelerationStructureTypeKHR =
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL;
        let geometry = AccelGeometry::Triangles {
            vertex_format: info.vertex_format,
            vertex_data: info.vertex_data,
            vertex_stride: info.vertex_stride,
            max_vertex: info.vertex_count.saturating_sub(1),
            index_type: info.index_type,
            index_data: info.index_data,
        };
        let sizes = device.acceleration_structure_build_sizes(&AccelBuildInfo {
            level: LEVEL,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            flags: info.build_flags,
            geometry_flags: info.geometry_flags,
            geometry: &geometry,
            primitive_count: info.triangle_count,
            src: vk::AccelerationStructureKHR::null(),
            dst: vk::AccelerationStructureKHR::null(),
            scratch: 0,
        });
        if sizes.acceleration_structure_size == 0 {
            return Err(Error::AccelBuildFailed {
                level: LEVEL,
                source: vk::Result::ERROR_UNKNOWN,
            });
        }

        let accel = AccelStruct::new(device.clone(), sizes.acceleration_structure_size, LEVEL)?;
        let scratch = create_scratch_buffer(&device, sizes.build_scratch_size)?;
        let blas = Self {
            accel,
            scratch,
            geometry,
            geometry_flags: info.geometry_flags,
            build_flags: info.build_flags,
            triangle_count: info.triangle_count,
        };

        tracing::info!(
            name = info.name,
            triangles = info.triangle_count,
            size = sizes.acceleration_structure_size,
            "Building BLAS"
        );
        device
            .submit_and_wait(&mut |cmd| blas.record_build(cmd))
            .map_err(|source| Error::AccelBuildFailed {
                level: LEVEL,
                source,
            })?;
        Ok(blas)
    }

    /// Records a rebuild from the same geometry into `cmd`, followed by a barrier.
    ///
    /// Useful after the vertex data has been rewritten in place.
    pub fn build_into(&self, cmd: vk::CommandBuffer) {
        self.record_build(cmd);
        self.accel.device().cmd_acceleration_structure_barrier(cmd);
    }

    fn record_build(&self, cmd: vk::CommandBuffer) {
        self.accel.device().cmd_build_acceleration_structure(
            cmd,
            &AccelBuildInfo {
                level: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                flags: self.build_flags,
                geometry_flags: self.geometry_flags,
                geometry: &self.geometry,
                primitive_count: self.triangle_count,
                src: vk::AccelerationStructureKHR::null(),
                dst: self.accel.vk_handle(),
                scratch: self.scratch.device_address(),
            },
        );
    }

    /// The address [`InstanceRecord`](super::InstanceRecord)s reference this BLAS by.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.accel.device_address()
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.build_flags
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.accel.size()
    }

    pub fn accel(&self) -> &AccelStruct<D> {
        &self.accel
    }
}

impl<D: Device> AsVkHandle for Blas<D> {
    type Handle = vk::AccelerationStructureKHR;
    fn vk_handle(&self) -> Self::Handle {
        self.accel.vk_handle()
    }
}

impl<D: Device> HasDevice for Blas<D> {
    type Device = D;
    fn device(&self) -> &D {
        self.accel.device()
    }
}
