use std::collections::HashMap;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Affine3A;

use super::{AccelStruct, Blas, create_scratch_buffer};
use crate::{
    buffer::{BufferExt, BufferLike},
    descriptor::Resource,
    device::{AccelBuildInfo, AccelGeometry, BufferInfo, Device, HasDevice, MemoryLocation},
    error::{Error, Result},
    utils::{AsVkHandle, glam_to_vk_transform},
};

/// One placement of a BLAS in a TLAS.
///
/// Bit compatible with `VkAccelerationStructureInstanceKHR`, so a slice of these
/// is uploaded as is.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 object to world transform.
    pub transform: [f32; 12],
    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,
    /// Hit group offset in the low 24 bits, instance flags in the high 8.
    pub sbt_offset_and_flags: u32,
    /// Device address of the referenced BLAS.
    pub blas_address: vk::DeviceAddress,
}

const _: () = assert!(
    std::mem::size_of::<InstanceRecord>()
        == std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
);

fn pack_24_8(low_24: u32, high_8: u8) -> u32 {
    (low_24 & 0x00ff_ffff) | (u32::from(high_8) << 24)
}

fn low_24(packed: u32) -> u32 {
    packed & 0x00ff_ffff
}

fn high_8(packed: u32) -> u8 {
    (packed >> 24) as u8
}

impl InstanceRecord {
    /// Visible to every ray, culling disabled, hit group 0.
    pub fn new<D: Device>(blas: &Blas<D>, transform: Affine3A) -> Self {
        Self::from_address(blas.device_address(), transform)
    }

    pub fn from_address(blas_address: vk::DeviceAddress, transform: Affine3A) -> Self {
        Self {
            transform: glam_to_vk_transform(transform).matrix,
            custom_index_and_mask: pack_24_8(0, 0xff),
            sbt_offset_and_flags: pack_24_8(
                0,
                vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
            ),
            blas_address,
        }
    }

    pub fn with_custom_index(mut self, index: u32) -> Self {
        self.custom_index_and_mask = pack_24_8(index, self.mask());
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.custom_index_and_mask = pack_24_8(self.custom_index(), mask);
        self
    }

    /// Index of the hit group, relative to the start of the hit region.
    pub fn with_sbt_offset(mut self, offset: u32) -> Self {
        self.sbt_offset_and_flags = pack_24_8(offset, high_8(self.sbt_offset_and_flags));
        self
    }

    pub fn with_flags(mut self, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.sbt_offset_and_flags = pack_24_8(self.sbt_offset(), flags.as_raw() as u8);
        self
    }

    pub fn with_transform(mut self, transform: Affine3A) -> Self {
        self.transform = glam_to_vk_transform(transform).matrix;
        self
    }

    pub fn custom_index(&self) -> u32 {
        low_24(self.custom_index_and_mask)
    }

    pub fn mask(&self) -> u8 {
        high_8(self.custom_index_and_mask)
    }

    pub fn sbt_offset(&self) -> u32 {
        low_24(self.sbt_offset_and_flags)
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(u32::from(high_8(self.sbt_offset_and_flags)))
    }
}

impl From<InstanceRecord> for vk::AccelerationStructureInstanceKHR {
    fn from(record: InstanceRecord) -> Self {
        vk::AccelerationStructureInstanceKHR {
            transform: vk::TransformMatrixKHR {
                matrix: record.transform,
            },
            instance_custom_index_and_mask: vk::Packed24_8::new(
                record.custom_index(),
                record.mask(),
            ),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                record.sbt_offset(),
                high_8(record.sbt_offset_and_flags),
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: record.blas_address,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TlasCreateInfo<'a> {
    /// Applied to the instance geometry. Defaults to `OPAQUE`.
    pub geometry_flags: vk::GeometryFlagsKHR,
    /// Defaults to `PREFER_FAST_TRACE | ALLOW_UPDATE`. Without `ALLOW_UPDATE`
    /// only full builds are possible.
    pub build_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Debug name, used in logs.
    pub name: &'a str,
}

impl Default for TlasCreateInfo<'_> {
    fn default() -> Self {
        Self {
            geometry_flags: vk::GeometryFlagsKHR::OPAQUE,
            build_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            name: "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasState {
    /// Nothing has been built yet.
    Uninitialized,
    /// The structure reflects the last supplied instances.
    Built,
    /// An update was recorded into a caller command buffer and has not been
    /// observed to complete. The caller orders it before any trace.
    Stale,
}

/// Storage that is only reallocated when the instance count outgrows it.
struct TlasStorage<D: Device> {
    accel: AccelStruct<D>,
    instance_buffer: D::Buffer,
    scratch: D::Buffer,
    /// Instances the allocations were sized for.
    capacity: u32,
}

/// Top-level acceleration structure.
///
/// [`build`](Self::build) performs a full, blocking build and is required whenever
/// the instance count changes. [`update`](Self::update) refits the existing
/// structure in place for new transforms with the same instance count.
pub struct Tlas<D: Device> {
    device: D,
    info: TlasCreateInfo<'static>,
    storage: Option<TlasStorage<D>>,
    instances: Vec<InstanceRecord>,
    geometry: AccelGeometry,
    state: TlasState,
}

impl<D: Device> Tlas<D> {
    pub fn new(device: D, info: TlasCreateInfo<'static>) -> Self {
        Self {
            device,
            info,
            storage: None,
            instances: Vec::new(),
            geometry: AccelGeometry::Instances { data: 0 },
            state: TlasState::Uninitialized,
        }
    }

    /// Fully (re)builds over `instances` and waits for completion.
    ///
    /// If new storage cannot be allocated the previous build stays in place.
    /// If the build itself fails the TLAS is left [`TlasState::Uninitialized`].
    pub fn build(&mut self, instances: &[InstanceRecord]) -> Result<()> {
        const LEVEL: vk::AccelerationStructureTypeKHR = vk::AccelerationStructureTypeKHR::TOP_LEVEL;
        let count = instances.len() as u32;
        let needs_storage = self
            .storage
            .as_ref()
            .is_none_or(|storage| storage.capacity < count);
        if needs_storage {
            let storage = self.allocate_storage(count)?;
            self.storage = Some(storage);
        }
        let Some(storage) = self.storage.as_mut() else {
            return Err(Error::NotBuilt);
        };
        storage
            .instance_buffer
            .update_contents(bytemuck::cast_slice(instances))?;
        self.geometry = AccelGeometry::Instances {
            data: storage.instance_buffer.device_address(),
        };
        let build_info = AccelBuildInfo {
            level: LEVEL,
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            flags: self.info.build_flags,
            geometry_flags: self.info.geometry_flags,
            geometry: &self.geometry,
            primitive_count: count,
            src: vk::AccelerationStructureKHR::null(),
            dst: storage.accel.vk_handle(),
            scratch: storage.scratch.device_address(),
        };

        tracing::info!(name = self.info.name, instances = count, "Building TLAS");
        let device = &self.device;
        let result = device.submit_and_wait(&mut |cmd| {
            device.cmd_build_acceleration_structure(cmd, &build_info)
        });
        if let Err(source) = result {
            self.instances.clear();
            self.state = TlasState::Uninitialized;
            return Err(Error::AccelBuildFailed {
                level: LEVEL,
                source,
            });
        }
        self.instances = instances.to_vec();
        self.state = TlasState::Built;
        Ok(())
    }

    fn allocate_storage(&self, count: u32) -> Result<TlasStorage<D>> {
        const LEVEL: vk::AccelerationStructureTypeKHR = vk::AccelerationStructureTypeKHR::TOP_LEVEL;
        let instance_bytes =
            (count.max(1) as vk::DeviceSize) * size_of::<InstanceRecord>() as vk::DeviceSize;
        let instance_buffer = self
            .device
            .create_buffer(&BufferInfo {
                size: instance_bytes,
                alignment: 16,
                usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location: MemoryLocation::Upload,
                name: "TLAS instances",
            })
            .map_err(|err| Error::from_alloc(instance_bytes, err))?;
        let geometry = AccelGeometry::Instances {
            data: instance_buffer.device_address(),
        };
        let sizes = self
            .device
            .acceleration_structure_build_sizes(&AccelBuildInfo {
                level: LEVEL,
                mode: vk::BuildAccelerationStructureModeKHR::BUILD,
                flags: self.info.build_flags,
                geometry_flags: self.info.geometry_flags,
                geometry: &geometry,
                primitive_count: count,
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
        let accel = AccelStruct::new(self.device.clone(), sizes.acceleration_structure_size, LEVEL)?;
        let scratch = create_scratch_buffer(
            &self.device,
            sizes.build_scratch_size.max(sizes.update_scratch_size),
        )?;
        tracing::debug!(
            instances = count,
            size = sizes.acceleration_structure_size,
            "Allocated TLAS storage"
        );
        Ok(TlasStorage {
            accel,
            instance_buffer,
            scratch,
            capacity: count,
        })
    }

    /// Records an in-place update with new instance data into `cmd`, followed by a barrier.
    ///
    /// The instance count must equal that of the last build.
    pub fn update(&mut self, cmd: vk::CommandBuffer, instances: &[InstanceRecord]) -> Result<()> {
        self.upload_update(instances)?;
        let build_info = self.update_info()?;
        self.device.cmd_build_acceleration_structure(cmd, &build_info);
        self.device.cmd_acceleration_structure_barrier(cmd);
        self.instances.copy_from_slice(instances);
        self.state = TlasState::Stale;
        tracing::debug!(instances = instances.len(), "Recorded TLAS update");
        Ok(())
    }

    /// Updates in place like [`update`](Self::update), but submits and waits.
    pub fn update_now(&mut self, instances: &[InstanceRecord]) -> Result<()> {
        self.upload_update(instances)?;
        let build_info = self.update_info()?;
        let device = &self.device;
        device
            .submit_and_wait(&mut |cmd| device.cmd_build_acceleration_structure(cmd, &build_info))
            .map_err(|source| Error::AccelBuildFailed {
                level: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                source,
            })?;
        self.instances.copy_from_slice(instances);
        self.state = TlasState::Built;
        tracing::debug!(instances = instances.len(), "Updated TLAS");
        Ok(())
    }

    /// Validates an update and uploads the new instances.
    fn upload_update(&mut self, instances: &[InstanceRecord]) -> Result<()> {
        if self.state == TlasState::Uninitialized {
            return Err(Error::NotBuilt);
        }
        if !self
            .info
            .build_flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
        {
            return Err(Error::UpdateNotAllowed);
        }
        if instances.len() != self.instances.len() {
            return Err(Error::InstanceCountMismatch {
                built: self.instances.len() as u32,
                supplied: instances.len() as u32,
            });
        }
        let Some(storage) = self.storage.as_mut() else {
            return Err(Error::NotBuilt);
        };
        storage
            .instance_buffer
            .update_contents(bytemuck::cast_slice(instances))?;
        Ok(())
    }

    fn update_info(&self) -> Result<AccelBuildInfo<'_>> {
        let storage = self.storage.as_ref().ok_or(Error::NotBuilt)?;
        let accel = storage.accel.vk_handle();
        Ok(AccelBuildInfo {
            level: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            mode: vk::BuildAccelerationStructureModeKHR::UPDATE,
            flags: self.info.build_flags,
            geometry_flags: self.info.geometry_flags,
            geometry: &self.geometry,
            primitive_count: self.instances.len() as u32,
            src: accel,
            dst: accel,
            scratch: storage.scratch.device_address(),
        })
    }

    /// Descriptor resource for binding this TLAS to a shader.
    pub fn descriptor(&self) -> Result<Resource> {
        self.raw()
            .map(Resource::AccelerationStructure)
            .ok_or(Error::NotBuilt)
    }

    pub fn raw(&self) -> Option<vk::AccelerationStructureKHR> {
        self.built_storage().map(|storage| storage.accel.vk_handle())
    }

    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.built_storage()
            .map(|storage| storage.accel.device_address())
    }

    fn built_storage(&self) -> Option<&TlasStorage<D>> {
        self.storage
            .as_ref()
            .filter(|_| self.state != TlasState::Uninitialized)
    }

    pub fn state(&self) -> TlasState {
        self.state
    }

    pub fn instances(&self) -> &[InstanceRecord] {
        &self.instances
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    pub fn instance_buffer(&self) -> Option<&D::Buffer> {
        self.storage.as_ref().map(|storage| &storage.instance_buffer)
    }
}

impl<D: Device> HasDevice for Tlas<D> {
    type Device = D;
    fn device(&self) -> &D {
        &self.device
    }
}

/// Caches the index of each mesh's BLAS by mesh name.
///
/// The lookup is only rebuilt when the set of meshes changes, not on every frame.
///
/// # Example
///
/// ```no_run
/// # use scoria::{prelude::*, rtx::InstanceMap};
/// # use glam::Affine3A;
/// # fn frame<D: Device>(
/// #     tlas: &mut Tlas<D>,
/// #     map: &mut InstanceMap,
/// #     cmd: vk::CommandBuffer,
/// #     meshes: &[String],
/// #     blases: &[Blas<D>],
/// #     objects: &[(String, Affine3A)],
/// # ) -> scoria::Result<()> {
/// // `blases[i]` was built from `meshes[i]`.
/// map.sync(meshes);
/// let instances: Vec<InstanceRecord> = objects
///     .iter()
///     .filter_map(|(mesh, transform)| {
///         let index = map.resolve(mesh)?;
///         Some(InstanceRecord::new(&blases[index], *transform).with_custom_index(index as u32))
///     })
///     .collect();
/// if instances.len() as u32 == tlas.instance_count() {
///     tlas.update(cmd, &instances)?;
/// } else {
///     tlas.build(&instances)?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InstanceMap {
    meshes: Vec<String>,
    lookup: HashMap<String, usize>,
    rebuilds: usize,
}

impl InstanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the lookup reflect `meshes`, where a mesh's index is its BLAS index.
    /// Returns whether the mesh set changed.
    pub fn sync<S: AsRef<str>>(&mut self, meshes: &[S]) -> bool {
        let unchanged = self.meshes.len() == meshes.len()
            && self
                .meshes
                .iter()
                .zip(meshes)
                .all(|(cached, mesh)| cached == mesh.as_ref());
        if unchanged {
            return false;
        }
        self.meshes = meshes.iter().map(|mesh| mesh.as_ref().to_owned()).collect();
        self.lookup = self
            .meshes
            .iter()
            .enumerate()
            .map(|(index, mesh)| (mesh.clone(), index))
            .collect();
        self.rebuilds += 1;
        true
    }

    pub fn resolve(&self, mesh: &str) -> Option<usize> {
        self.lookup.get(mesh).copied()
    }

    /// How many times the lookup has been rebuilt.
    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }
}
