//! The production [`Device`] backed by `ash` and `vk-mem`.
//!
//! [`VulkanDevice`] wraps a logical device the application created itself, with
//! [`VulkanDevice::REQUIRED_EXTENSIONS`] enabled along with the
//! `bufferDeviceAddress`, `synchronization2`, `accelerationStructure` and
//! `rayTracingPipeline` features. The application keeps ownership of the
//! `VkInstance` and `VkDevice` and destroys them after every object created
//! through this crate has been dropped.
//!
//! ```no_run
//! # use scoria::{VulkanDevice, VulkanDeviceConfig};
//! # fn open(instance: ash::Instance, device: ash::Device, pdevice: ash::vk::PhysicalDevice) -> ash::prelude::VkResult<()> {
//! let device = VulkanDevice::new(instance, device, pdevice, 0, &VulkanDeviceConfig::default())?;
//! println!("{:?}", device.properties());
//! # Ok(())
//! # }
//! ```

use std::{
    ffi::CStr,
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
};

use ash::{prelude::VkResult, vk};
use glam::UVec3;
use smallvec::SmallVec;

use crate::{
    Allocator, Buffer,
    buffer::BufferLike,
    device::{
        AccelBuildInfo, AccelGeometry, BufferInfo, DescriptorResources, DescriptorWrite, Device,
        RayTracingPipelineDesc, RayTracingProperties, SbtRegions,
    },
    utils::AsVkHandle,
};

/// Sizes of the descriptor pool shared by every [`DescriptorSet`](crate::DescriptorSet).
#[derive(Debug, Clone)]
pub struct VulkanDeviceConfig {
    pub descriptor_pool_sizes: Vec<vk::DescriptorPoolSize>,
    pub max_descriptor_sets: u32,
}

impl Default for VulkanDeviceConfig {
    fn default() -> Self {
        let size = |ty, descriptor_count| vk::DescriptorPoolSize {
            ty,
            descriptor_count,
        };
        Self {
            descriptor_pool_sizes: vec![
                size(vk::DescriptorType::UNIFORM_BUFFER, 256),
                size(vk::DescriptorType::STORAGE_BUFFER, 256),
                size(vk::DescriptorType::STORAGE_IMAGE, 128),
                size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 256),
                size(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 32),
            ],
            max_descriptor_sets: 64,
        }
    }
}

/// A Vulkan logical device with ray tracing enabled.
///
/// Reference-counted; clones share the same pools and allocator.
#[derive(Clone)]
pub struct VulkanDevice(Arc<VulkanDeviceInner>);

struct VulkanDeviceInner {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    accel: ash::khr::acceleration_structure::Device,
    ray_tracing: ash::khr::ray_tracing_pipeline::Device,
    allocator: Allocator,
    properties: RayTracingProperties,
    descriptor_pool: Mutex<vk::DescriptorPool>,
    submitter: Mutex<Submitter>,
}

/// One-shot submission state. Guarded as a whole since queue access must be
/// externally synchronized.
struct Submitter {
    queue: vk::Queue,
    pool: vk::CommandPool,
    fence: vk::Fence,
}

impl Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("VulkanDevice")
            .field(&self.0.device.handle())
            .finish()
    }
}

impl VulkanDevice {
    pub const REQUIRED_EXTENSIONS: [&'static CStr; 3] = [
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::deferred_host_operations::NAME,
    ];

    /// Wraps `device`, using queue 0 of `queue_family_index` for blocking submissions.
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        config: &VulkanDeviceConfig,
    ) -> VkResult<Self> {
        let properties = query_properties(&instance, physical_device);
        let allocator = Allocator::new(&instance, &device, physical_device)?;
        let accel = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let ray_tracing = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);

        unsafe {
            let descriptor_pool = device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                    .max_sets(config.max_descriptor_sets)
                    .pool_sizes(&config.descriptor_pool_sizes),
                None,
            )?;
            let pool = match device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                    .queue_family_index(queue_family_index),
                None,
            ) {
                Ok(pool) => pool,
                Err(err) => {
                    device.destroy_descriptor_pool(descriptor_pool, None);
                    return Err(err);
                }
            };
            let fence = match device.create_fence(&vk::FenceCreateInfo::default(), None) {
                Ok(fence) => fence,
                Err(err) => {
                    device.destroy_command_pool(pool, None);
                    device.destroy_descriptor_pool(descriptor_pool, None);
                    return Err(err);
                }
            };
            let queue = device.get_device_queue(queue_family_index, 0);

            tracing::info!(
                device = ?device.handle(),
                handle_size = properties.shader_group_handle_size,
                max_recursion = properties.max_ray_recursion_depth,
                "Ray tracing device ready"
            );
            Ok(Self(Arc::new(VulkanDeviceInner {
                instance,
                device,
                physical_device,
                queue_family_index,
                accel,
                ray_tracing,
                allocator,
                properties,
                descriptor_pool: Mutex::new(descriptor_pool),
                submitter: Mutex::new(Submitter { queue, pool, fence }),
            })))
        }
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.0.instance
    }

    pub fn device(&self) -> &ash::Device {
        &self.0.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.0.physical_device
    }

    pub fn queue_family_index(&self) -> u32 {
        self.0.queue_family_index
    }

    pub fn allocator(&self) -> &Allocator {
        &self.0.allocator
    }

    pub fn properties(&self) -> &RayTracingProperties {
        &self.0.properties
    }

    unsafe fn record_and_submit(
        &self,
        submitter: &Submitter,
        cmd: vk::CommandBuffer,
        record: &mut dyn FnMut(vk::CommandBuffer),
    ) -> VkResult<()> {
        let device = &self.0.device;
        unsafe {
            device.begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
            record(cmd);
            device.end_command_buffer(cmd)?;
            device.queue_submit2(
                submitter.queue,
                &[vk::SubmitInfo2::default().command_buffer_infos(&[
                    vk::CommandBufferSubmitInfo::default().command_buffer(cmd),
                ])],
                submitter.fence,
            )?;
            device.wait_for_fences(&[submitter.fence], true, u64::MAX)?;
            device.reset_fences(&[submitter.fence])
        }
    }
}

fn query_properties(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> RayTracingProperties {
    let mut ray_tracing = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    {
        let mut properties = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut ray_tracing)
            .push_next(&mut accel);
        unsafe { instance.get_physical_device_properties2(pdevice, &mut properties) };
    }
    RayTracingProperties {
        shader_group_handle_size: ray_tracing.shader_group_handle_size,
        shader_group_handle_alignment: ray_tracing.shader_group_handle_alignment,
        shader_group_base_alignment: ray_tracing.shader_group_base_alignment,
        max_ray_recursion_depth: ray_tracing.max_ray_recursion_depth,
        min_scratch_offset_alignment: accel.min_acceleration_structure_scratch_offset_alignment,
    }
}

fn vk_geometry(info: &AccelBuildInfo<'_>) -> vk::AccelerationStructureGeometryKHR<'static> {
    let (ty, data) = match *info.geometry {
        AccelGeometry::Triangles {
            vertex_format,
            vertex_data,
            vertex_stride,
            max_vertex,
            index_type,
            index_data,
        } => (
            vk::GeometryTypeKHR::TRIANGLES,
            vk::AccelerationStructureGeometryDataKHR {
                triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_data,
                    })
                    .vertex_stride(vertex_stride)
                    .max_vertex(max_vertex)
                    .index_type(index_type)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: index_data,
                    }),
            },
        ),
        AccelGeometry::Instances { data } => (
            vk::GeometryTypeKHR::INSTANCES,
            vk::AccelerationStructureGeometryDataKHR {
                instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: data,
                    }),
            },
        ),
    };
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(ty)
        .geometry(data)
        .flags(info.geometry_flags)
}

fn vk_build_info<'a>(
    info: &AccelBuildInfo<'_>,
    geometry: &'a vk::AccelerationStructureGeometryKHR<'a>,
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(info.level)
        .flags(info.flags)
        .mode(info.mode)
        .src_acceleration_structure(info.src)
        .dst_acceleration_structure(info.dst)
        .geometries(std::slice::from_ref(geometry))
        .scratch_data(vk::DeviceOrHostAddressKHR {
            device_address: info.scratch,
        })
}

impl Device for VulkanDevice {
    type Buffer = Buffer;

    fn ray_tracing_properties(&self) -> &RayTracingProperties {
        &self.0.properties
    }

    fn create_buffer(&self, info: &BufferInfo<'_>) -> VkResult<Buffer> {
        Buffer::new(self.0.allocator.clone(), info)
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        unsafe {
            self.0
                .device
                .create_shader_module(&vk::ShaderModuleCreateInfo::default().code(code), None)
        }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.0.device.destroy_shader_module(module, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> VkResult<vk::DescriptorSetLayout> {
        unsafe {
            self.0.device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings),
                None,
            )
        }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.0.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let pool = self
            .0
            .descriptor_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sets = unsafe {
            self.0.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(*pool)
                    .set_layouts(std::slice::from_ref(&layout)),
            )?
        };
        sets.first()
            .copied()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        let pool = self
            .0
            .descriptor_pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = unsafe { self.0.device.free_descriptor_sets(*pool, &[set]) } {
            tracing::warn!(?set, ?err, "Failed to free descriptor set");
        }
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite<'_>]) {
        let mut accel_infos: SmallVec<[vk::WriteDescriptorSetAccelerationStructureKHR; 2]> =
            writes
                .iter()
                .filter_map(|write| match write.resources {
                    DescriptorResources::AccelerationStructures(accels) => Some(
                        vk::WriteDescriptorSetAccelerationStructureKHR::default()
                            .acceleration_structures(accels),
                    ),
                    _ => None,
                })
                .collect();
        let mut accel_infos = accel_infos.iter_mut();

        let mut vk_writes: SmallVec<[vk::WriteDescriptorSet; 8]> = SmallVec::new();
        for write in writes {
            let vk_write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.binding)
                .dst_array_element(0)
                .descriptor_type(write.ty);
            let vk_write = match write.resources {
                DescriptorResources::Buffers(infos) => vk_write.buffer_info(infos),
                DescriptorResources::Images(infos) => vk_write.image_info(infos),
                DescriptorResources::AccelerationStructures(accels) => {
                    let Some(info) = accel_infos.next() else {
                        continue;
                    };
                    vk_write
                        .descriptor_count(accels.len() as u32)
                        .push_next(info)
                }
            };
            vk_writes.push(vk_write);
        }
        unsafe { self.0.device.update_descriptor_sets(&vk_writes, &[]) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        unsafe {
            self.0.device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(set_layouts)
                    .push_constant_ranges(push_constant_ranges),
                None,
            )
        }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.0.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> VkResult<vk::Pipeline> {
        let stages: SmallVec<[vk::PipelineShaderStageCreateInfo; 8]> = desc
            .stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(stage.entry)
            })
            .collect();
        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(desc.groups)
            .max_pipeline_ray_recursion_depth(desc.max_ray_recursion_depth)
            .layout(desc.layout);

        let mut pipeline = vk::Pipeline::null();
        unsafe {
            (self.0.ray_tracing.fp().create_ray_tracing_pipelines_khr)(
                self.0.device.handle(),
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                1,
                &create_info,
                std::ptr::null(),
                &mut pipeline,
            )
            .result()?;
        }
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.0.device.destroy_pipeline(pipeline, None) }
    }

    fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> VkResult<Vec<u8>> {
        let data_size = self.0.properties.shader_group_handle_size as usize * group_count as usize;
        unsafe {
            self.0.ray_tracing.get_ray_tracing_shader_group_handles(
                pipeline,
                first_group,
                group_count,
                data_size,
            )
        }
    }

    fn acceleration_structure_build_sizes(
        &self,
        info: &AccelBuildInfo<'_>,
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let geometry = vk_geometry(info);
        let build_info = vk_build_info(info, &geometry);
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.0.accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[info.primitive_count],
                &mut sizes,
            );
        }
        sizes
    }

    fn create_acceleration_structure(
        &self,
        buffer: &Buffer,
        level: vk::AccelerationStructureTypeKHR,
    ) -> VkResult<vk::AccelerationStructureKHR> {
        unsafe {
            self.0.accel.create_acceleration_structure(
                &vk::AccelerationStructureCreateInfoKHR::default()
                    .ty(level)
                    .buffer(buffer.vk_handle())
                    .offset(buffer.offset())
                    .size(buffer.size()),
                None,
            )
        }
    }

    fn acceleration_structure_device_address(
        &self,
        accel: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        unsafe {
            self.0.accel.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(accel),
            )
        }
    }

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        unsafe { self.0.accel.destroy_acceleration_structure(accel, None) }
    }

    fn submit_and_wait(&self, record: &mut dyn FnMut(vk::CommandBuffer)) -> VkResult<()> {
        let submitter = self
            .0
            .submitter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let device = &self.0.device;
        unsafe {
            let buffers = device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(submitter.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?;
            let &[cmd] = buffers.as_slice() else {
                return Err(vk::Result::ERROR_UNKNOWN);
            };
            let result = self.record_and_submit(&submitter, cmd, record);
            device.free_command_buffers(submitter.pool, &buffers);
            result
        }
    }

    fn cmd_build_acceleration_structure(&self, cmd: vk::CommandBuffer, info: &AccelBuildInfo<'_>) {
        let geometry = vk_geometry(info);
        let build_info = vk_build_info(info, &geometry);
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: info.primitive_count,
            ..Default::default()
        };
        unsafe {
            self.0.accel.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(&build_info),
                &[std::slice::from_ref(&range)],
            );
        }
    }

    fn cmd_acceleration_structure_barrier(&self, cmd: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            )
            .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
        unsafe {
            self.0.device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier)),
            );
        }
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.0.device.cmd_bind_pipeline(cmd, bind_point, pipeline) }
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.0
                .device
                .cmd_bind_descriptor_sets(cmd, bind_point, layout, 0, &[set], &[])
        }
    }

    fn cmd_trace_rays(&self, cmd: vk::CommandBuffer, regions: &SbtRegions, extent: UVec3) {
        unsafe {
            self.0.ray_tracing.cmd_trace_rays(
                cmd,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                extent.x,
                extent.y,
                extent.z,
            );
        }
    }
}

impl Drop for VulkanDeviceInner {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop ray tracing device");
        let submitter = self
            .submitter
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let descriptor_pool = self
            .descriptor_pool
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        // Every object holding a clone of the device is gone, so nothing from
        // these pools is still in use.
        unsafe {
            self.device.destroy_fence(submitter.fence, None);
            self.device.destroy_command_pool(submitter.pool, None);
            self.device.destroy_descriptor_pool(*descriptor_pool, None);
        }
    }
}
