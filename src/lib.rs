//! # Scoria
//!
//! Vulkan ray tracing plumbing: shader reflection, descriptor sets,
//! acceleration structures and shader binding tables.
//!
//! ## Quick Start
//!
//! ```no_run
//! use scoria::prelude::*;
//! # fn demo(device: VulkanDevice, rgen: &[u8], rmiss: &[u8], rchit: &[u8], blas_info: BlasCreateInfo<'_>, output: vk::ImageView, cmd: vk::CommandBuffer) -> scoria::Result<()> {
//! use glam::{Affine3A, UVec3};
//!
//! let raygen = Shader::from_bytes(device.clone(), rgen, vk::ShaderStageFlags::RAYGEN_KHR)?;
//! let miss = Shader::from_bytes(device.clone(), rmiss, vk::ShaderStageFlags::MISS_KHR)?;
//! let hit = Shader::from_bytes(device.clone(), rchit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
//!
//! // Geometry
//! let blas = Blas::new(device.clone(), &blas_info)?;
//! let mut tlas = Tlas::new(device.clone(), TlasCreateInfo::default());
//! tlas.build(&[InstanceRecord::new(&blas, Affine3A::IDENTITY)])?;
//!
//! // Resources, bound by the names the shaders declare
//! let mut set = DescriptorSet::new(device.clone(), &[&raygen, &miss, &hit])?;
//! set.record("topLevelAS", &[tlas.descriptor()?])?;
//! set.record("image", &[Resource::storage_image(output)])?;
//! set.update()?;
//!
//! // Pipeline and shader binding table
//! let pipeline = RayTracingPipeline::new(device, &RayTracingPipelineCreateInfo {
//!     miss: &[&miss],
//!     hit_groups: &[HitGroup::triangles(&hit)],
//!     set_layouts: &[set.layout()],
//!     ..RayTracingPipelineCreateInfo::new(&raygen)
//! })?;
//!
//! pipeline.bind(cmd);
//! set.bind(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.layout());
//! pipeline.trace_rays(cmd, UVec3::new(1920, 1080, 1));
//! # Ok(())
//! # }
//! ```
//!
//! ## Overview
//!
//! Every object is generic over a [`Device`]. [`VulkanDevice`] is the real one;
//! the trait exists so that the bookkeeping in this crate can be exercised
//! without a GPU.
//!
//! - [`BindingTable`] reflects SPIR-V modules into named set 0 bindings.
//! - [`DescriptorSet`] creates a layout from a binding table and writes
//!   resources into it by name.
//! - [`rtx::Blas`] and [`rtx::Tlas`] build acceleration structures. A TLAS can
//!   be rebuilt with new instances or updated in place when only transforms change.
//! - [`rtx::RayTracingPipeline`] creates the pipeline and lays out its
//!   [`rtx::ShaderBindingTable`].
//!
//! ## Requirements
//!
//! - Vulkan 1.3, or 1.2 with `VK_KHR_synchronization2`
//! - `VK_KHR_acceleration_structure`, `VK_KHR_ray_tracing_pipeline` and
//!   `VK_KHR_deferred_host_operations`
//! - Buffer device addresses
//! - `runtimeDescriptorArray` for shaders declaring runtime sized descriptor arrays

mod alloc;
pub mod binding;
pub mod buffer;
pub mod descriptor;
pub mod device;
mod error;
pub mod pipeline;
pub mod reflect;
pub mod rtx;
pub mod spirv;
pub mod utils;
mod vulkan;

#[cfg(test)]
pub(crate) mod testing;

pub use alloc::Allocator;
pub use binding::{BindingDescriptor, BindingTable, ResourceKind};
pub use buffer::Buffer;
pub use descriptor::{DescriptorSet, Resource};
pub use device::{Device, HasDevice};
pub use error::{Error, Result, SpirvError};
pub use pipeline::{PipelineLayout, Shader};
pub use vulkan::{VulkanDevice, VulkanDeviceConfig};

pub use ash;

pub mod prelude {
    pub use crate::{
        Allocator, BindingTable, DescriptorSet, Device, HasDevice, Resource, ResourceKind,
        Shader, VulkanDevice, ash,
        ash::vk,
        buffer::{Buffer, BufferExt, BufferLike},
        rtx::{
            Blas, BlasCreateInfo, HitGroup, InstanceRecord, RayTracingPipeline,
            RayTracingPipelineCreateInfo, ShaderBindingTable, Tlas, TlasCreateInfo,
        },
        utils::AsVkHandle,
    };
}
