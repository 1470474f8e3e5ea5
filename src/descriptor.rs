//! Reflection driven descriptor sets.
//!
//! A [`DescriptorSet`] accumulates the set 0 bindings of one or more shaders,
//! creates a matching layout, allocates one set from the device's shared pool,
//! and then accepts resources by the names the shaders gave them.
//!
//! # Example
//!
//! ```no_run
//! # use scoria::{prelude::*, ash::vk};
//! # fn demo<D: Device>(device: D, raygen: &Shader<D>, hit: &Shader<D>, tlas: &Tlas<D>, output: vk::ImageView) -> scoria::Result<()> {
//! let mut set = DescriptorSet::new(device, &[raygen, hit])?;
//! set.record("topLevelAS", &[tlas.descriptor()?])?;
//! set.record("image", &[Resource::storage_image(output)])?;
//! set.update()?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    binding::{BindingDescriptor, BindingTable, ResourceKind},
    buffer::BufferLike,
    device::{DescriptorResources, DescriptorWrite, Device, HasDevice},
    error::{Error, Result},
    pipeline::Shader,
    utils::AsVkHandle,
};

/// A resource to be written into a descriptor binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl Resource {
    /// The whole of `buffer`.
    pub fn buffer(buffer: &impl BufferLike) -> Self {
        Self::Buffer {
            buffer: buffer.vk_handle(),
            offset: buffer.offset(),
            range: buffer.size(),
        }
    }

    /// An image view in `GENERAL` layout.
    pub fn storage_image(view: vk::ImageView) -> Self {
        Self::Image {
            view,
            sampler: vk::Sampler::null(),
            layout: vk::ImageLayout::GENERAL,
        }
    }

    /// An image view sampled in `SHADER_READ_ONLY_OPTIMAL` layout.
    pub fn sampled_image(view: vk::ImageView, sampler: vk::Sampler) -> Self {
        Self::Image {
            view,
            sampler,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Buffer { .. } => "buffer",
            Self::Image { .. } => "image",
            Self::AccelerationStructure(_) => "acceleration structure",
        }
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Buffers(SmallVec<[vk::DescriptorBufferInfo; 1]>),
    Images(SmallVec<[vk::DescriptorImageInfo; 1]>),
    AccelerationStructures(SmallVec<[vk::AccelerationStructureKHR; 1]>),
}

impl PendingWrite {
    fn collect(name: &str, desc: &BindingDescriptor, resources: &[Resource]) -> Result<Self> {
        let mismatch = |resource: &Resource| Error::ResourceKindMismatch {
            name: name.to_owned(),
            expected: desc.kind,
            supplied: resource.kind_name(),
        };
        match desc.kind {
            ResourceKind::UniformBuffer | ResourceKind::StorageBuffer => resources
                .iter()
                .map(|resource| match *resource {
                    Resource::Buffer {
                        buffer,
                        offset,
                        range,
                    } => Ok(vk::DescriptorBufferInfo {
                        buffer,
                        offset,
                        range,
                    }),
                    _ => Err(mismatch(resource)),
                })
                .collect::<Result<_>>()
                .map(Self::Buffers),
            ResourceKind::StorageImage | ResourceKind::SampledImage => resources
                .iter()
                .map(|resource| match *resource {
                    Resource::Image {
                        view,
                        sampler,
                        layout,
                    } => Ok(vk::DescriptorImageInfo {
                        sampler,
                        image_view: view,
                        image_layout: layout,
                    }),
                    _ => Err(mismatch(resource)),
                })
                .collect::<Result<_>>()
                .map(Self::Images),
            ResourceKind::AccelerationStructure => resources
                .iter()
                .map(|resource| match *resource {
                    Resource::AccelerationStructure(accel) => Ok(accel),
                    _ => Err(mismatch(resource)),
                })
                .collect::<Result<_>>()
                .map(Self::AccelerationStructures),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Buffers(infos) => infos.len(),
            Self::Images(infos) => infos.len(),
            Self::AccelerationStructures(accels) => accels.len(),
        }
    }

    fn resources(&self) -> DescriptorResources<'_> {
        match self {
            Self::Buffers(infos) => DescriptorResources::Buffers(infos),
            Self::Images(infos) => DescriptorResources::Images(infos),
            Self::AccelerationStructures(accels) => {
                DescriptorResources::AccelerationStructures(accels)
            }
        }
    }
}

/// Descriptor set 0 of a group of shaders, addressed by binding name.
///
/// Lifecycle: accumulate bindings with [`add_resources`](Self::add_resources),
/// [`allocate`](Self::allocate) once, then [`record`](Self::record) resources and
/// [`update`](Self::update) as often as needed. The layout is frozen after allocation.
///
/// Runtime sized arrays (`buffer Vertices { .. } vertexBuffers[];`) take their
/// descriptor count from whatever was recorded for them before
/// [`allocate`](Self::allocate), so record those first when building with
/// [`empty`](Self::empty).
pub struct DescriptorSet<D: Device> {
    device: D,
    table: BindingTable,
    layout: vk::DescriptorSetLayout,
    raw: vk::DescriptorSet,
    /// Keyed by binding slot.
    writes: BTreeMap<u32, (vk::DescriptorType, PendingWrite)>,
}

impl<D: Device> DescriptorSet<D> {
    /// An empty, unallocated descriptor set.
    pub fn empty(device: D) -> Self {
        Self {
            device,
            table: BindingTable::new(),
            layout: vk::DescriptorSetLayout::null(),
            raw: vk::DescriptorSet::null(),
            writes: BTreeMap::new(),
        }
    }

    /// Reflects every shader and allocates the resulting set.
    pub fn new(device: D, shaders: &[&Shader<D>]) -> Result<Self> {
        let mut set = Self::empty(device);
        for shader in shaders {
            set.add_resources(shader)?;
        }
        set.allocate()?;
        Ok(set)
    }

    pub fn add_resources(&mut self, shader: &Shader<D>) -> Result<()> {
        self.add_binding_map(shader.code(), shader.stage())
    }

    pub fn add_binding_map(&mut self, code: &[u32], stage: vk::ShaderStageFlags) -> Result<()> {
        if self.is_allocated() {
            return Err(Error::LayoutFrozen);
        }
        self.table.add_binding_map(code, stage)
    }

    /// Creates the layout from the accumulated bindings and allocates the set.
    pub fn allocate(&mut self) -> Result<()> {
        if self.is_allocated() {
            return Err(Error::LayoutFrozen);
        }
        let writes = &self.writes;
        self.table
            .size_runtime_arrays(|slot| writes.get(&slot).map(|(_, write)| write.len() as u32));
        let bindings = self.table.bindings();
        let layout = self.device.create_descriptor_set_layout(&bindings)?;
        let raw = match self.device.allocate_descriptor_set(layout) {
            Ok(raw) => raw,
            Err(err) => {
                self.device.destroy_descriptor_set_layout(layout);
                return Err(Error::from_pool(1, err));
            }
        };
        tracing::debug!(bindings = bindings.len(), "Allocated descriptor set");
        self.layout = layout;
        self.raw = raw;
        Ok(())
    }

    /// Records `resources` for the binding called `name`, replacing anything
    /// recorded for it before. Nothing reaches the device until [`update`](Self::update).
    ///
    /// A name no shader declares is dropped with a warning since the resource is
    /// simply unused by this set.
    pub fn record(&mut self, name: &str, resources: &[Resource]) -> Result<()> {
        match self.try_record(name, resources) {
            Err(Error::UnknownBinding { name }) => {
                tracing::warn!(%name, "Ignoring resource for unknown binding");
                Ok(())
            }
            other => other,
        }
    }

    /// Like [`record`](Self::record), but an unknown name is an error.
    pub fn try_record(&mut self, name: &str, resources: &[Resource]) -> Result<()> {
        let allocated = self.is_allocated();
        let Some(desc) = self.table.get(name) else {
            return Err(Error::UnknownBinding {
                name: name.to_owned(),
            });
        };
        let unbounded = desc.runtime_sized && !allocated;
        if !unbounded && resources.len() > desc.count as usize {
            return Err(Error::TooManyResources {
                name: name.to_owned(),
                capacity: desc.count,
                supplied: resources.len(),
            });
        }
        if resources.is_empty() {
            self.writes.remove(&desc.binding);
            return Ok(());
        }
        let write = PendingWrite::collect(name, desc, resources)?;
        self.writes
            .insert(desc.binding, (desc.descriptor_type(), write));
        Ok(())
    }

    /// Flushes every recorded write to the device.
    pub fn update(&self) -> Result<()> {
        if !self.is_allocated() {
            return Err(Error::NotAllocated);
        }
        let writes: Vec<DescriptorWrite<'_>> = self
            .writes
            .iter()
            .map(|(&binding, (ty, write))| DescriptorWrite {
                binding,
                ty: *ty,
                resources: write.resources(),
            })
            .collect();
        self.device.update_descriptor_set(self.raw, &writes);
        Ok(())
    }

    /// Binds the set at index 0. Does nothing when no resources were recorded.
    pub fn bind(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
    ) {
        if self.writes.is_empty() || !self.is_allocated() {
            return;
        }
        self.device
            .cmd_bind_descriptor_set(cmd, bind_point, layout, self.raw);
    }

    pub fn is_allocated(&self) -> bool {
        self.raw != vk::DescriptorSet::null()
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }

    pub fn table(&self) -> &BindingTable {
        &self.table
    }

    pub fn binding(&self, name: &str) -> Option<&BindingDescriptor> {
        self.table.get(name)
    }
}

impl<D: Device> AsVkHandle for DescriptorSet<D> {
    type Handle = vk::DescriptorSet;
    fn vk_handle(&self) -> Self::Handle {
        self.raw
    }
}

impl<D: Device> HasDevice for DescriptorSet<D> {
    type Device = D;
    fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> Drop for DescriptorSet<D> {
    fn drop(&mut self) {
        if self.raw != vk::DescriptorSet::null() {
            self.device.free_descriptor_set(self.raw);
        }
        if self.layout != vk::DescriptorSetLayout::null() {
            self.device.destroy_descriptor_set_layout(self.layout);
        }
    }
}
