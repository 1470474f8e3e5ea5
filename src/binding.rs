//! Name keyed descriptor bindings merged across shader stages.

use std::collections::HashMap;

use ash::vk;

use crate::{
    error::{Error, Result},
    reflect::{self, ReflectedBinding},
};

/// The descriptor kinds a shader resource can reflect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    UniformBuffer,
    StorageBuffer,
    StorageImage,
    /// Combined image sampler.
    SampledImage,
    AccelerationStructure,
}

impl ResourceKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingDescriptor {
    /// Slot within descriptor set 0.
    pub binding: u32,
    /// What the shaders declared: buffer, image or acceleration structure.
    pub kind: ResourceKind,
    /// Descriptor count. The largest array length any stage declared, or for
    /// runtime sized arrays the number of resources recorded before allocation.
    pub count: u32,
    /// Declared as `name[]` by at least one stage.
    pub runtime_sized: bool,
    /// Union of every stage that declared this binding.
    pub stages: vk::ShaderStageFlags,
}

impl BindingDescriptor {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        self.kind.descriptor_type()
    }

    pub fn to_vk(&self) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(self.binding)
            .descriptor_type(self.descriptor_type())
            .descriptor_count(self.count)
            .stage_flags(self.stages)
    }
}

/// Bindings of descriptor set 0, keyed by the name the shaders gave them.
///
/// A name maps to the same slot and kind in every stage, and a slot belongs to
/// one name. Merging is commutative: the table is independent of the order
/// stages are added in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingTable {
    entries: HashMap<String, BindingDescriptor>,
    /// Owner of each claimed slot.
    slots: HashMap<u32, String>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reflects `code` and merges its set 0 bindings with visibility `stage`.
    ///
    /// Resources in other descriptor sets are skipped. On conflict nothing is merged.
    pub fn add_binding_map(&mut self, code: &[u32], stage: vk::ShaderStageFlags) -> Result<()> {
        let reflected = reflect::reflect(code)?;
        let mut accepted: Vec<ReflectedBinding> = Vec::with_capacity(reflected.len());
        for binding in reflected {
            if binding.set != 0 {
                tracing::debug!(
                    name = %binding.name,
                    set = binding.set,
                    "Skipping binding outside descriptor set 0"
                );
                continue;
            }
            self.check(&binding, &accepted)?;
            accepted.push(binding);
        }
        for binding in accepted {
            self.merge(binding, stage);
        }
        Ok(())
    }

    /// Checks `incoming` against the table and against the bindings of the same
    /// module that were already accepted.
    fn check(&self, incoming: &ReflectedBinding, accepted: &[ReflectedBinding]) -> Result<()> {
        let declared = self
            .entries
            .get(&incoming.name)
            .map(|existing| (existing.binding, existing.kind))
            .or_else(|| {
                accepted
                    .iter()
                    .find(|binding| binding.name == incoming.name)
                    .map(|binding| (binding.binding, binding.kind))
            });
        if let Some((binding, kind)) = declared {
            if binding != incoming.binding {
                return Err(Error::BindingConflict {
                    name: incoming.name.clone(),
                    existing: binding,
                    incoming: incoming.binding,
                });
            }
            if kind != incoming.kind {
                return Err(Error::BindingKindConflict {
                    name: incoming.name.clone(),
                    existing: kind,
                    incoming: incoming.kind,
                });
            }
        }

        let owner = self
            .slots
            .get(&incoming.binding)
            .map(String::as_str)
            .or_else(|| {
                accepted
                    .iter()
                    .find(|binding| binding.binding == incoming.binding)
                    .map(|binding| binding.name.as_str())
            });
        match owner {
            Some(owner) if owner != incoming.name => Err(Error::SlotConflict {
                slot: incoming.binding,
                existing: owner.to_owned(),
                incoming: incoming.name.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn merge(&mut self, incoming: ReflectedBinding, stage: vk::ShaderStageFlags) {
        tracing::debug!(
            name = %incoming.name,
            binding = incoming.binding,
            kind = ?incoming.kind,
            ?stage,
            "Reflected binding"
        );
        self.slots.insert(incoming.binding, incoming.name.clone());
        self.entries
            .entry(incoming.name)
            .and_modify(|existing| {
                existing.stages |= stage;
                existing.count = existing.count.max(incoming.count);
                existing.runtime_sized |= incoming.runtime_sized;
            })
            .or_insert(BindingDescriptor {
                binding: incoming.binding,
                kind: incoming.kind,
                count: incoming.count,
                runtime_sized: incoming.runtime_sized,
                stages: stage,
            });
    }

    /// Gives every runtime sized binding the descriptor count `count` reports for
    /// its slot, or 1 when it reports nothing.
    pub fn size_runtime_arrays(&mut self, count: impl Fn(u32) -> Option<u32>) {
        for desc in self.entries.values_mut().filter(|desc| desc.runtime_sized) {
            desc.count = count(desc.binding).unwrap_or(1).max(1);
        }
    }

    pub fn get(&self, name: &str) -> Option<&BindingDescriptor> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindingDescriptor)> {
        self.entries.iter().map(|(name, desc)| (name.as_str(), desc))
    }

    /// Layout bindings ordered by slot.
    pub fn bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        let mut descriptors: Vec<_> = self.entries.values().collect();
        descriptors.sort_by_key(|desc| desc.binding);
        descriptors.into_iter().map(BindingDescriptor::to_vk).collect()
    }
}
