//! Descriptor reflection from SPIR-V.
//!
//! The module is loaded with `rspirv`; only names, decorations, the type graph
//! reachable from a resource variable and the integer constants used as array
//! lengths are looked at.

use std::collections::HashMap;

use rspirv::{
    dr::{self, Instruction, Operand},
    spirv::{Decoration, Dim, Op, StorageClass},
};

use crate::{binding::ResourceKind, error::SpirvError, spirv};

/// `Sampled` operand of `OpTypeImage` for images used without a sampler.
const IMAGE_SAMPLED_STORAGE: u32 = 2;

/// A resource variable declared by a shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedBinding {
    /// Variable name, or the block name for anonymous blocks.
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub kind: ResourceKind,
    /// Array length. Runtime sized arrays report 1.
    pub count: u32,
    /// Declared as a runtime sized array, e.g. `buffer Vertices { .. } vertexBuffers[];`.
    pub runtime_sized: bool,
}

#[derive(Debug, Clone, Copy)]
enum Type {
    Image { dim: Dim, sampled: u32 },
    SampledImage,
    Array { element: u32, length: u32 },
    RuntimeArray { element: u32 },
    Struct,
    Pointer { pointee: u32 },
    AccelerationStructure,
}

#[derive(Debug, Default, Clone, Copy)]
struct Decorations {
    set: Option<u32>,
    binding: Option<u32>,
    block: bool,
    buffer_block: bool,
}

#[derive(Default)]
struct Module {
    names: HashMap<u32, String>,
    decorations: HashMap<u32, Decorations>,
    types: HashMap<u32, Type>,
    constants: HashMap<u32, u32>,
    /// (result id, pointer type, storage class)
    variables: Vec<(u32, u32, StorageClass)>,
}

impl Module {
    fn load(code: &[u32]) -> Result<Self, SpirvError> {
        spirv::validate(code)?;
        let loaded =
            dr::load_words(code).map_err(|err| SpirvError::Malformed(err.to_string()))?;
        let mut module = Self::default();
        for inst in &loaded.debug_names {
            if let (Op::Name, [Operand::IdRef(target), Operand::LiteralString(name)]) =
                (inst.class.opcode, inst.operands.as_slice())
            {
                module.names.insert(*target, name.clone());
            }
        }
        for inst in &loaded.annotations {
            module.decorate(inst);
        }
        for inst in &loaded.types_global_values {
            module.declare(inst);
        }
        Ok(module)
    }

    fn decorate(&mut self, inst: &Instruction) {
        let (Op::Decorate, [Operand::IdRef(target), Operand::Decoration(decoration), rest @ ..]) =
            (inst.class.opcode, inst.operands.as_slice())
        else {
            return;
        };
        let entry = self.decorations.entry(*target).or_default();
        match (*decoration, rest) {
            (Decoration::Block, _) => entry.block = true,
            (Decoration::BufferBlock, _) => entry.buffer_block = true,
            (Decoration::Binding, [Operand::LiteralBit32(binding)]) => {
                entry.binding = Some(*binding)
            }
            (Decoration::DescriptorSet, [Operand::LiteralBit32(set)]) => entry.set = Some(*set),
            _ => {}
        }
    }

    fn declare(&mut self, inst: &Instruction) {
        let Some(id) = inst.result_id else {
            return;
        };
        let ty = match (inst.class.opcode, inst.operands.as_slice()) {
            (
                Op::TypeImage,
                [_, Operand::Dim(dim), _, _, _, Operand::LiteralBit32(sampled), ..],
            ) => Type::Image {
                dim: *dim,
                sampled: *sampled,
            },
            (Op::TypeSampledImage, _) => Type::SampledImage,
            (Op::TypeArray, [Operand::IdRef(element), Operand::IdRef(length)]) => Type::Array {
                element: *element,
                length: *length,
            },
            (Op::TypeRuntimeArray, [Operand::IdRef(element)]) => Type::RuntimeArray {
                element: *element,
            },
            (Op::TypeStruct, _) => Type::Struct,
            (Op::TypePointer, [_, Operand::IdRef(pointee)]) => Type::Pointer { pointee: *pointee },
            (Op::TypeAccelerationStructureKHR, _) => Type::AccelerationStructure,
            (Op::Constant, [Operand::LiteralBit32(value)]) => {
                self.constants.insert(id, *value);
                return;
            }
            (Op::Constant, [Operand::LiteralBit64(value)]) => {
                self.constants
                    .insert(id, u32::try_from(*value).unwrap_or(u32::MAX));
                return;
            }
            (Op::Variable, [Operand::StorageClass(storage_class), ..]) => {
                if let Some(pointer) = inst.result_type {
                    self.variables.push((id, pointer, *storage_class));
                }
                return;
            }
            _ => return,
        };
        self.types.insert(id, ty);
    }

    /// Strips array wrappers, returning the element type, the flattened length
    /// and whether any dimension is runtime sized.
    fn unwrap_arrays(&self, mut ty: u32) -> (u32, u32, bool) {
        let mut count = 1u32;
        let mut runtime_sized = false;
        loop {
            match self.types.get(&ty) {
                Some(Type::Array { element, length }) => {
                    count = count.saturating_mul(self.constants.get(length).copied().unwrap_or(1));
                    ty = *element;
                }
                Some(Type::RuntimeArray { element }) => {
                    runtime_sized = true;
                    ty = *element;
                }
                _ => return (ty, count, runtime_sized),
            }
        }
    }

    fn classify(&self, storage_class: StorageClass, ty: u32) -> Option<ResourceKind> {
        let decorations = self.decorations.get(&ty).copied().unwrap_or_default();
        match (storage_class, self.types.get(&ty)?) {
            (StorageClass::StorageBuffer, Type::Struct) => Some(ResourceKind::StorageBuffer),
            (StorageClass::Uniform, Type::Struct) if decorations.buffer_block => {
                Some(ResourceKind::StorageBuffer)
            }
            (StorageClass::Uniform, Type::Struct) if decorations.block => {
                Some(ResourceKind::UniformBuffer)
            }
            (StorageClass::UniformConstant, Type::Image { dim, sampled })
                if *sampled == IMAGE_SAMPLED_STORAGE
                    && !matches!(dim, Dim::DimBuffer | Dim::DimSubpassData) =>
            {
                Some(ResourceKind::StorageImage)
            }
            (StorageClass::UniformConstant, Type::SampledImage) => Some(ResourceKind::SampledImage),
            (StorageClass::UniformConstant, Type::AccelerationStructure) => {
                Some(ResourceKind::AccelerationStructure)
            }
            _ => None,
        }
    }
}

/// Lists every descriptor resource declared by a SPIR-V module, in declaration order.
///
/// Resources of kinds this crate does not bind (separate samplers, texel buffers,
/// input attachments) are skipped.
pub fn reflect(code: &[u32]) -> Result<Vec<ReflectedBinding>, SpirvError> {
    let module = Module::load(code)?;
    let mut bindings = Vec::new();
    for &(id, pointer, storage_class) in &module.variables {
        if !matches!(
            storage_class,
            StorageClass::UniformConstant | StorageClass::Uniform | StorageClass::StorageBuffer
        ) {
            continue;
        }
        let decorations = module.decorations.get(&id).copied().unwrap_or_default();
        let (Some(set), Some(binding)) = (decorations.set, decorations.binding) else {
            continue;
        };
        let Some(Type::Pointer { pointee }) = module.types.get(&pointer) else {
            continue;
        };
        let (ty, count, runtime_sized) = module.unwrap_arrays(*pointee);
        let Some(kind) = module.classify(storage_class, ty) else {
            tracing::debug!(set, binding, "Skipping unsupported resource type");
            continue;
        };
        let name = module
            .names
            .get(&id)
            .filter(|name| !name.is_empty())
            .or_else(|| module.names.get(&ty).filter(|name| !name.is_empty()))
            .cloned()
            .unwrap_or_else(|| format!("set{set}_binding{binding}"));
        bindings.push(ReflectedBinding {
            name,
            set,
            binding,
            kind,
            count,
            runtime_sized,
        });
    }
    Ok(bindings)
}
