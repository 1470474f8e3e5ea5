use ash::vk;
use thiserror::Error;

use crate::binding::ResourceKind;

/// Failures while decoding a SPIR-V word stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpirvError {
    #[error("SPIR-V module is empty")]
    Empty,
    #[error("SPIR-V byte length {0} is not a multiple of 4")]
    UnalignedLength(usize),
    #[error("bad SPIR-V magic number {0:#010x}")]
    BadMagic(u32),
    #[error("SPIR-V header truncated after {0} words")]
    Truncated(usize),
    #[error("malformed SPIR-V module: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("binding `{name}` is declared at slot {existing} in one stage and slot {incoming} in another")]
    BindingConflict {
        name: String,
        existing: u32,
        incoming: u32,
    },
    #[error("binding `{name}` is declared as {existing:?} in one stage and {incoming:?} in another")]
    BindingKindConflict {
        name: String,
        existing: ResourceKind,
        incoming: ResourceKind,
    },
    #[error("slot {slot} is declared as `{existing}` in one place and `{incoming}` in another")]
    SlotConflict {
        slot: u32,
        existing: String,
        incoming: String,
    },
    #[error("no binding named `{name}` in the reflected layout")]
    UnknownBinding { name: String },
    #[error("binding `{name}` expects a {expected:?} resource, got {supplied:?}")]
    ResourceKindMismatch {
        name: String,
        expected: ResourceKind,
        supplied: &'static str,
    },
    #[error("binding `{name}` holds {capacity} descriptors but {supplied} were supplied")]
    TooManyResources {
        name: String,
        capacity: u32,
        supplied: usize,
    },
    #[error("descriptor layout is frozen once allocated")]
    LayoutFrozen,
    #[error("descriptor set has not been allocated")]
    NotAllocated,
    #[error("descriptor pool exhausted while allocating {requested_sets} set(s)")]
    AllocationExhausted {
        requested_sets: u32,
        #[source]
        source: vk::Result,
    },
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory {
        requested: vk::DeviceSize,
        #[source]
        source: vk::Result,
    },
    #[error("{level:?} acceleration structure build failed")]
    AccelBuildFailed {
        level: vk::AccelerationStructureTypeKHR,
        #[source]
        source: vk::Result,
    },
    #[error("TLAS was built with {built} instances but {supplied} were supplied to update")]
    InstanceCountMismatch { built: u32, supplied: u32 },
    #[error("TLAS was created without ALLOW_UPDATE")]
    UpdateNotAllowed,
    #[error("TLAS has not been built")]
    NotBuilt,
    #[error("ray tracing pipeline creation failed")]
    PipelineCreateFailed(#[source] vk::Result),
    #[error("shader group handle query failed")]
    SbtQueryFailed(#[source] vk::Result),
    #[error("invalid shader group: {0}")]
    InvalidShaderGroup(&'static str),
    #[error("requested ray recursion depth {requested} exceeds device limit {max}")]
    RecursionDepthExceeded { requested: u32, max: u32 },
    #[error(transparent)]
    InvalidSpirv(#[from] SpirvError),
    #[error(transparent)]
    Vulkan(#[from] vk::Result),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Classifies a failed memory allocation.
    pub(crate) fn from_alloc(requested: vk::DeviceSize, source: vk::Result) -> Self {
        match source {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory { requested, source }
            }
            other => Self::Vulkan(other),
        }
    }

    /// Classifies a failed descriptor set allocation.
    pub(crate) fn from_pool(requested_sets: u32, source: vk::Result) -> Self {
        match source {
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::AllocationExhausted {
                    requested_sets,
                    source,
                }
            }
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory {
                    requested: 0,
                    source,
                }
            }
            other => Self::Vulkan(other),
        }
    }
}
