//! SPIR-V word stream helpers.

use ash::vk;

use crate::error::SpirvError;

pub const MAGIC: u32 = 0x07230203;
const HEADER_WORDS: usize = 5;

/// Converts a little-endian SPIR-V byte stream into words and validates the header.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, SpirvError> {
    if bytes.is_empty() {
        return Err(SpirvError::Empty);
    }
    if !bytes.len().is_multiple_of(4) {
        return Err(SpirvError::UnalignedLength(bytes.len()));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    validate(&words)?;
    Ok(words)
}

/// Checks the magic number and that the header is complete.
pub fn validate(words: &[u32]) -> Result<(), SpirvError> {
    let Some(&magic) = words.first() else {
        return Err(SpirvError::Empty);
    };
    if magic != MAGIC {
        return Err(SpirvError::BadMagic(magic));
    }
    if words.len() < HEADER_WORDS {
        return Err(SpirvError::Truncated(words.len()));
    }
    Ok(())
}

/// Guesses the shader stage from a glslang style file name such as `shadow.rmiss.spv`.
pub fn stage_from_file_name(file_name: &str) -> Option<vk::ShaderStageFlags> {
    let lower = file_name.to_ascii_lowercase();
    let stem = lower.strip_suffix(".spv")?;
    let (_, ext) = stem.rsplit_once('.')?;
    let stage = match ext {
        "rgen" => vk::ShaderStageFlags::RAYGEN_KHR,
        "rmiss" => vk::ShaderStageFlags::MISS_KHR,
        "rchit" => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        "rahit" => vk::ShaderStageFlags::ANY_HIT_KHR,
        "rint" => vk::ShaderStageFlags::INTERSECTION_KHR,
        "rcall" => vk::ShaderStageFlags::CALLABLE_KHR,
        "vert" => vk::ShaderStageFlags::VERTEX,
        "frag" => vk::ShaderStageFlags::FRAGMENT,
        "comp" => vk::ShaderStageFlags::COMPUTE,
        "task" => vk::ShaderStageFlags::TASK_EXT,
        "mesh" => vk::ShaderStageFlags::MESH_EXT,
        _ => return None,
    };
    Some(stage)
}
