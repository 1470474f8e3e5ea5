//! Shader modules and pipeline layouts.
//!
//! - [`Shader`]: a SPIR-V module together with its stage and entry point. The
//!   SPIR-V words are retained so descriptor bindings can be reflected from them.
//! - [`PipelineLayout`]: descriptor set layouts plus push constant ranges.

use std::{
    borrow::Cow,
    ffi::{CStr, CString},
    fmt::Debug,
};

use ash::vk;

use crate::{
    device::{Device, HasDevice},
    error::Result,
    spirv,
    utils::AsVkHandle,
};

pub struct Shader<D: Device> {
    device: D,
    module: vk::ShaderModule,
    code: Vec<u32>,
    stage: vk::ShaderStageFlags,
    entry: Cow<'static, CStr>,
}

impl<D: Device> Shader<D> {
    /// Creates a shader module from SPIR-V words. The entry point defaults to `main`.
    pub fn new(device: D, code: Vec<u32>, stage: vk::ShaderStageFlags) -> Result<Self> {
        spirv::validate(&code)?;
        let module = device.create_shader_module(&code)?;
        Ok(Self {
            device,
            module,
            code,
            stage,
            entry: Cow::Borrowed(c"main"),
        })
    }

    /// Creates a shader module from a little-endian SPIR-V byte stream.
    pub fn from_bytes(device: D, bytes: &[u8], stage: vk::ShaderStageFlags) -> Result<Self> {
        let code = spirv::words_from_bytes(bytes)?;
        Self::new(device, code, stage)
    }

    pub fn with_entry_point(mut self, entry: CString) -> Self {
        self.entry = Cow::Owned(entry);
        self
    }

    pub fn code(&self) -> &[u32] {
        &self.code
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    pub fn entry_point(&self) -> &CStr {
        &self.entry
    }
}

impl<D: Device> AsVkHandle for Shader<D> {
    type Handle = vk::ShaderModule;
    fn vk_handle(&self) -> Self::Handle {
        self.module
    }
}

impl<D: Device> HasDevice for Shader<D> {
    type Device = D;
    fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> Debug for Shader<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("module", &self.module)
            .field("stage", &self.stage)
            .field("entry", &self.entry)
            .field("words", &self.code.len())
            .finish()
    }
}

impl<D: Device> Drop for Shader<D> {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.module);
    }
}

pub struct PipelineLayout<D: Device> {
    device: D,
    handle: vk::PipelineLayout,
}

impl<D: Device> PipelineLayout<D> {
    pub fn new(
        device: D,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> ash::prelude::VkResult<Self> {
        let handle = device.create_pipeline_layout(set_layouts, push_constant_ranges)?;
        Ok(Self { device, handle })
    }
}

impl<D: Device> AsVkHandle for PipelineLayout<D> {
    type Handle = vk::PipelineLayout;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl<D: Device> HasDevice for PipelineLayout<D> {
    type Device = D;
    fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> Drop for PipelineLayout<D> {
    fn drop(&mut self) {
        self.device.destroy_pipeline_layout(self.handle);
    }
}
