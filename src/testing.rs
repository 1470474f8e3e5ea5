//! Test doubles: an in-memory [`Device`] and a tiny SPIR-V assembler.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::RangeBounds,
    sync::{Arc, Mutex, MutexGuard},
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};
use glam::UVec3;

use crate::{
    buffer::BufferLike,
    device::{
        AccelBuildInfo, AccelGeometry, BufferInfo, DescriptorResources, DescriptorWrite, Device,
        RayTracingPipelineDesc, RayTracingProperties, SbtRegions,
    },
    spirv,
    utils::{AsVkHandle, align_up},
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct MockBuffer {
    raw: vk::Buffer,
    size: vk::DeviceSize,
    address: vk::DeviceAddress,
    data: Vec<u8>,
}

impl AsVkHandle for MockBuffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> vk::Buffer {
        self.raw
    }
}

impl BufferLike for MockBuffer {
    fn offset(&self) -> vk::DeviceSize {
        0
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn as_slice(&self) -> Option<&[u8]> {
        Some(&self.data)
    }

    fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        Some(&mut self.data)
    }

    fn flush(&mut self, _range: impl RangeBounds<vk::DeviceSize>) -> VkResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedBuild {
    pub level: vk::AccelerationStructureTypeKHR,
    pub mode: vk::BuildAccelerationStructureModeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometry_flags: vk::GeometryFlagsKHR,
    pub geometry: AccelGeometry,
    pub primitive_count: u32,
    pub src: vk::AccelerationStructureKHR,
    pub dst: vk::AccelerationStructureKHR,
    pub scratch: vk::DeviceAddress,
}

#[derive(Debug, Clone, Copy)]
pub struct CreatedPipeline {
    pub raw: vk::Pipeline,
    pub stage_count: usize,
    pub group_count: usize,
    pub max_ray_recursion_depth: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordedTrace {
    pub regions: SbtRegions,
    pub extent: UVec3,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    next_address: vk::DeviceAddress,

    shader_modules: HashSet<u64>,
    set_layouts: HashMap<u64, Vec<LayoutBinding>>,
    descriptor_sets: HashMap<u64, BTreeMap<u32, Vec<u64>>>,
    pool_capacity: Option<u32>,
    descriptor_updates: usize,
    descriptor_binds: usize,

    pipeline_layouts: HashMap<u64, Vec<vk::PushConstantRange>>,
    pipelines: HashSet<u64>,
    created_pipelines: Vec<CreatedPipeline>,
    pipeline_binds: usize,
    traces: Vec<RecordedTrace>,

    accels: HashMap<u64, vk::DeviceAddress>,
    accel_builds: Vec<RecordedBuild>,
    submissions: usize,
    barriers: usize,

    fail_allocation: Option<vk::Result>,
    fail_submission: Option<vk::Result>,
    fail_pipeline: Option<vk::Result>,
    fail_group_handles: Option<vk::Result>,
}

impl MockState {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }
}

/// Records every call and hands out deterministic handles and addresses.
#[derive(Clone)]
pub struct MockDevice(Arc<MockInner>);

struct MockInner {
    properties: RayTracingProperties,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_properties(RayTracingProperties::default())
    }

    pub fn with_properties(properties: RayTracingProperties) -> Self {
        Self(Arc::new(MockInner {
            properties,
            state: Mutex::new(MockState {
                next_address: 0x1_0000,
                ..Default::default()
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.0.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn build_sizes_for(
        &self,
        primitive_count: u32,
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        let count = primitive_count as vk::DeviceSize;
        vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(1024 + 256 * count)
            .build_scratch_size(512 + 128 * count)
            .update_scratch_size(256 + 64 * count)
    }

    /// The handle bytes the driver reports for `group` of `pipeline`.
    pub fn group_handle(&self, pipeline: vk::Pipeline, group: u32) -> Vec<u8> {
        let seed = (pipeline.as_raw() as u8).wrapping_mul(31);
        (0..self.0.properties.shader_group_handle_size)
            .map(|j| seed.wrapping_add((group as u8).wrapping_mul(17)).wrapping_add(j as u8))
            .collect()
    }

    pub fn fake_pipeline(&self) -> vk::Pipeline {
        let mut state = self.state();
        let raw: vk::Pipeline = state.handle();
        state.pipelines.insert(raw.as_raw());
        raw
    }

    pub fn set_descriptor_pool_capacity(&self, sets: u32) {
        self.state().pool_capacity = Some(sets);
    }

    pub fn fail_next_allocation(&self, err: vk::Result) {
        self.state().fail_allocation = Some(err);
    }

    pub fn fail_next_submission(&self, err: vk::Result) {
        self.state().fail_submission = Some(err);
    }

    pub fn fail_next_pipeline(&self, err: vk::Result) {
        self.state().fail_pipeline = Some(err);
    }

    pub fn fail_next_group_handle_query(&self, err: vk::Result) {
        self.state().fail_group_handles = Some(err);
    }

    pub fn live_shader_modules(&self) -> usize {
        self.state().shader_modules.len()
    }

    pub fn live_descriptor_set_layouts(&self) -> usize {
        self.state().set_layouts.len()
    }

    pub fn live_acceleration_structures(&self) -> usize {
        self.state().accels.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.state().pipelines.len()
    }

    pub fn live_pipeline_layouts(&self) -> usize {
        self.state().pipeline_layouts.len()
    }

    pub fn descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) -> Option<Vec<LayoutBinding>> {
        self.state().set_layouts.get(&layout.as_raw()).cloned()
    }

    /// Raw handles written to each binding of `set`.
    pub fn descriptor_contents(&self, set: vk::DescriptorSet) -> BTreeMap<u32, Vec<u64>> {
        self.state()
            .descriptor_sets
            .get(&set.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    pub fn descriptor_update_count(&self) -> usize {
        self.state().descriptor_updates
    }

    pub fn descriptor_binds(&self) -> usize {
        self.state().descriptor_binds
    }

    pub fn pipeline_layout_push_ranges(
        &self,
        layout: vk::PipelineLayout,
    ) -> Option<Vec<vk::PushConstantRange>> {
        self.state().pipeline_layouts.get(&layout.as_raw()).cloned()
    }

    pub fn created_pipelines(&self) -> Vec<CreatedPipeline> {
        self.state().created_pipelines.clone()
    }

    pub fn pipeline_binds(&self) -> usize {
        self.state().pipeline_binds
    }

    pub fn traces(&self) -> Vec<RecordedTrace> {
        self.state().traces.clone()
    }

    pub fn accel_builds(&self) -> Vec<RecordedBuild> {
        self.state().accel_builds.clone()
    }

    pub fn submissions(&self) -> usize {
        self.state().submissions
    }

    pub fn barriers(&self) -> usize {
        self.state().barriers
    }
}

impl Device for MockDevice {
    type Buffer = MockBuffer;

    fn ray_tracing_properties(&self) -> &RayTracingProperties {
        &self.0.properties
    }

    fn create_buffer(&self, info: &BufferInfo<'_>) -> VkResult<MockBuffer> {
        let mut state = self.state();
        if let Some(err) = state.fail_allocation.take() {
            return Err(err);
        }
        let address = align_up(state.next_address, info.alignment.max(256));
        state.next_address = align_up(address + info.size.max(1), 256);
        Ok(MockBuffer {
            raw: state.handle(),
            size: info.size,
            address: if info.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
                address
            } else {
                0
            },
            data: vec![0; info.size as usize],
        })
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        if spirv::validate(code).is_err() {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        let mut state = self.state();
        let raw: vk::ShaderModule = state.handle();
        state.shader_modules.insert(raw.as_raw());
        Ok(raw)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state().shader_modules.remove(&module.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state();
        let raw: vk::DescriptorSetLayout = state.handle();
        let bindings = bindings
            .iter()
            .map(|b| LayoutBinding {
                binding: b.binding,
                descriptor_type: b.descriptor_type,
                descriptor_count: b.descriptor_count,
                stage_flags: b.stage_flags,
            })
            .collect();
        state.set_layouts.insert(raw.as_raw(), bindings);
        Ok(raw)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state().set_layouts.remove(&layout.as_raw());
    }

    fn allocate_descriptor_set(
        &self,
        _layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let mut state = self.state();
        match state.pool_capacity {
            Some(0) => return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            Some(n) => state.pool_capacity = Some(n - 1),
            None => {}
        }
        let raw: vk::DescriptorSet = state.handle();
        state.descriptor_sets.insert(raw.as_raw(), BTreeMap::new());
        Ok(raw)
    }

    fn free_descriptor_set(&self, set: vk::DescriptorSet) {
        let mut state = self.state();
        if state.descriptor_sets.remove(&set.as_raw()).is_some() {
            if let Some(n) = state.pool_capacity.as_mut() {
                *n += 1;
            }
        }
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite<'_>]) {
        let mut state = self.state();
        state.descriptor_updates += 1;
        let Some(contents) = state.descriptor_sets.get_mut(&set.as_raw()) else {
            return;
        };
        for write in writes {
            let handles = match write.resources {
                DescriptorResources::Buffers(infos) => {
                    infos.iter().map(|info| info.buffer.as_raw()).collect()
                }
                DescriptorResources::Images(infos) => {
                    infos.iter().map(|info| info.image_view.as_raw()).collect()
                }
                DescriptorResources::AccelerationStructures(accels) => {
                    accels.iter().map(|accel| accel.as_raw()).collect()
                }
            };
            contents.insert(write.binding, handles);
        }
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let mut state = self.state();
        let raw: vk::PipelineLayout = state.handle();
        state
            .pipeline_layouts
            .insert(raw.as_raw(), push_constant_ranges.to_vec());
        Ok(raw)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state().pipeline_layouts.remove(&layout.as_raw());
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> VkResult<vk::Pipeline> {
        let mut state = self.state();
        if let Some(err) = state.fail_pipeline.take() {
            return Err(err);
        }
        let raw: vk::Pipeline = state.handle();
        state.pipelines.insert(raw.as_raw());
        state.created_pipelines.push(CreatedPipeline {
            raw,
            stage_count: desc.stages.len(),
            group_count: desc.groups.len(),
            max_ray_recursion_depth: desc.max_ray_recursion_depth,
        });
        Ok(raw)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state().pipelines.remove(&pipeline.as_raw());
    }

    fn ray_tracing_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        first_group: u32,
        group_count: u32,
    ) -> VkResult<Vec<u8>> {
        if let Some(err) = self.state().fail_group_handles.take() {
            return Err(err);
        }
        Ok((first_group..first_group + group_count)
            .flat_map(|group| self.group_handle(pipeline, group))
            .collect())
    }

    fn acceleration_structure_build_sizes(
        &self,
        info: &AccelBuildInfo<'_>,
    ) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        self.build_sizes_for(info.primitive_count)
    }

    fn create_acceleration_structure(
        &self,
        buffer: &MockBuffer,
        _level: vk::AccelerationStructureTypeKHR,
    ) -> VkResult<vk::AccelerationStructureKHR> {
        let mut state = self.state();
        let raw: vk::AccelerationStructureKHR = state.handle();
        state.accels.insert(raw.as_raw(), buffer.address);
        Ok(raw)
    }

    fn acceleration_structure_device_address(
        &self,
        accel: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        self.state()
            .accels
            .get(&accel.as_raw())
            .copied()
            .unwrap_or_default()
    }

    fn destroy_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        self.state().accels.remove(&accel.as_raw());
    }

    fn submit_and_wait(&self, record: &mut dyn FnMut(vk::CommandBuffer)) -> VkResult<()> {
        let cmd: vk::CommandBuffer = {
            let mut state = self.state();
            if let Some(err) = state.fail_submission.take() {
                return Err(err);
            }
            state.submissions += 1;
            state.handle()
        };
        record(cmd);
        Ok(())
    }

    fn cmd_build_acceleration_structure(&self, _cmd: vk::CommandBuffer, info: &AccelBuildInfo<'_>) {
        self.state().accel_builds.push(RecordedBuild {
            level: info.level,
            mode: info.mode,
            flags: info.flags,
            geometry_flags: info.geometry_flags,
            geometry: *info.geometry,
            primitive_count: info.primitive_count,
            src: info.src,
            dst: info.dst,
            scratch: info.scratch,
        });
    }

    fn cmd_acceleration_structure_barrier(&self, _cmd: vk::CommandBuffer) {
        self.state().barriers += 1;
    }

    fn cmd_bind_pipeline(
        &self,
        _cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _pipeline: vk::Pipeline,
    ) {
        self.state().pipeline_binds += 1;
    }

    fn cmd_bind_descriptor_set(
        &self,
        _cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        _set: vk::DescriptorSet,
    ) {
        self.state().descriptor_binds += 1;
    }

    fn cmd_trace_rays(&self, _cmd: vk::CommandBuffer, regions: &SbtRegions, extent: UVec3) {
        self.state().traces.push(RecordedTrace {
            regions: *regions,
            extent,
        });
    }
}

/// Assembles just enough SPIR-V to declare resource variables.
///
/// Sections are laid out in module order. Types are not deduplicated and no
/// functions are emitted.
pub struct SpirvBuilder {
    next_id: u32,
    names: Vec<(u32, String)>,
    annotations: Vec<u32>,
    globals: Vec<u32>,
}

mod opcode {
    pub const NAME: u16 = 5;
    pub const MEMORY_MODEL: u16 = 14;
    pub const CAPABILITY: u16 = 17;
    pub const TYPE_INT: u16 = 21;
    pub const TYPE_FLOAT: u16 = 22;
    pub const TYPE_IMAGE: u16 = 25;
    pub const TYPE_SAMPLED_IMAGE: u16 = 27;
    pub const TYPE_ARRAY: u16 = 28;
    pub const TYPE_RUNTIME_ARRAY: u16 = 29;
    pub const TYPE_STRUCT: u16 = 30;
    pub const TYPE_POINTER: u16 = 32;
    pub const CONSTANT: u16 = 43;
    pub const VARIABLE: u16 = 59;
    pub const DECORATE: u16 = 71;
    pub const TYPE_ACCELERATION_STRUCTURE_KHR: u16 = 5341;
}

const CAPABILITY_SHADER: u32 = 1;
const CAPABILITY_RAY_TRACING_KHR: u32 = 4479;

const UNIFORM_CONSTANT: u32 = 0;
const UNIFORM: u32 = 2;
const STORAGE_BUFFER: u32 = 12;

const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;

fn instruction(words: &mut Vec<u32>, opcode: u16, operands: &[u32]) {
    words.push(((operands.len() as u32 + 1) << 16) | opcode as u32);
    words.extend_from_slice(operands);
}

impl SpirvBuilder {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            names: Vec::new(),
            annotations: Vec::new(),
            globals: Vec::new(),
        }
    }

    fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn declare(&mut self, opcode: u16, operands: &[u32]) {
        instruction(&mut self.globals, opcode, operands);
    }

    fn decorate(&mut self, operands: &[u32]) {
        instruction(&mut self.annotations, opcode::DECORATE, operands);
    }

    pub fn name(&mut self, id: u32, name: &str) {
        self.names.push((id, name.to_owned()));
    }

    /// Removes the debug name of `id`, as a stripped module would.
    pub fn strip_name(&mut self, id: u32) {
        self.names.retain(|(named, _)| *named != id);
    }

    fn bind(&mut self, var: u32, set: u32, binding: u32) {
        self.decorate(&[var, DECORATION_DESCRIPTOR_SET, set]);
        self.decorate(&[var, DECORATION_BINDING, binding]);
    }

    fn variable(&mut self, pointee: u32, storage_class: u32) -> u32 {
        let pointer = self.id();
        self.declare(opcode::TYPE_POINTER, &[pointer, storage_class, pointee]);
        let var = self.id();
        self.declare(opcode::VARIABLE, &[pointer, var, storage_class]);
        var
    }

    fn block(&mut self, name: &str, decoration: u32) -> u32 {
        let float = self.id();
        self.declare(opcode::TYPE_FLOAT, &[float, 32]);
        let block = self.id();
        self.declare(opcode::TYPE_STRUCT, &[block, float]);
        self.decorate(&[block, decoration]);
        self.name(block, &format!("{name}_block"));
        block
    }

    fn image(&mut self, sampled: u32) -> u32 {
        let float = self.id();
        self.declare(opcode::TYPE_FLOAT, &[float, 32]);
        let image = self.id();
        // 2D, not depth, not arrayed, single sampled, rgba32f for storage.
        let format = if sampled == 2 { 1 } else { 0 };
        self.declare(opcode::TYPE_IMAGE, &[image, float, 1, 0, 0, 0, sampled, format]);
        image
    }

    fn named_variable(&mut self, name: &str, ty: u32, storage_class: u32) -> u32 {
        let var = self.variable(ty, storage_class);
        self.name(var, name);
        var
    }

    pub fn uniform_buffer(&mut self, name: &str, set: u32, binding: u32) -> u32 {
        let var = self.undecorated_uniform_buffer(name);
        self.bind(var, set, binding);
        var
    }

    pub fn undecorated_uniform_buffer(&mut self, name: &str) -> u32 {
        let block = self.block(name, DECORATION_BLOCK);
        self.named_variable(name, block, UNIFORM)
    }

    pub fn storage_buffer(&mut self, name: &str, set: u32, binding: u32) -> u32 {
        let block = self.storage_block(name);
        let var = self.named_variable(name, block, STORAGE_BUFFER);
        self.bind(var, set, binding);
        var
    }

    /// A `Block` struct named `{name}_block`, for sharing between variables.
    pub fn storage_block(&mut self, name: &str) -> u32 {
        self.block(name, DECORATION_BLOCK)
    }

    /// An unnamed storage buffer variable of an existing block type.
    pub fn storage_buffer_of(&mut self, block: u32, set: u32, binding: u32) -> u32 {
        let var = self.variable(block, STORAGE_BUFFER);
        self.bind(var, set, binding);
        var
    }

    /// `buffer Block { .. } name[];`
    pub fn storage_buffer_runtime_array(&mut self, name: &str, set: u32, binding: u32) -> u32 {
        let block = self.storage_block(name);
        let array = self.id();
        self.declare(opcode::TYPE_RUNTIME_ARRAY, &[array, block]);
        let var = self.named_variable(name, array, STORAGE_BUFFER);
        self.bind(var, set, binding);
        var
    }

    /// A `BufferBlock` in the Uniform storage class, as emitted for SPIR-V 1.0.
    pub fn legacy_storage_buffer(&mut self, name: &str, set: u32, binding: u32) -> u32 {
        let block = self.block(name, DECORATION_BUFFER_BLOCK);
        let var = self.named_variable(name, block, UNIFORM);
        self.bind(var, set, binding);
        var
    }

    pub fn storage_image(&mut self, name: &str, set: u32, binding: u32) -> u32 {
        let image = self.image(2);
        let var = self.named_variable(name, image, UNIFORM_CONSTANT);
        self.bind(var, set, binding);
        var
    }

    pub fn sampled_image(&mut self, name: &str, set: u32, binding: u32, array: Option<u32>) -> u32 {
        let image = self.image(1);
        let sampled = self.id();
        self.declare(opcode::TYPE_SAMPLED_IMAGE, &[sampled, image]);
        let ty = match array {
            Some(length) => {
                let uint = self.id();
                self.declare(opcode::TYPE_INT, &[uint, 32, 0]);
                let constant = self.id();
                self.declare(opcode::CONSTANT, &[uint, constant, length]);
                let array = self.id();
                self.declare(opcode::TYPE_ARRAY, &[array, sampled, constant]);
                array
            }
            None => sampled,
        };
        let var = self.named_variable(name, ty, UNIFORM_CONSTANT);
        self.bind(var, set, binding);
        var
    }

    pub fn acceleration_structure(&mut self, name: &str, set: u32, binding: u32) -> u32 {
        let accel = self.id();
        self.declare(opcode::TYPE_ACCELERATION_STRUCTURE_KHR, &[accel]);
        let var = self.named_variable(name, accel, UNIFORM_CONSTANT);
        self.bind(var, set, binding);
        var
    }

    pub fn finish(self) -> Vec<u32> {
        let mut words = vec![spirv::MAGIC, 0x0001_0500, 0, self.next_id, 0];
        instruction(&mut words, opcode::CAPABILITY, &[CAPABILITY_SHADER]);
        instruction(&mut words, opcode::CAPABILITY, &[CAPABILITY_RAY_TRACING_KHR]);
        // Logical, GLSL450
        instruction(&mut words, opcode::MEMORY_MODEL, &[0, 1]);
        for (id, name) in &self.names {
            let mut bytes = name.as_bytes().to_vec();
            bytes.push(0);
            bytes.resize(bytes.len().next_multiple_of(4), 0);
            let mut operands = vec![*id];
            operands.extend(
                bytes
                    .chunks_exact(4)
                    .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            );
            instruction(&mut words, opcode::NAME, &operands);
        }
        words.extend(self.annotations);
        words.extend(self.globals);
        words
    }
}
