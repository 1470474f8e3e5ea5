use std::fmt::Debug;

use ash::vk;
use glam::UVec3;
use smallvec::SmallVec;

use super::ShaderBindingTable;
use crate::{
    device::{Device, HasDevice, PipelineStage, RayTracingPipelineDesc, SbtRegions},
    error::{Error, Result},
    pipeline::{PipelineLayout, Shader},
    utils::AsVkHandle,
};

const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::INTERSECTION_KHR.as_raw()
        | vk::ShaderStageFlags::CALLABLE_KHR.as_raw(),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroupKind {
    /// Raygen, miss or callable.
    General,
    TrianglesHit,
    ProceduralHit,
}

/// One shader group. Members index the pipeline's stage list, with
/// `vk::SHADER_UNUSED_KHR` for absent shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroup {
    pub kind: ShaderGroupKind,
    /// Raygen, miss or callable stage of a general group.
    pub general: u32,
    /// Closest hit stage of a hit group.
    pub closest_hit: u32,
    /// Any hit stage of a hit group.
    pub any_hit: u32,
    /// Intersection stage of a procedural hit group.
    pub intersection: u32,
}

impl ShaderGroup {
    pub fn general(stage: u32) -> Self {
        Self {
            kind: ShaderGroupKind::General,
            general: stage,
            closest_hit: vk::SHADER_UNUSED_KHR,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    pub fn triangles_hit(closest_hit: Option<u32>, any_hit: Option<u32>) -> Self {
        Self {
            kind: ShaderGroupKind::TrianglesHit,
            general: vk::SHADER_UNUSED_KHR,
            closest_hit: closest_hit.unwrap_or(vk::SHADER_UNUSED_KHR),
            any_hit: any_hit.unwrap_or(vk::SHADER_UNUSED_KHR),
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    pub fn procedural_hit(intersection: u32, closest_hit: Option<u32>, any_hit: Option<u32>) -> Self {
        Self {
            kind: ShaderGroupKind::ProceduralHit,
            intersection,
            ..Self::triangles_hit(closest_hit, any_hit)
        }
    }

    pub fn to_vk(&self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        let ty = match self.kind {
            ShaderGroupKind::General => vk::RayTracingShaderGroupTypeKHR::GENERAL,
            ShaderGroupKind::TrianglesHit => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            ShaderGroupKind::ProceduralHit => {
                vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
            }
        };
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(ty)
            .general_shader(self.general)
            .closest_hit_shader(self.closest_hit)
            .any_hit_shader(self.any_hit)
            .intersection_shader(self.intersection)
    }
}

/// The shaders of one hit group. A group with an intersection shader is procedural.
pub struct HitGroup<'a, D: Device> {
    /// Runs for the closest accepted intersection.
    pub closest_hit: Option<&'a Shader<D>>,
    /// Runs for every candidate intersection of non-opaque geometry.
    pub any_hit: Option<&'a Shader<D>>,
    /// Custom primitive intersection. Makes the group procedural.
    pub intersection: Option<&'a Shader<D>>,
}

impl<D: Device> Clone for HitGroup<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<D: Device> Copy for HitGroup<'_, D> {}

impl<'a, D: Device> HitGroup<'a, D> {
    pub fn triangles(closest_hit: &'a Shader<D>) -> Self {
        Self {
            closest_hit: Some(closest_hit),
            any_hit: None,
            intersection: None,
        }
    }

    pub fn procedural(intersection: &'a Shader<D>) -> Self {
        Self {
            closest_hit: None,
            any_hit: None,
            intersection: Some(intersection),
        }
    }

    pub fn with_closest_hit(mut self, shader: &'a Shader<D>) -> Self {
        self.closest_hit = Some(shader);
        self
    }

    pub fn with_any_hit(mut self, shader: &'a Shader<D>) -> Self {
        self.any_hit = Some(shader);
        self
    }
}

pub struct RayTracingPipelineCreateInfo<'a, D: Device> {
    /// The single raygen shader. Always group 0.
    pub raygen: &'a Shader<D>,
    /// Miss shaders, indexed by the `missIndex` argument of `traceRayEXT`.
    pub miss: &'a [&'a Shader<D>],
    /// Hit groups, indexed by an instance's SBT offset plus the `sbtRecordOffset`
    /// argument of `traceRayEXT`.
    pub hit_groups: &'a [HitGroup<'a, D>],
    /// Callable shaders, indexed by `executeCallableEXT`.
    pub callable: &'a [&'a Shader<D>],
    /// Typically `[descriptor_set.layout()]`.
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    /// Size of a push constant range visible to every ray tracing stage. 0 for none.
    pub push_constant_size: u32,
    /// Defaults to 4. Must not exceed the device limit.
    pub max_ray_recursion_depth: u32,
    /// Debug name, used in logs.
    pub name: &'a str,
}

impl<'a, D: Device> RayTracingPipelineCreateInfo<'a, D> {
    pub fn new(raygen: &'a Shader<D>) -> Self {
        Self {
            raygen,
            miss: &[],
            hit_groups: &[],
            callable: &[],
            set_layouts: &[],
            push_constant_size: 0,
            max_ray_recursion_depth: 4,
            name: "",
        }
    }
}

/// Flattens shaders into a stage list and groups in raygen, miss, hit, callable order.
fn assemble_groups<'a, D: Device>(
    info: &RayTracingPipelineCreateInfo<'a, D>,
) -> Result<(Vec<PipelineStage<'a>>, Vec<ShaderGroup>)> {
    fn push<'a, D: Device>(
        stages: &mut Vec<PipelineStage<'a>>,
        shader: &'a Shader<D>,
        expected: vk::ShaderStageFlags,
        message: &'static str,
    ) -> Result<u32> {
        if shader.stage() != expected {
            return Err(Error::InvalidShaderGroup(message));
        }
        stages.push(PipelineStage {
            stage: shader.stage(),
            module: shader.vk_handle(),
            entry: shader.entry_point(),
        });
        Ok(stages.len() as u32 - 1)
    }

    let mut stages = Vec::new();
    let mut groups = Vec::new();

    let raygen = push(
        &mut stages,
        info.raygen,
        vk::ShaderStageFlags::RAYGEN_KHR,
        "raygen shader must be a RAYGEN stage",
    )?;
    groups.push(ShaderGroup::general(raygen));

    for &shader in info.miss {
        let index = push(
            &mut stages,
            shader,
            vk::ShaderStageFlags::MISS_KHR,
            "miss shader must be a MISS stage",
        )?;
        groups.push(ShaderGroup::general(index));
    }

    for hit_group in info.hit_groups {
        let closest_hit = hit_group
            .closest_hit
            .map(|shader| {
                push(
                    &mut stages,
                    shader,
                    vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                    "closest hit shader must be a CLOSEST_HIT stage",
                )
            })
            .transpose()?;
        let any_hit = hit_group
            .any_hit
            .map(|shader| {
                push(
                    &mut stages,
                    shader,
                    vk::ShaderStageFlags::ANY_HIT_KHR,
                    "any hit shader must be an ANY_HIT stage",
                )
            })
            .transpose()?;
        let intersection = hit_group
            .intersection
            .map(|shader| {
                push(
                    &mut stages,
                    shader,
                    vk::ShaderStageFlags::INTERSECTION_KHR,
                    "intersection shader must be an INTERSECTION stage",
                )
            })
            .transpose()?;
        let group = match intersection {
            Some(intersection) => ShaderGroup::procedural_hit(intersection, closest_hit, any_hit),
            None if closest_hit.is_none() && any_hit.is_none() => {
                return Err(Error::InvalidShaderGroup("hit group has no shaders"));
            }
            None => ShaderGroup::triangles_hit(closest_hit, any_hit),
        };
        groups.push(group);
    }

    for &shader in info.callable {
        let index = push(
            &mut stages,
            shader,
            vk::ShaderStageFlags::CALLABLE_KHR,
            "callable shader must be a CALLABLE stage",
        )?;
        groups.push(ShaderGroup::general(index));
    }

    Ok((stages, groups))
}

/// A ray tracing pipeline with its layout and shader binding table.
pub struct RayTracingPipeline<D: Device> {
    device: D,
    raw: vk::Pipeline,
    groups: Vec<ShaderGroup>,
    sbt: ShaderBindingTable<D>,
    layout: PipelineLayout<D>,
}

impl<D: Device> RayTracingPipeline<D> {
    pub fn new(device: D, info: &RayTracingPipelineCreateInfo<'_, D>) -> Result<Self> {
        let max_depth = device.ray_tracing_properties().max_ray_recursion_depth;
        if info.max_ray_recursion_depth > max_depth {
            return Err(Error::RecursionDepthExceeded {
                requested: info.max_ray_recursion_depth,
                max: max_depth,
            });
        }
        let (stages, groups) = assemble_groups(info)?;

        let push_constant_ranges: SmallVec<[vk::PushConstantRange; 1]> =
            if info.push_constant_size > 0 {
                smallvec::smallvec![vk::PushConstantRange {
                    stage_flags: RAY_TRACING_STAGES,
                    offset: 0,
                    size: info.push_constant_size,
                }]
            } else {
                SmallVec::new()
            };
        let layout = PipelineLayout::new(device.clone(), info.set_layouts, &push_constant_ranges)
            .map_err(Error::PipelineCreateFailed)?;

        let vk_groups: Vec<_> = groups.iter().map(ShaderGroup::to_vk).collect();
        let raw = device
            .create_ray_tracing_pipeline(&RayTracingPipelineDesc {
                stages: &stages,
                groups: &vk_groups,
                max_ray_recursion_depth: info.max_ray_recursion_depth,
                layout: layout.vk_handle(),
            })
            .map_err(Error::PipelineCreateFailed)?;

        let sbt = match ShaderBindingTable::new(
            &device,
            raw,
            info.miss.len() as u32,
            info.hit_groups.len() as u32,
            info.callable.len() as u32,
        ) {
            Ok(sbt) => sbt,
            Err(err) => {
                device.destroy_pipeline(raw);
                return Err(err);
            }
        };

        tracing::info!(
            name = info.name,
            stages = stages.len(),
            groups = groups.len(),
            "Created ray tracing pipeline"
        );
        Ok(Self {
            device,
            raw,
            groups,
            sbt,
            layout,
        })
    }

    pub fn bind(&self, cmd: vk::CommandBuffer) {
        self.device
            .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.raw);
    }

    /// Dispatches `extent` rays through this pipeline's shader binding table.
    ///
    /// The pipeline and its descriptor sets must already be bound on `cmd`.
    pub fn trace_rays(&self, cmd: vk::CommandBuffer, extent: UVec3) {
        self.device.cmd_trace_rays(cmd, self.sbt.regions(), extent);
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.vk_handle()
    }

    pub fn groups(&self) -> &[ShaderGroup] {
        &self.groups
    }

    pub fn sbt(&self) -> &ShaderBindingTable<D> {
        &self.sbt
    }

    pub fn regions(&self) -> &SbtRegions {
        self.sbt.regions()
    }
}

impl<D: Device> AsVkHandle for RayTracingPipeline<D> {
    type Handle = vk::Pipeline;
    fn vk_handle(&self) -> Self::Handle {
        self.raw
    }
}

impl<D: Device> HasDevice for RayTracingPipeline<D> {
    type Device = D;
    fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> Debug for RayTracingPipeline<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RayTracingPipeline")
            .field("raw", &self.raw)
            .field("groups", &self.groups)
            .field("sbt", &self.sbt)
            .finish_non_exhaustive()
    }
}

impl<D: Device> Drop for RayTracingPipeline<D> {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.raw);
    }
}
