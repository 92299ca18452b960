//! Ray tracing pipeline lifecycle.
//!
//! ```text
//! Uninitialized --ensure_layout--> LayoutReady --ensure_pipeline--> Ready
//!                                       ^                             |
//!                                       +----------- reset -----------+
//! ```
//!
//! `reset` only destroys the pipeline and its binding table. The layout
//! stays, since descriptor sets are bound against it.

use std::io;
use std::path::Path;

use ash::vk;
use vkrt_common::RayTracerConfig;

use super::sbt::{ShaderBindingTable, GROUP_COUNT};
use crate::device::RayTracingDevice;
use crate::error::{RtError, RtResult};

/// Shader stages in the order their modules are passed to the pipeline.
pub const STAGE_ORDER: [vk::ShaderStageFlags; 5] = [
    vk::ShaderStageFlags::RAYGEN_KHR,
    vk::ShaderStageFlags::CLOSEST_HIT_KHR,
    vk::ShaderStageFlags::MISS_KHR,
    vk::ShaderStageFlags::CLOSEST_HIT_KHR,
    vk::ShaderStageFlags::MISS_KHR,
];

/// Pipeline groups: raygen, primary and shadow hit, primary and shadow miss.
pub const SHADER_GROUPS: [ShaderGroup; GROUP_COUNT as usize] = [
    ShaderGroup::General { shader: 0 },
    ShaderGroup::TrianglesHit { closest_hit: 1 },
    ShaderGroup::TrianglesHit { closest_hit: 3 },
    ShaderGroup::General { shader: 2 },
    ShaderGroup::General { shader: 4 },
];

#[derive(Debug, Clone, Copy)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
}

/// A pipeline shader group referencing stages by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroup {
    /// Raygen or miss group.
    General { shader: u32 },
    /// Triangle hit group with only a closest-hit shader.
    TrianglesHit { closest_hit: u32 },
}

impl ShaderGroup {
    pub fn shader_index(&self) -> u32 {
        match *self {
            ShaderGroup::General { shader } => shader,
            ShaderGroup::TrianglesHit { closest_hit } => closest_hit,
        }
    }
}

/// Lifecycle state of [`RayTracingPipelineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    LayoutReady,
    Ready,
}

/// Read a compiled SPIR-V binary as 32-bit words.
pub fn load_spirv(path: &Path) -> RtResult<Vec<u32>> {
    let shader_error = |source: io::Error| RtError::ShaderLoad {
        path: path.to_path_buf(),
        source,
    };

    let bytes = std::fs::read(path).map_err(shader_error)?;
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(shader_error(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("SPIR-V size {} is not a non-zero multiple of 4", bytes.len()),
        )));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Shader modules that only live for the duration of pipeline creation.
struct ShaderModules<'a> {
    device: &'a dyn RayTracingDevice,
    modules: Vec<vk::ShaderModule>,
}

impl<'a> ShaderModules<'a> {
    fn load(device: &'a dyn RayTracingDevice, paths: &[std::path::PathBuf]) -> RtResult<Self> {
        let mut loaded = Self {
            device,
            modules: Vec::with_capacity(paths.len()),
        };
        for path in paths {
            let code = load_spirv(path)?;
            loaded.modules.push(device.create_shader_module(&code)?);
        }
        Ok(loaded)
    }

    fn stages(&self) -> Vec<ShaderStage> {
        STAGE_ORDER
            .iter()
            .zip(&self.modules)
            .map(|(&stage, &module)| ShaderStage { stage, module })
            .collect()
    }
}

impl Drop for ShaderModules<'_> {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            self.device.destroy_shader_module(module);
        }
    }
}

struct ReadyPipeline {
    pipeline: vk::Pipeline,
    sbt: ShaderBindingTable,
}

/// Owns the pipeline layout, the pipeline and its binding table.
#[derive(Default)]
pub struct RayTracingPipelineState {
    layout: Option<vk::PipelineLayout>,
    ready: Option<ReadyPipeline>,
}

impl RayTracingPipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PipelineState {
        match (&self.layout, &self.ready) {
            (None, _) => PipelineState::Uninitialized,
            (Some(_), None) => PipelineState::LayoutReady,
            (Some(_), Some(_)) => PipelineState::Ready,
        }
    }

    pub fn layout(&self) -> Option<vk::PipelineLayout> {
        self.layout
    }

    pub fn pipeline(&self) -> Option<vk::Pipeline> {
        self.ready.as_ref().map(|ready| ready.pipeline)
    }

    pub fn sbt(&self) -> Option<&ShaderBindingTable> {
        self.ready.as_ref().map(|ready| &ready.sbt)
    }

    /// Create the pipeline layout over `set_layouts` if it does not exist.
    pub fn ensure_layout(
        &mut self,
        device: &dyn RayTracingDevice,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> RtResult<vk::PipelineLayout> {
        if let Some(layout) = self.layout {
            return Ok(layout);
        }

        let layout = device.create_pipeline_layout(set_layouts)?;
        log::info!("Ray tracing pipeline layout created");
        self.layout = Some(layout);
        Ok(layout)
    }

    /// Load the stage binaries, create the pipeline and build its binding
    /// table, unless the pipeline already exists.
    pub fn ensure_pipeline(&mut self, device: &dyn RayTracingDevice, config: &RayTracerConfig) -> RtResult<()> {
        if self.ready.is_some() {
            return Ok(());
        }
        let layout = self
            .layout
            .ok_or_else(|| RtError::ResourceCreation("ray tracing pipeline without a layout".to_string()))?;

        let modules = ShaderModules::load(device, &config.shader_paths())?;
        let depth = config.recursion_depth(device.capabilities().max_ray_recursion_depth);
        let pipeline = device.create_ray_tracing_pipeline(layout, &modules.stages(), &SHADER_GROUPS, depth)?;
        drop(modules);

        let sbt = match ShaderBindingTable::new(device, pipeline) {
            Ok(sbt) => sbt,
            Err(err) => {
                device.destroy_pipeline(pipeline);
                return Err(err);
            }
        };

        log::info!(
            "Ray tracing pipeline created from {} (recursion depth {})",
            config.shader_folder.display(),
            depth
        );
        self.ready = Some(ReadyPipeline { pipeline, sbt });
        Ok(())
    }

    /// Drop back to `LayoutReady`. The next dispatch recreates the pipeline.
    pub fn reset(&mut self, device: &dyn RayTracingDevice) {
        if let Some(ready) = self.ready.take() {
            device.destroy_pipeline(ready.pipeline);
            log::info!("Ray tracing pipeline reset");
        }
    }

    pub fn destroy(&mut self, device: &dyn RayTracingDevice) {
        self.reset(device);
        if let Some(layout) = self.layout.take() {
            device.destroy_pipeline_layout(layout);
        }
    }
}
