//! Backend seam between the ray-tracing core and a graphics API.
//!
//! The core never calls the graphics API directly. Everything that touches
//! the device goes through [`RayTracingDevice`], so the backend is chosen
//! once when the [`RayTracer`](crate::RayTracer) is built.
//!
//! # Available Backends
//!
//! - [`VulkanDevice`](crate::vulkan::VulkanDevice): `ash` + `gpu-allocator`
//! - [`DummyDevice`](crate::dummy::DummyDevice): records calls, no GPU needed

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::descriptors::{DescriptorWrite, LayoutBinding};
use crate::error::RtResult;
use crate::host::HostTexture;
use crate::raytracing::pipeline::{ShaderGroup, ShaderStage};
use crate::raytracing::sbt::SbtRegions;
use crate::resources::{GpuAccelerationStructure, GpuBuffer, GpuImage};

/// Device limits relevant to ray tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtCapabilities {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub max_instance_count: u64,
    pub min_scratch_offset_alignment: u32,
}

impl Default for RtCapabilities {
    fn default() -> Self {
        Self {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 1,
            max_instance_count: 1 << 24,
            min_scratch_offset_alignment: 128,
        }
    }
}

/// Buffer creation request.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub name: &'a str,
}

/// 2D image creation request.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc<'a> {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub name: &'a str,
}

/// Geometry an acceleration structure is built over.
pub enum AccelerationGeometry<'a> {
    /// Indexed triangle list with tightly packed `vec3` positions.
    Triangles {
        vertices: &'a GpuBuffer,
        vertex_count: u32,
        indices: &'a GpuBuffer,
        triangle_count: u32,
    },
    /// Array of [`RtInstance`](crate::raytracing::acceleration::RtInstance) records.
    Instances {
        instances: &'a GpuBuffer,
        instance_count: u32,
    },
}

impl AccelerationGeometry<'_> {
    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            AccelerationGeometry::Triangles { .. } => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            AccelerationGeometry::Instances { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }

    pub fn primitive_count(&self) -> u32 {
        match *self {
            AccelerationGeometry::Triangles { triangle_count, .. } => triangle_count,
            AccelerationGeometry::Instances { instance_count, .. } => instance_count,
        }
    }

    /// Build flags: top-level structures stay updatable for transform-only refits.
    pub fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        match self {
            AccelerationGeometry::Triangles { .. } => {
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
            }
            AccelerationGeometry::Instances { .. } => {
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                    | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Build from scratch into the destination.
    Build,
    /// Refit in place, using the destination as source.
    Update,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

impl BuildSizes {
    pub fn scratch_size(&self, mode: BuildMode) -> vk::DeviceSize {
        match mode {
            BuildMode::Build => self.build_scratch_size,
            BuildMode::Update => self.update_scratch_size,
        }
    }
}

/// Everything needed to record one trace-rays dispatch.
pub struct TraceDispatch<'a> {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub descriptor_sets: &'a [vk::DescriptorSet],
    pub image: vk::Image,
    pub regions: &'a SbtRegions,
    pub extent: vk::Extent2D,
}

/// Device operations the ray-tracing core is written against.
pub trait RayTracingDevice {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &RtCapabilities;

    // Resource creation

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> RtResult<GpuBuffer>;

    fn create_storage_image(&self, desc: &ImageDesc<'_>) -> RtResult<GpuImage>;

    // Acceleration structures

    fn acceleration_structure_sizes(&self, geometry: &AccelerationGeometry<'_>) -> RtResult<BuildSizes>;

    /// Allocate storage and the structure handle. The structure has no
    /// device address until [`build_acceleration_structure`](Self::build_acceleration_structure) completes.
    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &str,
    ) -> RtResult<GpuAccelerationStructure>;

    /// Record, submit and wait for one build with a transient scratch buffer.
    fn build_acceleration_structure(
        &self,
        target: &mut GpuAccelerationStructure,
        geometry: &AccelerationGeometry<'_>,
        mode: BuildMode,
        scratch_size: vk::DeviceSize,
    ) -> RtResult<()>;

    // Descriptors

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> RtResult<vk::DescriptorSetLayout>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> RtResult<vk::DescriptorPool>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one set per layout. `variable_counts` holds one entry per
    /// layout; entries for layouts without a variable-count binding are ignored.
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: &[u32],
    ) -> RtResult<Vec<vk::DescriptorSet>>;

    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]);

    /// Apply every write in a single batched update.
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Pipelines

    fn create_pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout]) -> RtResult<vk::PipelineLayout>;

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_shader_module(&self, code: &[u32]) -> RtResult<vk::ShaderModule>;

    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_ray_tracing_pipeline(
        &self,
        layout: vk::PipelineLayout,
        stages: &[ShaderStage],
        groups: &[ShaderGroup],
        max_recursion_depth: u32,
    ) -> RtResult<vk::Pipeline>;

    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Opaque handles of the first `group_count` groups, packed back to back.
    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> RtResult<Vec<u8>>;

    // Command recording

    /// Bind, transition the output image to GENERAL and trace.
    fn record_trace_rays(&self, cmd: vk::CommandBuffer, dispatch: &TraceDispatch<'_>);

    /// Copy the traced image into a host texture and restore both layouts.
    fn record_copy_to_texture(&self, cmd: vk::CommandBuffer, source: &GpuImage, destination: &HostTexture);

    // Synchronization

    fn wait_idle(&self) -> RtResult<()>;
}
