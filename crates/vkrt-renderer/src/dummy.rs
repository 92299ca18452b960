//! Dummy ray-tracing device for testing and development.
//!
//! No GPU work is performed. Handles are unique fake values, buffers keep
//! their contents in host memory, and every call is recorded in a
//! [`DummyLog`] that tests can inspect. Cloning the device shares the log.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use crate::descriptors::{DescriptorWrite, LayoutBinding};
use crate::device::{
    AccelerationGeometry, BufferDesc, BuildMode, BuildSizes, ImageDesc, RayTracingDevice,
    RtCapabilities, TraceDispatch,
};
use crate::error::{RtError, RtResult};
use crate::host::HostTexture;
use crate::raytracing::pipeline::{ShaderGroup, ShaderStage};
use crate::resources::{BufferMemory, GpuAccelerationStructure, GpuBuffer, GpuImage, ImageMemory};

const ADDRESS_ALIGNMENT: u64 = 256;

/// One recorded acceleration-structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildRecord {
    pub structure: vk::AccelerationStructureKHR,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub mode: BuildMode,
    pub primitive_count: u32,
    pub scratch_size: vk::DeviceSize,
}

/// One recorded descriptor write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub first_element: u32,
    pub count: u32,
    pub descriptor_type: vk::DescriptorType,
}

/// One recorded trace-rays dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub pipeline: vk::Pipeline,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub image: vk::Image,
    pub extent: vk::Extent2D,
}

/// Everything the dummy device was asked to do.
#[derive(Debug, Clone, Default)]
pub struct DummyLog {
    pub buffers_created: usize,
    pub images_created: usize,
    pub structures_created: Vec<vk::AccelerationStructureTypeKHR>,
    pub builds: Vec<BuildRecord>,
    pub layouts: Vec<Vec<LayoutBinding>>,
    pub layouts_destroyed: usize,
    pub pool_sizes: Vec<vk::DescriptorPoolSize>,
    pub pools_destroyed: usize,
    /// Variable counts of each successful set allocation.
    pub allocations: Vec<Vec<u32>>,
    pub sets_freed: usize,
    pub update_calls: usize,
    pub writes: Vec<WriteRecord>,
    pub pipeline_layouts_created: usize,
    pub shader_modules_created: usize,
    pub shader_modules_destroyed: usize,
    pub pipelines_created: usize,
    pub pipelines_destroyed: usize,
    pub pipeline_groups: Vec<ShaderGroup>,
    pub recursion_depths: Vec<u32>,
    pub traces: Vec<TraceRecord>,
    pub copies: Vec<(vk::Image, vk::Image)>,
    pub wait_idle_calls: usize,
}

struct PoolState {
    max_sets: u32,
    live_sets: u32,
}

#[derive(Default)]
struct DummyState {
    log: DummyLog,
    next_handle: u64,
    next_address: u64,
    pools: HashMap<vk::DescriptorPool, PoolState>,
    /// Buffers that may still be created before creation starts failing.
    buffers_until_failure: Option<usize>,
    fail_next_build: bool,
}

impl DummyState {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn address(&mut self, size: vk::DeviceSize) -> vk::DeviceAddress {
        let address = 0x1000_0000 + self.next_address;
        self.next_address += size.div_ceil(ADDRESS_ALIGNMENT).max(1) * ADDRESS_ALIGNMENT;
        address
    }
}

/// Dummy device.
#[derive(Clone)]
pub struct DummyDevice {
    capabilities: RtCapabilities,
    state: Arc<Mutex<DummyState>>,
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDevice {
    pub fn new() -> Self {
        Self::with_capabilities(RtCapabilities::default())
    }

    pub fn with_capabilities(capabilities: RtCapabilities) -> Self {
        Self {
            capabilities,
            state: Arc::new(Mutex::new(DummyState::default())),
        }
    }

    /// Snapshot of the call log.
    pub fn log(&self) -> DummyLog {
        self.state.lock().log.clone()
    }

    /// Let `count` more buffers succeed, then fail every later creation.
    pub fn fail_buffers_after(&self, count: usize) {
        self.state.lock().buffers_until_failure = Some(count);
    }

    /// Stop injecting buffer failures.
    pub fn heal_buffers(&self) {
        self.state.lock().buffers_until_failure = None;
    }

    /// Fail the next acceleration-structure build.
    pub fn fail_next_build(&self) {
        self.state.lock().fail_next_build = true;
    }

    fn host_buffer(
        state: &mut DummyState,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> GpuBuffer {
        let raw = state.handle::<vk::Buffer>();
        let address = usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| state.address(size));
        state.log.buffers_created += 1;
        GpuBuffer::new(
            raw,
            size,
            usage,
            address,
            BufferMemory::Host(Mutex::new(vec![0; size as usize])),
        )
    }
}

impl RayTracingDevice for DummyDevice {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn capabilities(&self) -> &RtCapabilities {
        &self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> RtResult<GpuBuffer> {
        log::trace!("DummyDevice: creating buffer {:?} (size: {})", desc.name, desc.size);
        let mut state = self.state.lock();

        if let Some(remaining) = state.buffers_until_failure.as_mut() {
            if *remaining == 0 {
                return Err(RtError::vulkan("create buffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            *remaining -= 1;
        }

        Ok(Self::host_buffer(&mut state, desc.size, desc.usage))
    }

    fn create_storage_image(&self, desc: &ImageDesc<'_>) -> RtResult<GpuImage> {
        log::trace!(
            "DummyDevice: creating image {:?} ({}x{})",
            desc.name,
            desc.extent.width,
            desc.extent.height
        );
        let mut state = self.state.lock();
        let raw = state.handle::<vk::Image>();
        let view = state.handle::<vk::ImageView>();
        state.log.images_created += 1;
        Ok(GpuImage::new(raw, view, desc.format, desc.extent, ImageMemory::Host))
    }

    fn acceleration_structure_sizes(&self, geometry: &AccelerationGeometry<'_>) -> RtResult<BuildSizes> {
        let count = u64::from(geometry.primitive_count());
        Ok(BuildSizes {
            structure_size: 256 + 64 * count,
            build_scratch_size: 128 * count.max(1),
            update_scratch_size: 64 * count.max(1),
        })
    }

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &str,
    ) -> RtResult<GpuAccelerationStructure> {
        log::trace!("DummyDevice: creating acceleration structure {:?} ({:?})", name, ty);
        let buffer = self.create_buffer(&BufferDesc {
            size,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            name,
        })?;

        let mut state = self.state.lock();
        let raw = state.handle::<vk::AccelerationStructureKHR>();
        state.log.structures_created.push(ty);
        Ok(GpuAccelerationStructure::new(raw, ty, buffer, None))
    }

    fn build_acceleration_structure(
        &self,
        target: &mut GpuAccelerationStructure,
        geometry: &AccelerationGeometry<'_>,
        mode: BuildMode,
        scratch_size: vk::DeviceSize,
    ) -> RtResult<()> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_build) {
            return Err(RtError::vulkan("queue submit", vk::Result::ERROR_DEVICE_LOST));
        }
        if mode == BuildMode::Update && target.device_address().is_none() {
            return Err(RtError::ResourceCreation("update of an unbuilt acceleration structure".to_string()));
        }

        state.log.builds.push(BuildRecord {
            structure: target.raw(),
            ty: geometry.ty(),
            mode,
            primitive_count: geometry.primitive_count(),
            scratch_size,
        });
        drop(state);

        if let Some(address) = target.buffer().device_address() {
            target.set_device_address(address);
        }
        Ok(())
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> RtResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        state.log.layouts.push(bindings.to_vec());
        Ok(state.handle())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state.lock().log.layouts_destroyed += 1;
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> RtResult<vk::DescriptorPool> {
        let mut state = self.state.lock();
        let pool = state.handle::<vk::DescriptorPool>();
        state.log.pool_sizes = sizes.to_vec();
        state.pools.insert(
            pool,
            PoolState {
                max_sets,
                live_sets: 0,
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.pools.remove(&pool);
        state.log.pools_destroyed += 1;
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: &[u32],
    ) -> RtResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        let requested = layouts.len() as u32;
        let pool_state = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| RtError::vulkan("allocate descriptor sets", vk::Result::ERROR_UNKNOWN))?;
        if pool_state.live_sets + requested > pool_state.max_sets {
            return Err(RtError::vulkan(
                "allocate descriptor sets",
                vk::Result::ERROR_OUT_OF_POOL_MEMORY,
            ));
        }
        pool_state.live_sets += requested;

        state.log.allocations.push(variable_counts.to_vec());
        Ok((0..requested).map(|_| state.handle()).collect())
    }

    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) {
        let mut state = self.state.lock();
        if let Some(pool_state) = state.pools.get_mut(&pool) {
            pool_state.live_sets = pool_state.live_sets.saturating_sub(sets.len() as u32);
        }
        state.log.sets_freed += sets.len();
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        state.log.update_calls += 1;
        state.log.writes.extend(writes.iter().map(|write| WriteRecord {
            set: write.set,
            binding: write.binding,
            first_element: write.first_element,
            count: write.resource.descriptor_count(),
            descriptor_type: write.resource.descriptor_type(),
        }));
    }

    fn create_pipeline_layout(&self, _set_layouts: &[vk::DescriptorSetLayout]) -> RtResult<vk::PipelineLayout> {
        let mut state = self.state.lock();
        state.log.pipeline_layouts_created += 1;
        Ok(state.handle())
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {}

    fn create_shader_module(&self, code: &[u32]) -> RtResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RtError::vulkan("create shader module", vk::Result::ERROR_UNKNOWN));
        }
        let mut state = self.state.lock();
        state.log.shader_modules_created += 1;
        Ok(state.handle())
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.state.lock().log.shader_modules_destroyed += 1;
    }

    fn create_ray_tracing_pipeline(
        &self,
        _layout: vk::PipelineLayout,
        stages: &[ShaderStage],
        groups: &[ShaderGroup],
        max_recursion_depth: u32,
    ) -> RtResult<vk::Pipeline> {
        let stage_count = stages.len() as u32;
        if groups.iter().any(|group| group.shader_index() >= stage_count) {
            return Err(RtError::ResourceCreation("ray tracing pipeline".to_string()));
        }

        let mut state = self.state.lock();
        state.log.pipelines_created += 1;
        state.log.pipeline_groups = groups.to_vec();
        state.log.recursion_depths.push(max_recursion_depth);
        Ok(state.handle())
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.state.lock().log.pipelines_destroyed += 1;
    }

    fn shader_group_handles(&self, _pipeline: vk::Pipeline, group_count: u32) -> RtResult<Vec<u8>> {
        let handle_size = self.capabilities.shader_group_handle_size as usize;
        Ok((0..group_count)
            .flat_map(|group| std::iter::repeat(group as u8 + 1).take(handle_size))
            .collect())
    }

    fn record_trace_rays(&self, _cmd: vk::CommandBuffer, dispatch: &TraceDispatch<'_>) {
        self.state.lock().log.traces.push(TraceRecord {
            pipeline: dispatch.pipeline,
            descriptor_sets: dispatch.descriptor_sets.to_vec(),
            image: dispatch.image,
            extent: dispatch.extent,
        });
    }

    fn record_copy_to_texture(&self, _cmd: vk::CommandBuffer, source: &GpuImage, destination: &HostTexture) {
        self.state.lock().log.copies.push((source.raw(), destination.image));
    }

    fn wait_idle(&self) -> RtResult<()> {
        self.state.lock().log.wait_idle_calls += 1;
        Ok(())
    }
}
