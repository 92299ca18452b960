//! Vulkan implementation of [`RayTracingDevice`].

use std::time::Duration;

use ash::khr::{acceleration_structure, ray_tracing_pipeline};
use ash::vk;

use super::commands::{transition_image_layout, OneShotSubmitter};
use super::context::{graphics_queue_family, query_capabilities};
use super::memory::MemoryManager;
use crate::descriptors::{DescriptorResource, DescriptorWrite, LayoutBinding};
use crate::device::{
    AccelerationGeometry, BufferDesc, BuildMode, BuildSizes, ImageDesc, RayTracingDevice,
    RtCapabilities, TraceDispatch,
};
use crate::error::{RtError, RtResult};
use crate::host::{HostTexture, HostVulkan};
use crate::raytracing::pipeline::{ShaderGroup, ShaderStage};
use crate::raytracing::sbt::align_up;
use crate::resources::{GpuAccelerationStructure, GpuBuffer, GpuImage};

const SHADER_ENTRY_POINT: &std::ffi::CStr = c"main";

/// Ray-tracing backend on a host-owned Vulkan device.
pub struct VulkanDevice {
    device: ash::Device,
    accel: acceleration_structure::Device,
    rt_pipeline: ray_tracing_pipeline::Device,
    capabilities: RtCapabilities,
    queue_family: u32,
    submitter: OneShotSubmitter,
    memory: MemoryManager,
}

impl VulkanDevice {
    /// Inspect the host device, then create the allocator and the one-shot
    /// submission queue.
    pub fn new(host: &HostVulkan, fence_timeout: Duration) -> RtResult<Self> {
        // SAFETY: the host guarantees the physical device belongs to its instance.
        let capabilities = unsafe { query_capabilities(&host.instance, host.physical_device)? };

        let families = unsafe {
            host.instance
                .get_physical_device_queue_family_properties(host.physical_device)
        };
        let queue_family = graphics_queue_family(&families)
            .ok_or_else(|| RtError::UnsupportedDevice("no graphics and compute queue family".to_string()))?;

        log::info!(
            "Ray tracing device: handle size {}, base alignment {}, max recursion {}, queue family {}",
            capabilities.shader_group_handle_size,
            capabilities.shader_group_base_alignment,
            capabilities.max_ray_recursion_depth,
            queue_family
        );

        let accel = acceleration_structure::Device::new(&host.instance, &host.device);
        let rt_pipeline = ray_tracing_pipeline::Device::new(&host.instance, &host.device);
        let submitter = OneShotSubmitter::new(&host.device, queue_family, fence_timeout)?;
        let memory = MemoryManager::new(host)?;

        Ok(Self {
            device: host.device.clone(),
            accel,
            rt_pipeline,
            capabilities,
            queue_family,
            submitter,
            memory,
        })
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn geometry_data(
        geometry: &AccelerationGeometry<'_>,
    ) -> RtResult<vk::AccelerationStructureGeometryKHR<'static>> {
        let address = |buffer: &GpuBuffer| {
            buffer.device_address().ok_or_else(|| {
                RtError::ResourceCreation("device address for acceleration structure input".to_string())
            })
        };

        let geometry = match *geometry {
            AccelerationGeometry::Triangles {
                vertices,
                vertex_count,
                indices,
                ..
            } => {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address(vertices)?,
                    })
                    .vertex_stride(std::mem::size_of::<[f32; 3]>() as vk::DeviceSize)
                    .max_vertex(vertex_count.saturating_sub(1))
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address(indices)?,
                    });

                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
            }
            AccelerationGeometry::Instances { instances, .. } => {
                let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address(instances)?,
                    });

                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR {
                        instances: instances_data,
                    })
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
            }
        };
        Ok(geometry)
    }
}

impl RayTracingDevice for VulkanDevice {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn capabilities(&self) -> &RtCapabilities {
        &self.capabilities
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> RtResult<GpuBuffer> {
        self.memory.create_buffer(desc)
    }

    fn create_storage_image(&self, desc: &ImageDesc<'_>) -> RtResult<GpuImage> {
        self.memory.create_image(desc)
    }

    fn acceleration_structure_sizes(&self, geometry: &AccelerationGeometry<'_>) -> RtResult<BuildSizes> {
        let geometries = [Self::geometry_data(geometry)?];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(geometry.ty())
            .flags(geometry.build_flags())
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let primitive_counts = [geometry.primitive_count()];
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        // SAFETY: the build info only references live buffers by address.
        unsafe {
            self.accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &primitive_counts,
                &mut size_info,
            );
        }

        Ok(BuildSizes {
            structure_size: size_info.acceleration_structure_size,
            build_scratch_size: size_info.build_scratch_size,
            update_scratch_size: size_info.update_scratch_size,
        })
    }

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &str,
    ) -> RtResult<GpuAccelerationStructure> {
        let buffer = self.memory.create_buffer(&BufferDesc {
            size,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            name,
        })?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.raw())
            .size(size)
            .ty(ty);

        let raw = unsafe { self.accel.create_acceleration_structure(&create_info, None) }
            .map_err(|result| RtError::vulkan("create acceleration structure", result))?;

        Ok(GpuAccelerationStructure::new(raw, ty, buffer, Some(self.accel.clone())))
    }

    fn build_acceleration_structure(
        &self,
        target: &mut GpuAccelerationStructure,
        geometry: &AccelerationGeometry<'_>,
        mode: BuildMode,
        scratch_size: vk::DeviceSize,
    ) -> RtResult<()> {
        let alignment = u64::from(self.capabilities.min_scratch_offset_alignment.max(1));
        let scratch = self.memory.create_buffer(&BufferDesc {
            size: scratch_size.max(1) + alignment,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            name: "acceleration structure scratch",
        })?;
        let scratch_address = scratch
            .device_address()
            .map(|address| align_up(address, alignment))
            .ok_or_else(|| RtError::ResourceCreation("scratch buffer device address".to_string()))?;

        let geometries = [Self::geometry_data(geometry)?];
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(target.ty())
            .flags(geometry.build_flags())
            .dst_acceleration_structure(target.raw())
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });
        build_info = match mode {
            BuildMode::Build => build_info.mode(vk::BuildAccelerationStructureModeKHR::BUILD),
            BuildMode::Update => build_info
                .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                .src_acceleration_structure(target.raw()),
        };

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(geometry.primitive_count())
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);
        let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

        self.submitter.submit(|cmd| {
            // SAFETY: `cmd` is recording and every referenced buffer outlives the wait.
            unsafe {
                self.accel
                    .cmd_build_acceleration_structures(cmd, &[build_info], &[build_ranges]);
            }
        })?;

        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(target.raw());
        let address = unsafe { self.accel.get_acceleration_structure_device_address(&addr_info) };
        target.set_device_address(address);

        drop(scratch);
        Ok(())
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> RtResult<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect();

        let binding_flags: Vec<vk::DescriptorBindingFlags> = bindings
            .iter()
            .map(|binding| {
                if binding.variable_count {
                    vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                        | vk::DescriptorBindingFlags::PARTIALLY_BOUND
                } else {
                    vk::DescriptorBindingFlags::empty()
                }
            })
            .collect();

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&vk_bindings)
            .push_next(&mut flags_info);

        unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|result| RtError::vulkan("create descriptor set layout", result))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> RtResult<vk::DescriptorPool> {
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(sizes);

        unsafe { self.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|result| RtError::vulkan("create descriptor pool", result))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
        variable_counts: &[u32],
    ) -> RtResult<Vec<vk::DescriptorSet>> {
        let mut variable_info = vk::DescriptorSetVariableDescriptorCountAllocateInfo::default()
            .descriptor_counts(variable_counts);
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts)
            .push_next(&mut variable_info);

        unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|result| RtError::vulkan("allocate descriptor sets", result))
    }

    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) {
        if let Err(result) = unsafe { self.device.free_descriptor_sets(pool, sets) } {
            log::error!("Failed to free descriptor sets: {}", result);
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut as_writes: Vec<vk::WriteDescriptorSetAccelerationStructureKHR> = writes
            .iter()
            .map(|write| match &write.resource {
                DescriptorResource::AccelerationStructure(structure) => {
                    vk::WriteDescriptorSetAccelerationStructureKHR::default()
                        .acceleration_structures(std::slice::from_ref(structure))
                }
                _ => vk::WriteDescriptorSetAccelerationStructureKHR::default(),
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(as_writes.iter_mut())
            .map(|(write, as_write)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.first_element)
                    .descriptor_type(write.resource.descriptor_type());
                match &write.resource {
                    DescriptorResource::AccelerationStructure(_) => {
                        base.descriptor_count(1).push_next(as_write)
                    }
                    DescriptorResource::UniformBuffer(info) => {
                        base.buffer_info(std::slice::from_ref(info))
                    }
                    DescriptorResource::StorageImage(info) => {
                        base.image_info(std::slice::from_ref(info))
                    }
                    DescriptorResource::StorageBuffers(infos) => base.buffer_info(infos),
                }
            })
            .collect();

        // SAFETY: every referenced buffer, view and structure is alive.
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_pipeline_layout(&self, set_layouts: &[vk::DescriptorSetLayout]) -> RtResult<vk::PipelineLayout> {
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .map_err(|result| RtError::vulkan("create pipeline layout", result))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_shader_module(&self, code: &[u32]) -> RtResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|result| RtError::vulkan("create shader module", result))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_ray_tracing_pipeline(
        &self,
        layout: vk::PipelineLayout,
        stages: &[ShaderStage],
        groups: &[ShaderGroup],
        max_recursion_depth: u32,
    ) -> RtResult<vk::Pipeline> {
        let vk_stages: Vec<vk::PipelineShaderStageCreateInfo> = stages
            .iter()
            .map(|stage| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(SHADER_ENTRY_POINT)
            })
            .collect();

        let vk_groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> = groups
            .iter()
            .map(|group| {
                let base = vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .general_shader(vk::SHADER_UNUSED_KHR)
                    .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                    .any_hit_shader(vk::SHADER_UNUSED_KHR)
                    .intersection_shader(vk::SHADER_UNUSED_KHR);
                match *group {
                    ShaderGroup::General { shader } => base
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(shader),
                    ShaderGroup::TrianglesHit { closest_hit } => base
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .closest_hit_shader(closest_hit),
                }
            })
            .collect();

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&vk_stages)
            .groups(&vk_groups)
            .max_pipeline_ray_recursion_depth(max_recursion_depth)
            .layout(layout);

        let pipelines = unsafe {
            self.rt_pipeline.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        }
        .map_err(|(_, result)| RtError::vulkan("create ray tracing pipeline", result))?;

        pipelines
            .into_iter()
            .next()
            .ok_or_else(|| RtError::ResourceCreation("ray tracing pipeline".to_string()))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32) -> RtResult<Vec<u8>> {
        let data_size = (group_count * self.capabilities.shader_group_handle_size) as usize;
        unsafe {
            self.rt_pipeline
                .get_ray_tracing_shader_group_handles(pipeline, 0, group_count, data_size)
        }
        .map_err(|result| RtError::vulkan("get shader group handles", result))
    }

    fn record_trace_rays(&self, cmd: vk::CommandBuffer, dispatch: &TraceDispatch<'_>) {
        // SAFETY: the host guarantees `cmd` is recording.
        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, dispatch.pipeline);
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                dispatch.layout,
                0,
                dispatch.descriptor_sets,
                &[],
            );

            transition_image_layout(
                &self.device,
                cmd,
                dispatch.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
            );

            self.rt_pipeline.cmd_trace_rays(
                cmd,
                &dispatch.regions.raygen,
                &dispatch.regions.miss,
                &dispatch.regions.hit,
                &dispatch.regions.callable,
                dispatch.extent.width,
                dispatch.extent.height,
                1,
            );
        }
    }

    fn record_copy_to_texture(&self, cmd: vk::CommandBuffer, source: &GpuImage, destination: &HostTexture) {
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let extent = source.extent();
        let region = vk::ImageCopy {
            src_subresource: layers,
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: extent.width.min(destination.extent.width),
                height: extent.height.min(destination.extent.height),
                depth: 1,
            },
        };

        // SAFETY: the host guarantees `cmd` is recording and the texture is not in use.
        unsafe {
            transition_image_layout(
                &self.device,
                cmd,
                source.raw(),
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            );
            transition_image_layout(
                &self.device,
                cmd,
                destination.image,
                destination.layout,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );

            self.device.cmd_copy_image(
                cmd,
                source.raw(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                destination.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            transition_image_layout(
                &self.device,
                cmd,
                source.raw(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::GENERAL,
            );
            transition_image_layout(
                &self.device,
                cmd,
                destination.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                destination.layout,
            );
        }
    }

    fn wait_idle(&self) -> RtResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|result| RtError::vulkan("device wait idle", result))
    }
}
