//! Bottom- and top-level acceleration structure builds.
//!
//! A BLAS is built once per geometry. The TLAS follows two dirty flags:
//! adding or removing an instance requests a full rebuild, moving one
//! requests a transform-only refit. A full rebuild wins over a pending refit.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use vkrt_common::Transform3x4;

use crate::device::{AccelerationGeometry, BufferDesc, BuildMode, RayTracingDevice};
use crate::error::{RtError, RtResult};
use crate::resources::{GpuAccelerationStructure, GpuBuffer};

/// Byte size of one [`RtInstance`].
pub const INSTANCE_SIZE: u64 = std::mem::size_of::<RtInstance>() as u64;
/// Byte size of the transform at the start of each [`RtInstance`].
pub const TRANSFORM_SIZE: u64 = std::mem::size_of::<Transform3x4>() as u64;

/// Instance record consumed by a TLAS build, laid out as
/// `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RtInstance {
    pub transform: Transform3x4,
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl RtInstance {
    /// Instance visible to every ray, with back-face culling disabled.
    pub fn new(transform: Transform3x4, custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw();
        Self {
            transform,
            instance_custom_index_and_mask: (0xFF << 24) | (custom_index & 0xFF_FFFF),
            instance_shader_binding_table_record_offset_and_flags: flags << 24,
            acceleration_structure_reference: blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0xFF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }
}

/// Build a bottom-level structure over an indexed triangle list.
pub fn build_blas(
    device: &dyn RayTracingDevice,
    vertices: &GpuBuffer,
    vertex_count: u32,
    indices: &GpuBuffer,
    triangle_count: u32,
) -> RtResult<GpuAccelerationStructure> {
    let geometry = AccelerationGeometry::Triangles {
        vertices,
        vertex_count,
        indices,
        triangle_count,
    };

    let sizes = device.acceleration_structure_sizes(&geometry)?;
    let mut blas = device.create_acceleration_structure(
        vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        sizes.structure_size,
        "blas",
    )?;
    device.build_acceleration_structure(&mut blas, &geometry, BuildMode::Build, sizes.build_scratch_size)?;

    log::debug!(
        "BLAS built: {} triangles, {} bytes",
        triangle_count,
        sizes.structure_size
    );
    Ok(blas)
}

/// One live instance as the TLAS sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlasInput {
    /// Instance pool slot; becomes the instance custom index.
    pub slot: u32,
    pub transform: Transform3x4,
    pub blas_address: vk::DeviceAddress,
}

/// What the next [`TlasBuilder::build`] will do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasAction {
    /// Nothing is pending.
    None,
    /// No live instances: drop the TLAS.
    Release,
    FullRebuild,
    TransformUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasBuildOutcome {
    Skipped,
    Released,
    Built { instance_count: u32 },
    Updated { instance_count: u32 },
}

/// Top-level acceleration structure with its dirty state.
#[derive(Default)]
pub struct TlasBuilder {
    structure: Option<GpuAccelerationStructure>,
    instance_buffer: Option<GpuBuffer>,
    /// Instance slots in buffer order at the last full build.
    staged_slots: Vec<u32>,
    update_scratch_size: vk::DeviceSize,
    needs_full_rebuild: bool,
    needs_transform_update: bool,
    /// Bumped whenever the structure handle changes or goes away.
    epoch: u64,
}

impl TlasBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// An instance was added or removed.
    pub fn mark_instances_changed(&mut self) {
        self.needs_full_rebuild = true;
    }

    /// An instance transform changed.
    pub fn mark_transforms_changed(&mut self) {
        self.needs_transform_update = true;
    }

    pub fn needs_full_rebuild(&self) -> bool {
        self.needs_full_rebuild
    }

    pub fn needs_transform_update(&self) -> bool {
        self.needs_transform_update
    }

    pub fn structure(&self) -> Option<&GpuAccelerationStructure> {
        self.structure.as_ref()
    }

    pub fn instance_buffer(&self) -> Option<&GpuBuffer> {
        self.instance_buffer.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn plan(&self, live_count: usize) -> TlasAction {
        match (self.needs_full_rebuild, self.needs_transform_update) {
            (false, false) => TlasAction::None,
            _ if live_count == 0 => TlasAction::Release,
            (true, _) => TlasAction::FullRebuild,
            (false, true) if self.structure.is_none() => TlasAction::FullRebuild,
            (false, true) => TlasAction::TransformUpdate,
        }
    }

    /// Apply the pending dirty state. `instances` must be the live set in
    /// ascending slot order.
    ///
    /// On failure the previous structure is left as it was, except that a
    /// failed refit drops it and requests a full rebuild.
    pub fn build(&mut self, device: &dyn RayTracingDevice, instances: &[TlasInput]) -> RtResult<TlasBuildOutcome> {
        let mut action = self.plan(instances.len());
        if action == TlasAction::TransformUpdate
            && !instances.iter().map(|input| input.slot).eq(self.staged_slots.iter().copied())
        {
            log::warn!("TLAS instance order changed without a rebuild request; rebuilding");
            action = TlasAction::FullRebuild;
        }

        match action {
            TlasAction::None => {
                log::debug!("TLAS up to date");
                Ok(TlasBuildOutcome::Skipped)
            }
            TlasAction::Release => {
                self.release(device)?;
                Ok(TlasBuildOutcome::Released)
            }
            TlasAction::FullRebuild => self.rebuild(device, instances),
            TlasAction::TransformUpdate => self.update_transforms(device, instances),
        }
    }

    fn release(&mut self, device: &dyn RayTracingDevice) -> RtResult<()> {
        if self.structure.is_some() {
            device.wait_idle()?;
            self.structure = None;
            self.instance_buffer = None;
            self.epoch += 1;
            log::info!("TLAS released: no live instances");
        }
        self.staged_slots.clear();
        self.clear_flags();
        Ok(())
    }

    fn rebuild(&mut self, device: &dyn RayTracingDevice, instances: &[TlasInput]) -> RtResult<TlasBuildOutcome> {
        let max_instances = device.capabilities().max_instance_count;
        if instances.len() as u64 > max_instances {
            return Err(RtError::ResourceCreation(format!(
                "TLAS over {} instances (device limit {})",
                instances.len(),
                max_instances
            )));
        }

        let records: Vec<RtInstance> = instances
            .iter()
            .map(|input| RtInstance::new(input.transform, input.slot, input.blas_address))
            .collect();
        let instance_count = records.len() as u32;

        // Create instance buffer
        let instance_buffer = device.create_buffer(&BufferDesc {
            size: INSTANCE_SIZE * u64::from(instance_count),
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::CpuToGpu,
            name: "tlas_instances",
        })?;
        instance_buffer.write(0, &records)?;

        let geometry = AccelerationGeometry::Instances {
            instances: &instance_buffer,
            instance_count,
        };
        let sizes = device.acceleration_structure_sizes(&geometry)?;

        // Create and build TLAS
        let mut structure = device.create_acceleration_structure(
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            sizes.structure_size,
            "tlas",
        )?;
        device.build_acceleration_structure(&mut structure, &geometry, BuildMode::Build, sizes.build_scratch_size)?;

        if self.structure.is_some() {
            device.wait_idle()?;
        }
        self.structure = Some(structure);
        self.instance_buffer = Some(instance_buffer);
        self.staged_slots = instances.iter().map(|input| input.slot).collect();
        self.update_scratch_size = sizes.update_scratch_size;
        self.epoch += 1;
        self.clear_flags();

        log::info!("TLAS built with {} instances", instance_count);
        Ok(TlasBuildOutcome::Built { instance_count })
    }

    fn update_transforms(
        &mut self,
        device: &dyn RayTracingDevice,
        instances: &[TlasInput],
    ) -> RtResult<TlasBuildOutcome> {
        let (Some(structure), Some(instance_buffer)) = (self.structure.as_mut(), self.instance_buffer.as_ref()) else {
            return Err(RtError::ResourceCreation("TLAS refit without a built structure".to_string()));
        };
        let instance_count = instances.len() as u32;

        // The structure may be in use by a frame still on the GPU.
        device.wait_idle()?;

        let refit = instances
            .iter()
            .enumerate()
            .try_for_each(|(k, input)| {
                instance_buffer.write(k as u64 * INSTANCE_SIZE, std::slice::from_ref(&input.transform))
            })
            .and_then(|()| {
                let geometry = AccelerationGeometry::Instances {
                    instances: instance_buffer,
                    instance_count,
                };
                device.build_acceleration_structure(structure, &geometry, BuildMode::Update, self.update_scratch_size)
            });

        if let Err(err) = refit {
            self.structure = None;
            self.instance_buffer = None;
            self.staged_slots.clear();
            self.epoch += 1;
            self.needs_full_rebuild = true;
            return Err(err);
        }

        self.clear_flags();
        log::debug!("TLAS refit: {} instance transforms", instance_count);
        Ok(TlasBuildOutcome::Updated { instance_count })
    }

    fn clear_flags(&mut self) {
        self.needs_full_rebuild = false;
        self.needs_transform_update = false;
    }
}
