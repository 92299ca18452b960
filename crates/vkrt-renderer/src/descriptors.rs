//! Descriptor set layouts, pool and per-target write plans.
//!
//! Four sets are bound for every dispatch:
//!
//! | Set | Binding | Contents |
//! |-----|---------|----------|
//! | 0   | 0       | top-level acceleration structure |
//! | 0   | 1       | scene uniform |
//! | 0   | 2       | camera uniform |
//! | 1   | 0       | output storage image |
//! | 2   | 0       | per-mesh vertex attribute buffers (variable count) |
//! | 3   | 0       | per-mesh face buffers (variable count) |
//!
//! The variable-count arrays are declared with `max_meshes` entries in the
//! layout and allocated with the mesh pool's capacity, so a target's sets
//! are reallocated whenever the pool grows.

use ash::vk;
use vkrt_common::RayTracerConfig;

use crate::device::RayTracingDevice;
use crate::error::{RtError, RtResult};

pub const SET_COUNT: usize = 4;

/// One target's bound sets, indexed by [`DescriptorSetSlot`].
pub type DescriptorSets = [vk::DescriptorSet; SET_COUNT];

/// Descriptor set indices as seen by the shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorSetSlot {
    /// Set 0: acceleration structure, scene and camera uniforms
    Scene = 0,
    /// Set 1: output image
    Output = 1,
    /// Set 2: vertex attribute array
    Attributes = 2,
    /// Set 3: face array
    Faces = 3,
}

/// Layout binding as the backend should create it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array size; the upper bound when `variable_count` is set.
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    /// Variable-count, partially bound array.
    pub variable_count: bool,
}

impl LayoutBinding {
    fn single(binding: u32, descriptor_type: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            descriptor_type,
            count: 1,
            stages,
            variable_count: false,
        }
    }

    fn variable_array(descriptor_type: vk::DescriptorType, max_count: u32, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding: 0,
            descriptor_type,
            count: max_count,
            stages,
            variable_count: true,
        }
    }
}

/// Resource written into one binding.
#[derive(Debug, Clone)]
pub enum DescriptorResource {
    AccelerationStructure(vk::AccelerationStructureKHR),
    UniformBuffer(vk::DescriptorBufferInfo),
    StorageImage(vk::DescriptorImageInfo),
    /// Consecutive array elements starting at the write's `first_element`.
    StorageBuffers(Vec<vk::DescriptorBufferInfo>),
}

impl DescriptorResource {
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorResource::AccelerationStructure(_) => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            DescriptorResource::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorResource::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorResource::StorageBuffers(_) => vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    pub fn descriptor_count(&self) -> u32 {
        match self {
            DescriptorResource::StorageBuffers(infos) => infos.len() as u32,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub first_element: u32,
    pub resource: DescriptorResource,
}

/// Snapshot of everything a target's sets point at.
#[derive(Debug, Clone)]
pub struct BindingSources {
    pub tlas: vk::AccelerationStructureKHR,
    pub scene: vk::DescriptorBufferInfo,
    pub camera: vk::DescriptorBufferInfo,
    pub output: vk::DescriptorImageInfo,
    /// One entry per allocated mesh slot, `None` where the slot is free.
    pub attributes: Vec<Option<vk::DescriptorBufferInfo>>,
    pub faces: Vec<Option<vk::DescriptorBufferInfo>>,
}

/// Split a slot array into runs of consecutive present entries.
///
/// Returns `(first_slot, infos)` per run. Free slots are skipped and never
/// written.
pub fn contiguous_runs<T: Copy>(slots: &[Option<T>]) -> Vec<(u32, Vec<T>)> {
    let mut runs: Vec<(u32, Vec<T>)> = Vec::new();
    let mut current: Option<(u32, Vec<T>)> = None;

    for (index, slot) in slots.iter().enumerate() {
        match (slot, current.as_mut()) {
            (Some(info), Some((_, run))) => run.push(*info),
            (Some(info), None) => current = Some((index as u32, vec![*info])),
            (None, _) => runs.extend(current.take()),
        }
    }
    runs.extend(current);
    runs
}

/// Build the batched write list for one target's sets.
pub fn plan_writes(sets: &DescriptorSets, sources: &BindingSources) -> Vec<DescriptorWrite> {
    let scene_set = sets[DescriptorSetSlot::Scene as usize];
    let mut writes = vec![
        DescriptorWrite {
            set: scene_set,
            binding: 0,
            first_element: 0,
            resource: DescriptorResource::AccelerationStructure(sources.tlas),
        },
        DescriptorWrite {
            set: scene_set,
            binding: 1,
            first_element: 0,
            resource: DescriptorResource::UniformBuffer(sources.scene),
        },
        DescriptorWrite {
            set: scene_set,
            binding: 2,
            first_element: 0,
            resource: DescriptorResource::UniformBuffer(sources.camera),
        },
        DescriptorWrite {
            set: sets[DescriptorSetSlot::Output as usize],
            binding: 0,
            first_element: 0,
            resource: DescriptorResource::StorageImage(sources.output),
        },
    ];

    let arrays = [
        (DescriptorSetSlot::Attributes, &sources.attributes),
        (DescriptorSetSlot::Faces, &sources.faces),
    ];
    for (slot, infos) in arrays {
        for (first_element, run) in contiguous_runs(infos) {
            writes.push(DescriptorWrite {
                set: sets[slot as usize],
                binding: 0,
                first_element,
                resource: DescriptorResource::StorageBuffers(run),
            });
        }
    }

    writes
}

/// Owns the four set layouts and the descriptor pool.
pub struct DescriptorBindingManager {
    layouts: DescriptorSetLayouts,
    pool: vk::DescriptorPool,
    max_meshes: u32,
}

type DescriptorSetLayouts = [vk::DescriptorSetLayout; SET_COUNT];

impl DescriptorBindingManager {
    /// Bindings of each set, in set order.
    pub fn layout_bindings(max_meshes: u32) -> [Vec<LayoutBinding>; SET_COUNT] {
        let raygen_and_hit = vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR;
        [
            vec![
                LayoutBinding::single(0, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, raygen_and_hit),
                LayoutBinding::single(1, vk::DescriptorType::UNIFORM_BUFFER, raygen_and_hit),
                LayoutBinding::single(2, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::RAYGEN_KHR),
            ],
            vec![LayoutBinding::single(
                0,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ShaderStageFlags::RAYGEN_KHR,
            )],
            vec![LayoutBinding::variable_array(
                vk::DescriptorType::STORAGE_BUFFER,
                max_meshes,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )],
            vec![LayoutBinding::variable_array(
                vk::DescriptorType::STORAGE_BUFFER,
                max_meshes,
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )],
        ]
    }

    /// Pool sizes for `max_render_targets` full sets of four.
    pub fn pool_sizes(max_meshes: u32, max_render_targets: u32) -> Vec<vk::DescriptorPoolSize> {
        let size = |ty, per_target: u32| vk::DescriptorPoolSize {
            ty,
            descriptor_count: per_target * max_render_targets,
        };
        vec![
            size(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 1),
            size(vk::DescriptorType::STORAGE_IMAGE, 1),
            size(vk::DescriptorType::UNIFORM_BUFFER, 2),
            size(vk::DescriptorType::STORAGE_BUFFER, 2 * max_meshes),
        ]
    }

    pub fn new(device: &dyn RayTracingDevice, config: &RayTracerConfig) -> RtResult<Self> {
        let mut layouts: Vec<vk::DescriptorSetLayout> = Vec::with_capacity(SET_COUNT);

        let created = Self::layout_bindings(config.max_meshes)
            .iter()
            .try_for_each(|bindings| {
                layouts.push(device.create_descriptor_set_layout(bindings)?);
                Ok::<(), RtError>(())
            })
            .and_then(|()| {
                device.create_descriptor_pool(
                    &Self::pool_sizes(config.max_meshes, config.max_render_targets),
                    SET_COUNT as u32 * config.max_render_targets,
                )
            });

        let pool = match created {
            Ok(pool) => pool,
            Err(err) => {
                for layout in layouts {
                    device.destroy_descriptor_set_layout(layout);
                }
                return Err(err);
            }
        };

        let layouts: DescriptorSetLayouts = [layouts[0], layouts[1], layouts[2], layouts[3]];
        log::info!(
            "Descriptor layouts created (max {} meshes, {} targets)",
            config.max_meshes,
            config.max_render_targets
        );

        Ok(Self {
            layouts,
            pool,
            max_meshes: config.max_meshes,
        })
    }

    pub fn layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.layouts
    }

    pub fn max_meshes(&self) -> u32 {
        self.max_meshes
    }

    /// Allocate a target's sets with array bindings sized to `mesh_capacity`.
    pub fn allocate(&self, device: &dyn RayTracingDevice, mesh_capacity: u32) -> RtResult<DescriptorSets> {
        if mesh_capacity > self.max_meshes {
            return Err(RtError::MeshCapacityExceeded { max: self.max_meshes });
        }

        let variable_counts = [0, 0, mesh_capacity, mesh_capacity];
        let sets = device.allocate_descriptor_sets(self.pool, &self.layouts, &variable_counts)?;
        match sets.as_slice() {
            &[scene, output, attributes, faces] => Ok([scene, output, attributes, faces]),
            _ => {
                device.free_descriptor_sets(self.pool, &sets);
                Err(RtError::ResourceCreation("descriptor sets".to_string()))
            }
        }
    }

    pub fn free(&self, device: &dyn RayTracingDevice, sets: &DescriptorSets) {
        device.free_descriptor_sets(self.pool, sets);
    }

    /// Destroy the pool, which frees every set allocated from it, then the layouts.
    pub fn destroy(&mut self, device: &dyn RayTracingDevice) {
        device.destroy_descriptor_pool(self.pool);
        self.pool = vk::DescriptorPool::null();
        for layout in &mut self.layouts {
            device.destroy_descriptor_set_layout(*layout);
            *layout = vk::DescriptorSetLayout::null();
        }
    }
}
