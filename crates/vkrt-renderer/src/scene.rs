//! Pool entries: per-mesh geometry and per-object instances.

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::MemoryLocation;
use vkrt_common::{MeshData, PoolHandle, Transform3x4};

use crate::device::{BufferDesc, RayTracingDevice};
use crate::error::RtResult;
use crate::raytracing::acceleration::build_blas;
use crate::resources::{GpuAccelerationStructure, GpuBuffer};

/// Create a host-visible buffer holding `data`.
pub(crate) fn upload<T: Pod>(
    device: &dyn RayTracingDevice,
    data: &[T],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> RtResult<GpuBuffer> {
    let buffer = device.create_buffer(&BufferDesc {
        size: std::mem::size_of_val(data) as vk::DeviceSize,
        usage,
        location: MemoryLocation::CpuToGpu,
        name,
    })?;
    buffer.write(0, data)?;
    Ok(buffer)
}

/// Immutable GPU copy of one shared mesh and its BLAS.
pub struct GeometryRecord {
    vertex_count: u32,
    triangle_count: u32,
    // Dropped before the buffers it was built from.
    blas: GpuAccelerationStructure,
    vertices: GpuBuffer,
    indices: GpuBuffer,
    attributes: GpuBuffer,
    faces: GpuBuffer,
}

impl GeometryRecord {
    /// Upload the mesh and build its BLAS. Every buffer created before a
    /// failure is released on return.
    pub fn new(device: &dyn RayTracingDevice, mesh: &MeshData<'_>) -> RtResult<Self> {
        mesh.validate()?;

        let build_input = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::STORAGE_BUFFER;

        let vertices = upload(device, mesh.vertices, build_input, "mesh_vertices")?;
        let indices = upload(device, mesh.indices, build_input, "mesh_indices")?;
        let attributes = upload(
            device,
            &mesh.attributes(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "mesh_attributes",
        )?;
        let faces = upload(device, &mesh.faces(), vk::BufferUsageFlags::STORAGE_BUFFER, "mesh_faces")?;

        let vertex_count = mesh.vertex_count() as u32;
        let triangle_count = mesh.triangle_count() as u32;
        let blas = build_blas(device, &vertices, vertex_count, &indices, triangle_count)?;

        Ok(Self {
            vertex_count,
            triangle_count,
            blas,
            vertices,
            indices,
            attributes,
            faces,
        })
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn blas(&self) -> &GpuAccelerationStructure {
        &self.blas
    }

    pub fn vertex_buffer(&self) -> &GpuBuffer {
        &self.vertices
    }

    pub fn index_buffer(&self) -> &GpuBuffer {
        &self.indices
    }

    pub fn attribute_buffer(&self) -> &GpuBuffer {
        &self.attributes
    }

    pub fn face_buffer(&self) -> &GpuBuffer {
        &self.faces
    }
}

/// One placed object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    /// Geometry the instance draws, checked against slot reuse.
    pub mesh: PoolHandle,
    pub transform: Transform3x4,
}
