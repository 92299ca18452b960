//! Shader Binding Table (SBT) layout and storage.
//!
//! Pipeline groups are created in the order raygen, hit groups, miss groups.
//! The table places them as three regions, raygen then miss then hit, each
//! starting on the device's shader-group base alignment. The callable region
//! is always empty.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::device::{BufferDesc, RayTracingDevice, RtCapabilities};
use crate::error::{RtError, RtResult};
use crate::resources::GpuBuffer;

pub const RAYGEN_GROUP_COUNT: u32 = 1;
/// Primary and shadow closest-hit groups.
pub const HIT_GROUP_COUNT: u32 = 2;
/// Primary and shadow miss groups.
pub const MISS_GROUP_COUNT: u32 = 2;
pub const GROUP_COUNT: u32 = RAYGEN_GROUP_COUNT + HIT_GROUP_COUNT + MISS_GROUP_COUNT;

/// Align a value up to the given power-of-two alignment.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// One region of the table, relative to the table start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegion {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
    /// Index of the first pipeline group stored in this region.
    pub first_group: u32,
    pub count: u32,
}

impl SbtRegion {
    fn strided(&self, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Offsets and strides of the table for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    pub handle_stride: u64,
    pub base_alignment: u64,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub total_size: u64,
}

impl SbtLayout {
    pub fn new(capabilities: &RtCapabilities) -> Self {
        let handle_size = u64::from(capabilities.shader_group_handle_size);
        let base_alignment = u64::from(capabilities.shader_group_base_alignment);
        let handle_stride = align_up(handle_size, u64::from(capabilities.shader_group_handle_alignment));

        // The raygen region's stride must equal its size.
        let raygen_size = align_up(handle_stride * u64::from(RAYGEN_GROUP_COUNT), base_alignment);
        let raygen = SbtRegion {
            offset: 0,
            stride: raygen_size,
            size: raygen_size,
            first_group: 0,
            count: RAYGEN_GROUP_COUNT,
        };

        let miss = SbtRegion {
            offset: raygen.offset + raygen.size,
            stride: handle_stride,
            size: align_up(handle_stride * u64::from(MISS_GROUP_COUNT), base_alignment),
            first_group: RAYGEN_GROUP_COUNT + HIT_GROUP_COUNT,
            count: MISS_GROUP_COUNT,
        };

        let hit = SbtRegion {
            offset: miss.offset + miss.size,
            stride: handle_stride,
            size: align_up(handle_stride * u64::from(HIT_GROUP_COUNT), base_alignment),
            first_group: RAYGEN_GROUP_COUNT,
            count: HIT_GROUP_COUNT,
        };

        Self {
            handle_size,
            handle_stride,
            base_alignment,
            raygen,
            miss,
            hit,
            total_size: hit.offset + hit.size,
        }
    }

    /// Lay the packed group handles out into table bytes.
    pub fn table_bytes(&self, handles: &[u8]) -> RtResult<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let expected = handle_size * GROUP_COUNT as usize;
        if handles.len() < expected {
            return Err(RtError::ResourceCreation(format!(
                "shader binding table from {} handle bytes, {} needed",
                handles.len(),
                expected
            )));
        }

        let mut table = vec![0u8; self.total_size as usize];
        for region in [self.raygen, self.miss, self.hit] {
            for i in 0..region.count {
                let group = (region.first_group + i) as usize;
                let src = &handles[group * handle_size..(group + 1) * handle_size];
                let dst = (region.offset + u64::from(i) * self.handle_stride) as usize;
                table[dst..dst + handle_size].copy_from_slice(src);
            }
        }
        Ok(table)
    }
}

/// Device address regions consumed by the trace-rays call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Shader Binding Table for the ray tracing pipeline.
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    layout: SbtLayout,
    regions: SbtRegions,
}

impl ShaderBindingTable {
    /// Fetch the group handles of `pipeline` and upload them.
    pub fn new(device: &dyn RayTracingDevice, pipeline: vk::Pipeline) -> RtResult<Self> {
        let layout = SbtLayout::new(device.capabilities());
        let handles = device.shader_group_handles(pipeline, GROUP_COUNT)?;
        let table = layout.table_bytes(&handles)?;

        // Padded so the start can be moved up to the base alignment.
        let buffer = device.create_buffer(&BufferDesc {
            size: layout.total_size + layout.base_alignment,
            usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            location: MemoryLocation::CpuToGpu,
            name: "shader_binding_table",
        })?;

        let raw_address = buffer
            .device_address()
            .ok_or_else(|| RtError::ResourceCreation("shader binding table device address".to_string()))?;
        let base_address = align_up(raw_address, layout.base_alignment);
        buffer.write(base_address - raw_address, &table)?;

        let regions = SbtRegions {
            raygen: layout.raygen.strided(base_address),
            miss: layout.miss.strided(base_address),
            hit: layout.hit.strided(base_address),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        };

        Ok(Self {
            buffer,
            layout,
            regions,
        })
    }

    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}
