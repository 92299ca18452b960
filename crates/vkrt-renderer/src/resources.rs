//! Owned GPU resources.
//!
//! Each wrapper releases its device object and its `gpu-allocator`
//! allocation when dropped. Resources created by the dummy backend carry
//! their contents in host memory instead.

use std::sync::Arc;

use ash::khr::acceleration_structure;
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;

use crate::error::{RtError, RtResult};

/// Allocation owned by a Vulkan resource.
pub(crate) struct DeviceMemory {
    pub device: ash::Device,
    pub allocator: Arc<Mutex<Allocator>>,
    pub allocation: Option<Allocation>,
}

impl DeviceMemory {
    fn free(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.allocator.lock().free(allocation) {
                log::error!("Failed to free allocation: {}", err);
            }
        }
    }
}

pub(crate) enum BufferMemory {
    Host(Mutex<Vec<u8>>),
    Device(DeviceMemory),
}

/// Device buffer with its memory.
pub struct GpuBuffer {
    raw: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    device_address: Option<vk::DeviceAddress>,
    memory: BufferMemory,
}

impl GpuBuffer {
    pub(crate) fn new(
        raw: vk::Buffer,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        device_address: Option<vk::DeviceAddress>,
        memory: BufferMemory,
    ) -> Self {
        Self {
            raw,
            size,
            usage,
            device_address,
            memory,
        }
    }

    pub(crate) fn attach_allocation(&mut self, allocation: Allocation) {
        if let BufferMemory::Device(memory) = &mut self.memory {
            memory.allocation = Some(allocation);
        }
    }

    pub(crate) fn set_device_address(&mut self, address: vk::DeviceAddress) {
        self.device_address = Some(address);
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Device address, present only when created with `SHADER_DEVICE_ADDRESS`.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }

    /// Descriptor info covering the whole buffer.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.raw,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    /// Copy `data` into the buffer's host mapping at byte `offset`.
    pub fn write<T: Pod>(&self, offset: vk::DeviceSize, data: &[T]) -> RtResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let end = offset + bytes.len() as vk::DeviceSize;
        if end > self.size {
            return Err(RtError::BufferOverflow {
                offset,
                len: bytes.len() as u64,
                size: self.size,
            });
        }

        match &self.memory {
            BufferMemory::Host(contents) => {
                contents.lock()[offset as usize..end as usize].copy_from_slice(bytes);
                Ok(())
            }
            BufferMemory::Device(memory) => {
                let ptr = memory
                    .allocation
                    .as_ref()
                    .and_then(|allocation| allocation.mapped_ptr())
                    .ok_or_else(|| RtError::ResourceCreation("host mapping of buffer".to_string()))?;
                // SAFETY: the mapping covers `size` bytes and the range was checked above.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bytes.as_ptr(),
                        (ptr.as_ptr() as *mut u8).add(offset as usize),
                        bytes.len(),
                    );
                }
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn contents(&self) -> Vec<u8> {
        match &self.memory {
            BufferMemory::Host(contents) => contents.lock().clone(),
            BufferMemory::Device(_) => Vec::new(),
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let BufferMemory::Device(memory) = &mut self.memory {
            // SAFETY: callers wait for the device before releasing buffers in use.
            unsafe {
                memory.device.destroy_buffer(self.raw, None);
            }
            memory.free();
        }
    }
}

pub(crate) enum ImageMemory {
    Host,
    Device(DeviceMemory),
}

/// 2D storage image with a view.
pub struct GpuImage {
    raw: vk::Image,
    view: vk::ImageView,
    format: vk::Format,
    extent: vk::Extent2D,
    memory: ImageMemory,
}

impl GpuImage {
    pub(crate) fn new(
        raw: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
        memory: ImageMemory,
    ) -> Self {
        Self {
            raw,
            view,
            format,
            extent,
            memory,
        }
    }

    pub fn raw(&self) -> vk::Image {
        self.raw
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Descriptor info for storage-image access in the GENERAL layout.
    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: self.view,
            image_layout: vk::ImageLayout::GENERAL,
        }
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        if let ImageMemory::Device(memory) = &mut self.memory {
            // SAFETY: the image is idle; see `RayTracer::set_render_target`.
            unsafe {
                memory.device.destroy_image_view(self.view, None);
                memory.device.destroy_image(self.raw, None);
            }
            memory.free();
        }
    }
}

/// Acceleration structure with the buffer backing it.
///
/// The device address is only meaningful once a build has completed.
pub struct GpuAccelerationStructure {
    raw: vk::AccelerationStructureKHR,
    ty: vk::AccelerationStructureTypeKHR,
    device_address: Option<vk::DeviceAddress>,
    loader: Option<acceleration_structure::Device>,
    // Dropped after `raw` is destroyed.
    buffer: GpuBuffer,
}

impl GpuAccelerationStructure {
    pub(crate) fn new(
        raw: vk::AccelerationStructureKHR,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: GpuBuffer,
        loader: Option<acceleration_structure::Device>,
    ) -> Self {
        Self {
            raw,
            ty,
            device_address: None,
            loader,
            buffer,
        }
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.raw
    }

    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Device address after the last completed build.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }

    pub(crate) fn set_device_address(&mut self, address: vk::DeviceAddress) {
        self.device_address = Some(address);
    }
}

impl Drop for GpuAccelerationStructure {
    fn drop(&mut self) {
        if let Some(loader) = &self.loader {
            // SAFETY: no pending build or trace references this structure.
            unsafe {
                loader.destroy_acceleration_structure(self.raw, None);
            }
        }
    }
}
