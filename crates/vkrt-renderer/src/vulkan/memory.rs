//! GPU memory management using gpu-allocator.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::device::{BufferDesc, ImageDesc};
use crate::error::{RtError, RtResult};
use crate::host::HostVulkan;
use crate::resources::{BufferMemory, DeviceMemory, GpuBuffer, GpuImage, ImageMemory};

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    pub fn new(host: &HostVulkan) -> RtResult<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: host.instance.clone(),
            device: host.device.clone(),
            physical_device: host.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: host.device.clone(),
        })
    }

    /// Create a buffer; the device address is fetched when the usage asks for it.
    pub fn create_buffer(&self, desc: &BufferDesc<'_>) -> RtResult<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: the device outlives every resource created from it.
        let handle = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|result| RtError::vulkan("create buffer", result))?;

        // From here on the wrapper owns the handle, so an early return frees it.
        let mut buffer = GpuBuffer::new(
            handle,
            desc.size,
            desc.usage,
            None,
            BufferMemory::Device(DeviceMemory {
                device: self.device.clone(),
                allocator: self.allocator.clone(),
                allocation: None,
            }),
        );

        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };
        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        let bind = unsafe {
            self.device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        };
        buffer.attach_allocation(allocation);
        bind.map_err(|result| RtError::vulkan("bind buffer memory", result))?;

        if desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            let address = unsafe { self.device.get_buffer_device_address(&addr_info) };
            buffer.set_device_address(address);
        }

        Ok(buffer)
    }

    /// Create a device-local 2D image and its view.
    pub fn create_image(&self, desc: &ImageDesc<'_>) -> RtResult<GpuImage> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|result| RtError::vulkan("create image", result))?;

        let mut memory = DeviceMemory {
            device: self.device.clone(),
            allocator: self.allocator.clone(),
            allocation: None,
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(handle) };
        let allocated = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(handle, None) };
                return Err(err.into());
            }
        };

        let bind = unsafe {
            self.device
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
        };
        memory.allocation = Some(allocation);

        let view = bind
            .map_err(|result| RtError::vulkan("bind image memory", result))
            .and_then(|()| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(handle)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(desc.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { self.device.create_image_view(&view_info, None) }
                    .map_err(|result| RtError::vulkan("create image view", result))
            });

        // Destroying a null view is a no-op, so the wrapper can own the
        // image even when view creation failed.
        let image = GpuImage::new(
            handle,
            view.as_ref().copied().unwrap_or_else(|_| vk::ImageView::null()),
            desc.format,
            desc.extent,
            ImageMemory::Device(memory),
        );
        view.map(|_| image)
    }
}
