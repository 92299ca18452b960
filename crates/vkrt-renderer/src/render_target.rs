//! Per-camera output image, camera uniform and descriptor sets.

use ash::vk;
use vkrt_common::ShaderCameraParam;

use crate::descriptors::{DescriptorBindingManager, DescriptorSets};
use crate::device::{ImageDesc, RayTracingDevice};
use crate::error::{RtError, RtResult};
use crate::host::HostTextureHandle;
use crate::resources::{GpuBuffer, GpuImage};
use crate::scene::upload;

/// Host texture format id for 8-bit RGBA.
pub const HOST_FORMAT_RGBA32: i32 = 4;

/// Storage image format for a host texture format id.
pub fn storage_format(host_format: i32) -> RtResult<vk::Format> {
    match host_format {
        HOST_FORMAT_RGBA32 => Ok(vk::Format::R8G8B8A8_UNORM),
        other => Err(RtError::UnsupportedPixelFormat(other)),
    }
}

/// What a target's descriptor sets were last written against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingStamp {
    pub mesh_capacity: u32,
    pub mesh_epoch: u64,
    pub tlas_epoch: u64,
}

pub struct RenderTarget {
    image: GpuImage,
    host_format: i32,
    texture: HostTextureHandle,
    camera: Option<GpuBuffer>,
    sets: Option<DescriptorSets>,
    allocated_capacity: u32,
    written: Option<BindingStamp>,
}

impl RenderTarget {
    pub fn new(
        device: &dyn RayTracingDevice,
        host_format: i32,
        width: u32,
        height: u32,
        texture: HostTextureHandle,
    ) -> RtResult<Self> {
        let format = storage_format(host_format)?;
        if width == 0 || height == 0 {
            return Err(RtError::EmptyExtent { width, height });
        }

        let image = device.create_storage_image(&ImageDesc {
            extent: vk::Extent2D { width, height },
            format,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            name: "render_target",
        })?;

        Ok(Self {
            image,
            host_format,
            texture,
            camera: None,
            sets: None,
            allocated_capacity: 0,
            written: None,
        })
    }

    /// Whether a request for these parameters can keep this target.
    pub fn matches(&self, host_format: i32, width: u32, height: u32, texture: HostTextureHandle) -> bool {
        let extent = self.image.extent();
        self.host_format == host_format
            && extent.width == width
            && extent.height == height
            && self.texture == texture
    }

    pub fn image(&self) -> &GpuImage {
        &self.image
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent()
    }

    pub fn texture(&self) -> HostTextureHandle {
        self.texture
    }

    /// Camera uniform, present once camera data has been uploaded.
    pub fn camera(&self) -> Option<&GpuBuffer> {
        self.camera.as_ref()
    }

    pub fn upload_camera(&mut self, device: &dyn RayTracingDevice, param: &ShaderCameraParam) -> RtResult<()> {
        match &self.camera {
            Some(buffer) => buffer.write(0, std::slice::from_ref(param)),
            None => {
                let buffer = upload(
                    device,
                    std::slice::from_ref(param),
                    vk::BufferUsageFlags::UNIFORM_BUFFER,
                    "camera_uniform",
                )?;
                self.camera = Some(buffer);
                // The binding now points somewhere new.
                self.written = None;
                Ok(())
            }
        }
    }

    pub fn descriptor_sets(&self) -> Option<&DescriptorSets> {
        self.sets.as_ref()
    }

    /// Allocate sets sized for `mesh_capacity`, reallocating if the pool
    /// has grown since the last allocation.
    pub fn ensure_descriptor_sets(
        &mut self,
        device: &dyn RayTracingDevice,
        manager: &DescriptorBindingManager,
        mesh_capacity: u32,
    ) -> RtResult<DescriptorSets> {
        if let Some(sets) = self.sets {
            if self.allocated_capacity == mesh_capacity {
                return Ok(sets);
            }
            self.release_descriptor_sets(device, manager);
        }

        let sets = manager.allocate(device, mesh_capacity)?;
        log::debug!("Descriptor sets allocated for {} mesh slots", mesh_capacity);
        self.sets = Some(sets);
        self.allocated_capacity = mesh_capacity;
        self.written = None;
        Ok(sets)
    }

    /// Whether the sets must be rewritten before the next dispatch.
    pub fn descriptors_dirty(&self, stamp: BindingStamp) -> bool {
        self.written != Some(stamp)
    }

    pub fn mark_descriptors_written(&mut self, stamp: BindingStamp) {
        self.written = Some(stamp);
    }

    pub fn release_descriptor_sets(&mut self, device: &dyn RayTracingDevice, manager: &DescriptorBindingManager) {
        if let Some(sets) = self.sets.take() {
            manager.free(device, &sets);
        }
        self.allocated_capacity = 0;
        self.written = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyDevice;
    use rstest::rstest;
    use vkrt_common::RayTracerConfig;

    const STAMP: BindingStamp = BindingStamp {
        mesh_capacity: 1,
        mesh_epoch: 1,
        tlas_epoch: 1,
    };

    #[rstest]
    #[case::rgba32(4, true)]
    #[case::argb32(0, false)]
    #[case::rgba_half(17, false)]
    #[case::negative(-1, false)]
    fn test_storage_format(#[case] host_format: i32, #[case] supported: bool) {
        match storage_format(host_format) {
            Ok(format) => {
                assert!(supported);
                assert_eq!(format, vk::Format::R8G8B8A8_UNORM);
            }
            Err(err) => {
                assert!(!supported);
                assert!(matches!(err, RtError::UnsupportedPixelFormat(f) if f == host_format));
            }
        }
    }

    #[test]
    fn test_new_rejects_before_touching_device() {
        let device = DummyDevice::new();
        assert!(RenderTarget::new(&device, 0, 64, 64, HostTextureHandle(1)).is_err());
        assert!(matches!(
            RenderTarget::new(&device, 4, 0, 64, HostTextureHandle(1)),
            Err(RtError::EmptyExtent { width: 0, height: 64 })
        ));
        assert_eq!(device.log().images_created, 0);
    }

    #[test]
    fn test_matches() {
        let device = DummyDevice::new();
        let target = RenderTarget::new(&device, 4, 64, 32, HostTextureHandle(1)).unwrap();
        assert!(target.matches(4, 64, 32, HostTextureHandle(1)));
        assert!(!target.matches(4, 64, 64, HostTextureHandle(1)));
        assert!(!target.matches(4, 64, 32, HostTextureHandle(2)));
    }

    #[test]
    fn test_camera_buffer_created_once() {
        let device = DummyDevice::new();
        let mut target = RenderTarget::new(&device, 4, 8, 8, HostTextureHandle(1)).unwrap();
        assert!(target.camera().is_none());

        let param = ShaderCameraParam::new([1.0; 3], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.1, 100.0, 60.0]);
        target.upload_camera(&device, &param).unwrap();
        let raw = target.camera().unwrap().raw();
        target.upload_camera(&device, &param).unwrap();

        assert_eq!(target.camera().unwrap().raw(), raw);
        assert_eq!(device.log().buffers_created, 1);
    }

    #[test]
    fn test_sets_follow_pool_capacity() {
        let device = DummyDevice::new();
        let manager = DescriptorBindingManager::new(&device, &RayTracerConfig::default()).unwrap();
        let mut target = RenderTarget::new(&device, 4, 8, 8, HostTextureHandle(1)).unwrap();

        let first = target.ensure_descriptor_sets(&device, &manager, 1).unwrap();
        target.mark_descriptors_written(STAMP);
        assert_eq!(target.ensure_descriptor_sets(&device, &manager, 1).unwrap(), first);
        assert!(!target.descriptors_dirty(STAMP));

        let grown = target.ensure_descriptor_sets(&device, &manager, 2).unwrap();
        assert_ne!(grown, first);
        assert!(target.descriptors_dirty(STAMP));

        let log = device.log();
        assert_eq!(log.allocations, vec![vec![0, 0, 1, 1], vec![0, 0, 2, 2]]);
        assert_eq!(log.sets_freed, 4);
    }
}
