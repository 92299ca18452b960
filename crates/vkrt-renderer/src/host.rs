//! What the host engine hands to the ray tracer.

use ash::vk;

/// Host-created Vulkan objects the backend is built on. The host keeps
/// ownership; the ray tracer never destroys them.
#[derive(Clone)]
pub struct HostVulkan {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
}

/// Opaque host texture reference passed to `set_render_target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostTextureHandle(pub u64);

/// A host texture resolved for use as a copy destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTexture {
    pub image: vk::Image,
    /// Layout the texture is in outside of the copy, restored afterwards.
    pub layout: vk::ImageLayout,
    pub extent: vk::Extent2D,
}

/// Per-frame services the host provides while the ray tracer records.
pub trait HostGraphics {
    /// Command buffer currently being recorded for this frame, if any.
    fn recording_command_buffer(&self) -> Option<vk::CommandBuffer>;

    /// Resolve a host texture handle to a native image.
    fn access_texture(&self, handle: HostTextureHandle) -> Option<HostTexture>;
}
