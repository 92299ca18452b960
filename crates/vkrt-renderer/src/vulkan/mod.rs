//! Vulkan backend built on a host-created device.
//!
//! The host owns the instance and device. This module adds the allocator,
//! a one-shot submission queue and the ray-tracing extension loaders on top.

pub mod commands;
pub mod context;
pub mod device;
pub mod memory;

pub use commands::OneShotSubmitter;
pub use context::{graphics_queue_family, REQUIRED_DEVICE_EXTENSIONS};
pub use device::VulkanDevice;
pub use memory::MemoryManager;
