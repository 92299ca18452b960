//! Error types for the ray-tracing core.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;
use vkrt_common::ConfigError;

/// Coarse classification a host uses to decide what to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A device buffer, image, structure or descriptor could not be created.
    ResourceCreation,
    /// The request was rejected before touching the device.
    Configuration,
    /// The device reported a failure while executing work.
    Device,
}

#[derive(Error, Debug)]
pub enum RtError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{operation} failed: {result}")]
    Vulkan {
        operation: &'static str,
        result: vk::Result,
    },

    #[error("memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("failed to create {0}")]
    ResourceCreation(String),

    #[error("descriptor pool exhausted")]
    DescriptorPoolExhausted,

    #[error("unsupported render target pixel format {0}")]
    UnsupportedPixelFormat(i32),

    #[error("render target extent {width}x{height} is empty")]
    EmptyExtent { width: u32, height: u32 },

    #[error("device does not support ray tracing: {0}")]
    UnsupportedDevice(String),

    #[error("mesh pool is full ({max} meshes)")]
    MeshCapacityExceeded { max: u32 },

    #[error("no mesh at pool index {0}")]
    UnknownMesh(u32),

    #[error("no instance at pool index {0}")]
    UnknownInstance(u32),

    #[error("instance {instance} references mesh slot {mesh} which was recycled")]
    StaleGeometry { instance: u32, mesh: u32 },

    #[error("failed to load shader {path}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write of {len} bytes at offset {offset} overflows a {size}-byte buffer")]
    BufferOverflow { offset: u64, len: u64, size: u64 },

    #[error("one-shot submission did not complete within {0:?}")]
    FenceTimeout(std::time::Duration),
}

pub type RtResult<T> = Result<T, RtError>;

impl RtError {
    pub fn vulkan(operation: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                RtError::DescriptorPoolExhausted
            }
            result => RtError::Vulkan { operation, result },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RtError::Config(_)
            | RtError::UnsupportedPixelFormat(_)
            | RtError::EmptyExtent { .. }
            | RtError::UnsupportedDevice(_)
            | RtError::MeshCapacityExceeded { .. }
            | RtError::UnknownMesh(_)
            | RtError::UnknownInstance(_)
            | RtError::StaleGeometry { .. }
            | RtError::ShaderLoad { .. }
            | RtError::BufferOverflow { .. } => ErrorKind::Configuration,
            RtError::Allocation(_)
            | RtError::ResourceCreation(_)
            | RtError::DescriptorPoolExhausted => ErrorKind::ResourceCreation,
            RtError::Vulkan { result, .. } => match *result {
                vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                    ErrorKind::ResourceCreation
                }
                _ => ErrorKind::Device,
            },
            RtError::FenceTimeout(_) => ErrorKind::Device,
        }
    }
}
