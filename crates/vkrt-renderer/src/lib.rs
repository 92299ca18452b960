//! Vulkan GPU ray tracing core for embedding in a host engine.
//!
//! The host registers meshes and places instances of them, builds the
//! top-level acceleration structure, gives each camera a render target and
//! then asks for one trace per camera per frame. Everything lives in a
//! [`RayTracer`] owned by the host integration layer.

// Backend seam and its implementations
pub mod device;
pub mod dummy;
pub mod vulkan;

pub mod descriptors;
pub mod error;
pub mod events;
pub mod host;
pub mod ray_tracer;
pub mod raytracing;
pub mod render_target;
pub mod resources;
pub mod scene;

pub use device::{RayTracingDevice, RtCapabilities};
pub use dummy::DummyDevice;
pub use error::{ErrorKind, RtError, RtResult};
pub use events::RenderEvent;
pub use host::{HostGraphics, HostTexture, HostTextureHandle, HostVulkan};
pub use ray_tracer::{NotReady, RayTracer, TraceOutcome};
pub use raytracing::{PipelineState, TlasBuildOutcome};
pub use render_target::HOST_FORMAT_RGBA32;
pub use vulkan::VulkanDevice;

pub use vkrt_common::{
    ConfigError, MeshData, RayTracerConfig, ShaderCameraParam, ShaderSceneParam, ShaderSet, Transform3x4,
};
