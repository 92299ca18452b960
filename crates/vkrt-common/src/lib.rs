//! GPU-independent building blocks shared by the ray-tracing core.
//!
//! Nothing in this crate touches a device. The renderer crate layers
//! Vulkan resources on top of these types.

pub mod config;
pub mod error;
pub mod mesh;
pub mod pool;
pub mod shader_types;
pub mod transform;

pub use config::{RayTracerConfig, ShaderSet};
pub use error::ConfigError;
pub use mesh::MeshData;
pub use pool::{Insert, PoolHandle, ResourcePool};
pub use shader_types::{ShaderCameraParam, ShaderFace, ShaderSceneParam, ShaderVertexAttribute};
pub use transform::Transform3x4;
