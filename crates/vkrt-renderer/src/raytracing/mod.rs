//! Ray tracing support via Vulkan KHR extensions.
//!
//! This module provides acceleration structure builds (BLAS/TLAS), the
//! shader binding table, and the ray tracing pipeline lifecycle.

pub mod acceleration;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{RtInstance, TlasAction, TlasBuildOutcome, TlasBuilder, TlasInput};
pub use pipeline::{PipelineState, RayTracingPipelineState, ShaderGroup, ShaderStage};
pub use sbt::{SbtLayout, SbtRegions, ShaderBindingTable};
