//! Rejections raised at the call boundary, before any device work.

use thiserror::Error;

/// Input or configuration that cannot be accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("index count {0} is not a multiple of 3")]
    IndexCountNotTriangles(usize),

    #[error("mesh has no vertices or no triangles")]
    EmptyMesh,

    #[error("{attribute} has {actual} components, expected {expected}")]
    AttributeLength {
        attribute: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("index {index} is out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },

    #[error("transform has {0} elements, expected 12 or 16")]
    TransformLength(usize),

    #[error("{0} must be greater than zero")]
    ZeroLimit(&'static str),

    #[error("shader folder is empty")]
    EmptyShaderFolder,
}
