//! Data layouts shared with the ray-tracing shaders.
//!
//! Uniform blocks follow std140, so every `vec3` is widened to 16 bytes.
//! Storage arrays follow std430.

use bytemuck::{Pod, Zeroable};

/// Per-vertex shading attributes read by the closest-hit shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ShaderVertexAttribute {
    /// Object-space normal.
    pub normal: [f32; 3],
    pub _pad0: f32,
    /// Texture coordinate.
    pub uv: [f32; 2],
    pub _pad1: [f32; 2],
}

impl ShaderVertexAttribute {
    pub fn new(normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            normal,
            uv,
            ..Default::default()
        }
    }
}

/// Vertex indices of one triangle.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShaderFace {
    pub index0: u32,
    pub index1: u32,
    pub index2: u32,
}

/// Camera uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ShaderCameraParam {
    /// World-space eye position.
    pub cam_pos: [f32; 4],
    /// Forward direction.
    pub cam_dir: [f32; 4],
    /// Up direction.
    pub cam_up: [f32; 4],
    /// Right direction.
    pub cam_side: [f32; 4],
    /// Near plane, far plane, vertical field of view.
    pub cam_near_far_fov: [f32; 4],
}

impl ShaderCameraParam {
    pub fn new(
        position: [f32; 3],
        direction: [f32; 3],
        up: [f32; 3],
        side: [f32; 3],
        near_far_fov: [f32; 3],
    ) -> Self {
        Self {
            cam_pos: widen(position),
            cam_dir: widen(direction),
            cam_up: widen(up),
            cam_side: widen(side),
            cam_near_far_fov: widen(near_far_fov),
        }
    }
}

/// Scene-wide uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ShaderSceneParam {
    /// Ambient light colour, RGBA.
    pub ambient: [f32; 4],
}

fn widen(v: [f32; 3]) -> [f32; 4] {
    [v[0], v[1], v[2], 0.0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<ShaderVertexAttribute>(), 32);
        assert_eq!(std::mem::size_of::<ShaderFace>(), 12);
        assert_eq!(std::mem::size_of::<ShaderCameraParam>(), 80);
        assert_eq!(std::mem::size_of::<ShaderSceneParam>(), 16);
    }

    #[test]
    fn test_camera_param_widening() {
        let param = ShaderCameraParam::new(
            [1.0, 2.0, 3.0],
            [0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.1, 100.0, 60.0],
        );
        assert_eq!(param.cam_pos, [1.0, 2.0, 3.0, 0.0]);
        assert_eq!(param.cam_near_far_fov, [0.1, 100.0, 60.0, 0.0]);
    }
}
