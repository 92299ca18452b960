//! Row-major 3x4 affine transform, the layout acceleration-structure
//! instances expect.

use bytemuck::{Pod, Zeroable};

use crate::error::ConfigError;

/// Affine object-to-world transform stored as three rows of four.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Transform3x4 {
    pub rows: [[f32; 4]; 3],
}

impl Default for Transform3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform3x4 {
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Accepts either a column-major 4x4 matrix (16 floats) or a row-major
    /// 3x4 matrix (12 floats).
    pub fn from_slice(values: &[f32]) -> Result<Self, ConfigError> {
        if let Ok(matrix) = <&[f32; 16]>::try_from(values) {
            return Ok(Self::from_column_major_4x4(matrix));
        }
        if let Ok(matrix) = <&[f32; 12]>::try_from(values) {
            return Ok(Self::from_row_major_3x4(matrix));
        }
        Err(ConfigError::TransformLength(values.len()))
    }

    /// Drops the projective bottom row.
    pub fn from_column_major_4x4(m: &[f32; 16]) -> Self {
        let mut rows = [[0.0; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = m[c * 4 + r];
            }
        }
        Self { rows }
    }

    pub fn from_row_major_3x4(m: &[f32; 12]) -> Self {
        Self {
            rows: [
                [m[0], m[1], m[2], m[3]],
                [m[4], m[5], m[6], m[7]],
                [m[8], m[9], m[10], m[11]],
            ],
        }
    }

    pub fn from_translation(t: [f32; 3]) -> Self {
        let mut out = Self::IDENTITY;
        out.rows[0][3] = t[0];
        out.rows[1][3] = t[1];
        out.rows[2][3] = t[2];
        out
    }

    pub fn translation(&self) -> [f32; 3] {
        [self.rows[0][3], self.rows[1][3], self.rows[2][3]]
    }
}
