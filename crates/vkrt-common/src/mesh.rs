//! Host mesh input and the shader-side arrays derived from it.

use crate::error::ConfigError;
use crate::shader_types::{ShaderFace, ShaderVertexAttribute};

/// Borrowed mesh arrays as the host hands them over.
///
/// `vertices` and `normals` hold three floats per vertex, `uvs` two, and
/// `indices` three per triangle.
#[derive(Debug, Clone, Copy)]
pub struct MeshData<'a> {
    pub vertices: &'a [f32],
    pub normals: &'a [f32],
    pub uvs: &'a [f32],
    pub indices: &'a [u32],
}

impl<'a> MeshData<'a> {
    pub fn new(vertices: &'a [f32], normals: &'a [f32], uvs: &'a [f32], indices: &'a [u32]) -> Self {
        Self {
            vertices,
            normals,
            uvs,
            indices,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Reject anything that is not an indexed triangle list with matching
    /// attribute arrays.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.indices.len() % 3 != 0 {
            return Err(ConfigError::IndexCountNotTriangles(self.indices.len()));
        }
        if self.vertices.len() % 3 != 0 {
            return Err(ConfigError::AttributeLength {
                attribute: "vertices",
                expected: self.vertex_count() * 3,
                actual: self.vertices.len(),
            });
        }

        let vertex_count = self.vertex_count();
        if vertex_count == 0 || self.indices.is_empty() {
            return Err(ConfigError::EmptyMesh);
        }
        if self.normals.len() != vertex_count * 3 {
            return Err(ConfigError::AttributeLength {
                attribute: "normals",
                expected: vertex_count * 3,
                actual: self.normals.len(),
            });
        }
        if self.uvs.len() != vertex_count * 2 {
            return Err(ConfigError::AttributeLength {
                attribute: "uvs",
                expected: vertex_count * 2,
                actual: self.uvs.len(),
            });
        }
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(ConfigError::IndexOutOfRange {
                index,
                vertex_count,
            });
        }
        Ok(())
    }

    /// Interleave normals and uvs per vertex.
    pub fn attributes(&self) -> Vec<ShaderVertexAttribute> {
        self.normals
            .chunks_exact(3)
            .zip(self.uvs.chunks_exact(2))
            .map(|(n, uv)| ShaderVertexAttribute::new([n[0], n[1], n[2]], [uv[0], uv[1]]))
            .collect()
    }

    pub fn faces(&self) -> Vec<ShaderFace> {
        self.indices
            .chunks_exact(3)
            .map(|tri| ShaderFace {
                index0: tri[0],
                index1: tri[1],
                index2: tri[2],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTICES: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    const NORMALS: [f32; 9] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    const UVS: [f32; 6] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0];

    fn triangle() -> MeshData<'static> {
        MeshData::new(&VERTICES, &NORMALS, &UVS, &[0, 1, 2])
    }

    // ============================================================
    // validate
    // ============================================================

    #[test]
    fn test_valid_triangle() {
        let mesh = triangle();
        assert_eq!(mesh.validate(), Ok(()));
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.triangle_count(), 1);
    }

    #[test]
    fn test_rejects_non_triangle_index_count() {
        let mesh = MeshData::new(&VERTICES, &NORMALS, &UVS, &[0, 1, 2, 0]);
        assert_eq!(mesh.validate(), Err(ConfigError::IndexCountNotTriangles(4)));
    }

    #[test]
    fn test_rejects_empty_mesh() {
        let mesh = MeshData::new(&VERTICES, &NORMALS, &UVS, &[]);
        assert_eq!(mesh.validate(), Err(ConfigError::EmptyMesh));
        let mesh = MeshData::new(&[], &[], &[], &[0, 1, 2]);
        assert_eq!(mesh.validate(), Err(ConfigError::EmptyMesh));
    }

    #[test]
    fn test_rejects_mismatched_attributes() {
        let mesh = MeshData::new(&VERTICES, &NORMALS[..6], &UVS, &[0, 1, 2]);
        assert!(matches!(
            mesh.validate(),
            Err(ConfigError::AttributeLength { attribute: "normals", expected: 9, actual: 6 })
        ));

        let mesh = MeshData::new(&VERTICES, &NORMALS, &UVS[..4], &[0, 1, 2]);
        assert!(matches!(
            mesh.validate(),
            Err(ConfigError::AttributeLength { attribute: "uvs", .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_index() {
        let mesh = MeshData::new(&VERTICES, &NORMALS, &UVS, &[0, 1, 3]);
        assert_eq!(
            mesh.validate(),
            Err(ConfigError::IndexOutOfRange { index: 3, vertex_count: 3 })
        );
    }

    // ============================================================
    // Derived arrays
    // ============================================================

    #[test]
    fn test_attributes_interleave() {
        let attributes = triangle().attributes();
        assert_eq!(attributes.len(), 3);
        assert_eq!(attributes[1].normal, [0.0, 0.0, 1.0]);
        assert_eq!(attributes[1].uv, [1.0, 0.0]);
    }

    #[test]
    fn test_faces() {
        let mesh = MeshData::new(&VERTICES, &NORMALS, &UVS, &[0, 1, 2, 2, 1, 0]);
        let faces = mesh.faces();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[1], ShaderFace { index0: 2, index1: 1, index2: 0 });
    }
}
