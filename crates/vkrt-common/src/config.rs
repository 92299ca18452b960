//! Ray tracer configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// File names of the compiled shader stages, relative to the shader folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSet {
    pub raygen: String,
    pub closest_hit: String,
    pub miss: String,
    pub shadow_closest_hit: String,
    pub shadow_miss: String,
}

impl Default for ShaderSet {
    fn default() -> Self {
        Self {
            raygen: "ray_gen.bin".to_string(),
            closest_hit: "ray_chit.bin".to_string(),
            miss: "ray_miss.bin".to_string(),
            shadow_closest_hit: "shadow_ray_chit.bin".to_string(),
            shadow_miss: "shadow_ray_miss.bin".to_string(),
        }
    }
}

/// Limits and paths the ray tracer is created with.
#[derive(Debug, Clone)]
pub struct RayTracerConfig {
    /// Folder the shader stage binaries are loaded from.
    pub shader_folder: PathBuf,
    /// Stage binary names.
    pub shaders: ShaderSet,
    /// Upper bound on registered meshes. Also the declared size of the
    /// per-mesh attribute and face binding arrays.
    pub max_meshes: u32,
    /// Number of cameras the descriptor pool is sized for.
    pub max_render_targets: u32,
    /// Requested pipeline recursion depth, clamped to the device limit.
    pub max_ray_recursion_depth: u32,
    /// How long a one-shot submission may take before it is reported as lost.
    pub fence_timeout: Duration,
}

impl Default for RayTracerConfig {
    fn default() -> Self {
        Self {
            shader_folder: PathBuf::from("shaders"),
            shaders: ShaderSet::default(),
            max_meshes: 1024,
            max_render_targets: 8,
            max_ray_recursion_depth: 1,
            fence_timeout: Duration::from_secs(100),
        }
    }
}

impl RayTracerConfig {
    pub fn with_shader_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.shader_folder = folder.into();
        self
    }

    pub fn with_max_meshes(mut self, max_meshes: u32) -> Self {
        self.max_meshes = max_meshes;
        self
    }

    pub fn with_max_render_targets(mut self, max_render_targets: u32) -> Self {
        self.max_render_targets = max_render_targets;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shader_folder.as_os_str().is_empty() {
            return Err(ConfigError::EmptyShaderFolder);
        }
        if self.max_meshes == 0 {
            return Err(ConfigError::ZeroLimit("max_meshes"));
        }
        if self.max_render_targets == 0 {
            return Err(ConfigError::ZeroLimit("max_render_targets"));
        }
        if self.max_ray_recursion_depth == 0 {
            return Err(ConfigError::ZeroLimit("max_ray_recursion_depth"));
        }
        if self.fence_timeout.is_zero() {
            return Err(ConfigError::ZeroLimit("fence_timeout"));
        }
        Ok(())
    }

    /// Recursion depth to request from a device reporting `device_max`.
    pub fn recursion_depth(&self, device_max: u32) -> u32 {
        self.max_ray_recursion_depth.min(device_max).max(1)
    }

    /// Full paths of the five stage binaries in pipeline stage order:
    /// raygen, closest hit, miss, shadow closest hit, shadow miss.
    pub fn shader_paths(&self) -> [PathBuf; 5] {
        let folder: &Path = &self.shader_folder;
        [
            folder.join(&self.shaders.raygen),
            folder.join(&self.shaders.closest_hit),
            folder.join(&self.shaders.miss),
            folder.join(&self.shaders.shadow_closest_hit),
            folder.join(&self.shaders.shadow_miss),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // ============================================================
    // RayTracerConfig::default
    // ============================================================

    #[test]
    fn test_default_config() {
        let config = RayTracerConfig::default();
        assert_eq!(config.shader_folder, PathBuf::from("shaders"));
        assert_eq!(config.max_meshes, 1024);
        assert_eq!(config.max_ray_recursion_depth, 1);
        assert_eq!(config.fence_timeout, Duration::from_secs(100));
        assert_eq!(config.validate(), Ok(()));
    }

    // ============================================================
    // validate
    // ============================================================

    #[rstest]
    #[case::meshes(RayTracerConfig::default().with_max_meshes(0), ConfigError::ZeroLimit("max_meshes"))]
    #[case::targets(RayTracerConfig::default().with_max_render_targets(0), ConfigError::ZeroLimit("max_render_targets"))]
    #[case::timeout(RayTracerConfig::default().with_fence_timeout(Duration::ZERO), ConfigError::ZeroLimit("fence_timeout"))]
    #[case::folder(RayTracerConfig::default().with_shader_folder(""), ConfigError::EmptyShaderFolder)]
    fn test_validate_rejects(#[case] config: RayTracerConfig, #[case] expected: ConfigError) {
        assert_eq!(config.validate(), Err(expected));
    }

    // ============================================================
    // Derived values
    // ============================================================

    #[test]
    fn test_recursion_depth_clamped() {
        let mut config = RayTracerConfig::default();
        config.max_ray_recursion_depth = 8;
        assert_eq!(config.recursion_depth(31), 8);
        assert_eq!(config.recursion_depth(2), 2);
        assert_eq!(config.recursion_depth(0), 1);
    }

    #[test]
    fn test_shader_paths_follow_folder() {
        let config = RayTracerConfig::default().with_shader_folder("/opt/rt");
        let paths = config.shader_paths();
        assert_eq!(paths[0], PathBuf::from("/opt/rt/ray_gen.bin"));
        assert_eq!(paths[4], PathBuf::from("/opt/rt/shadow_ray_miss.bin"));
    }
}
