//! The ray tracer context: host operations and per-frame dispatch.
//!
//! A [`RayTracer`] owns every GPU object the core creates. Hosts create one
//! per device and call into it from their render thread:
//!
//! ```text
//! add_shared_mesh ─┐
//! add_tlas_instance├─> build_tlas ─> set_render_target ─> update_camera ─> trace_rays
//! remove_tlas_...  ┘
//! ```
//!
//! Every precondition `trace_rays` needs that is simply not there yet is
//! reported as [`TraceOutcome::Skipped`], never as an error.

use std::collections::HashMap;
use std::path::PathBuf;

use ash::vk;
use vkrt_common::{
    ConfigError, Insert, MeshData, RayTracerConfig, ResourcePool, ShaderCameraParam, ShaderSceneParam, Transform3x4,
};

use crate::descriptors::{plan_writes, BindingSources, DescriptorBindingManager};
use crate::device::{RayTracingDevice, TraceDispatch};
use crate::error::{RtError, RtResult};
use crate::host::{HostGraphics, HostTextureHandle, HostVulkan};
use crate::raytracing::acceleration::{TlasAction, TlasBuildOutcome, TlasBuilder, TlasInput};
use crate::raytracing::pipeline::{PipelineState, RayTracingPipelineState};
use crate::render_target::{BindingStamp, RenderTarget};
use crate::resources::{GpuAccelerationStructure, GpuBuffer};
use crate::scene::{upload, GeometryRecord, InstanceRecord};
use crate::vulkan::VulkanDevice;

/// Why a trace request did not dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReady {
    /// `set_render_target` was never called for this camera.
    NoTarget,
    /// The camera has a target but no camera data yet.
    NoCameraData,
    /// No TLAS has been built, or the last build had no instances.
    NoTlas,
    /// The host is not recording a command buffer.
    NoCommandStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    Dispatched,
    Skipped(NotReady),
}

/// Log a failure at the host call boundary and pass it on.
fn logged<T>(operation: &str, result: RtResult<T>) -> RtResult<T> {
    if let Err(err) = &result {
        log::error!("{} failed: {}", operation, err);
    }
    result
}

/// GPU ray tracing core for one host device.
pub struct RayTracer {
    config: RayTracerConfig,
    meshes: ResourcePool<i32, GeometryRecord>,
    instances: ResourcePool<i32, InstanceRecord>,
    tlas: TlasBuilder,
    targets: HashMap<i32, RenderTarget>,
    scene: Option<GpuBuffer>,
    descriptors: Option<DescriptorBindingManager>,
    pipeline: RayTracingPipelineState,
    /// Bumped whenever a geometry is registered.
    mesh_epoch: u64,
    // Declared last: every resource above is released through it.
    device: Box<dyn RayTracingDevice>,
}

impl RayTracer {
    pub fn new(device: Box<dyn RayTracingDevice>, config: RayTracerConfig) -> RtResult<Self> {
        config.validate()?;
        log::info!(
            "Ray tracer created on {} backend (max {} meshes, {} targets)",
            device.name(),
            config.max_meshes,
            config.max_render_targets
        );

        Ok(Self {
            config,
            meshes: ResourcePool::new(),
            instances: ResourcePool::new(),
            tlas: TlasBuilder::new(),
            targets: HashMap::new(),
            scene: None,
            descriptors: None,
            pipeline: RayTracingPipelineState::new(),
            mesh_epoch: 0,
            device,
        })
    }

    /// Create a ray tracer on the host's Vulkan device.
    pub fn vulkan(host: &HostVulkan, config: RayTracerConfig) -> RtResult<Self> {
        config.validate()?;
        let device = VulkanDevice::new(host, config.fence_timeout)?;
        Self::new(Box::new(device), config)
    }

    pub fn config(&self) -> &RayTracerConfig {
        &self.config
    }

    pub fn device(&self) -> &dyn RayTracingDevice {
        self.device.as_ref()
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn tlas(&self) -> Option<&GpuAccelerationStructure> {
        self.tlas.structure()
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    // ============================================================
    // Render targets
    // ============================================================

    /// Create the output image for `camera_id`, replacing any existing one
    /// whose parameters differ. Re-requesting identical parameters keeps the
    /// current target untouched.
    ///
    /// A replaced target loses its camera data.
    pub fn set_render_target(
        &mut self,
        camera_id: i32,
        host_format: i32,
        width: u32,
        height: u32,
        texture: HostTextureHandle,
    ) -> RtResult<()> {
        if let Some(target) = self.targets.get(&camera_id) {
            if target.matches(host_format, width, height, texture) {
                return Ok(());
            }
        }

        let device = self.device.as_ref();
        let target = logged(
            "SetRenderTarget",
            RenderTarget::new(device, host_format, width, height, texture),
        )?;

        if self.targets.contains_key(&camera_id) {
            logged("SetRenderTarget", device.wait_idle())?;
        }
        if let Some(mut previous) = self.targets.insert(camera_id, target) {
            if let Some(manager) = &self.descriptors {
                previous.release_descriptor_sets(device, manager);
            }
            log::info!("Render target for camera {} replaced ({}x{})", camera_id, width, height);
        } else {
            log::info!("Render target for camera {} created ({}x{})", camera_id, width, height);
        }
        Ok(())
    }

    // ============================================================
    // Meshes and instances
    // ============================================================

    /// Register a mesh and build its BLAS. Registering a known `mesh_id`
    /// again returns the existing pool index without touching the device.
    pub fn add_shared_mesh(&mut self, mesh_id: i32, mesh: &MeshData<'_>) -> RtResult<u32> {
        if let Some(index) = self.meshes.find(&mesh_id) {
            return Ok(index);
        }
        if self.meshes.len() as u32 >= self.config.max_meshes {
            return logged(
                "AddSharedMesh",
                Err(RtError::MeshCapacityExceeded {
                    max: self.config.max_meshes,
                }),
            );
        }

        let device = self.device.as_ref();
        let insert = logged(
            "AddSharedMesh",
            self.meshes.insert_with(mesh_id, |_| GeometryRecord::new(device, mesh)),
        )?;

        if let Insert::Created(index) = insert {
            self.mesh_epoch += 1;
            log::info!(
                "Mesh {} registered at slot {} ({} vertices, {} triangles)",
                mesh_id,
                index,
                mesh.vertex_count(),
                mesh.triangle_count()
            );
        }
        Ok(insert.index())
    }

    pub fn shared_mesh_index(&self, mesh_id: i32) -> Option<u32> {
        self.meshes.find(&mesh_id)
    }

    /// Place `mesh_index` in the scene under `object_id`.
    ///
    /// `transform` holds either 16 floats (column-major 4x4) or 12 floats
    /// (row-major 3x4). Adding a known `object_id` again returns its
    /// existing index and changes nothing.
    pub fn add_tlas_instance(&mut self, object_id: i32, mesh_index: u32, transform: &[f32]) -> RtResult<u32> {
        if let Some(index) = self.instances.find(&object_id) {
            return Ok(index);
        }

        let transform = logged("AddTlasInstance", Transform3x4::from_slice(transform).map_err(RtError::from))?;
        let mesh = logged(
            "AddTlasInstance",
            self.meshes.handle(mesh_index).ok_or(RtError::UnknownMesh(mesh_index)),
        )?;

        let insert = self
            .instances
            .insert_with(object_id, |_| Ok::<_, RtError>(InstanceRecord { mesh, transform }))?;
        self.tlas.mark_instances_changed();
        log::debug!("Instance {} placed at slot {} (mesh {})", object_id, insert.index(), mesh_index);
        Ok(insert.index())
    }

    /// Move an existing instance. The next `build_tlas` refits instead of
    /// rebuilding if nothing else changed.
    pub fn update_tlas_instance_transform(&mut self, instance_index: u32, transform: &[f32]) -> RtResult<()> {
        let transform = logged(
            "UpdateTlasInstanceTransform",
            Transform3x4::from_slice(transform).map_err(RtError::from),
        )?;
        let instance = logged(
            "UpdateTlasInstanceTransform",
            self.instances
                .get_mut(instance_index)
                .ok_or(RtError::UnknownInstance(instance_index)),
        )?;

        if instance.transform != transform {
            instance.transform = transform;
            self.tlas.mark_transforms_changed();
        }
        Ok(())
    }

    pub fn remove_tlas_instance(&mut self, instance_index: u32) -> RtResult<()> {
        if self.instances.remove(instance_index).is_none() {
            return logged("RemoveTlasInstance", Err(RtError::UnknownInstance(instance_index)));
        }
        self.tlas.mark_instances_changed();
        log::debug!("Instance slot {} removed", instance_index);
        Ok(())
    }

    pub fn tlas_instance_index(&self, object_id: i32) -> Option<u32> {
        self.instances.find(&object_id)
    }

    /// Apply pending instance changes to the TLAS.
    pub fn build_tlas(&mut self) -> RtResult<TlasBuildOutcome> {
        if self.tlas.plan(self.instances.len()) == TlasAction::None {
            return self.tlas.build(self.device.as_ref(), &[]);
        }

        let inputs = logged("BuildTlas", self.tlas_inputs())?;
        logged("BuildTlas", self.tlas.build(self.device.as_ref(), &inputs))
    }

    /// Live instances in slot order, each resolved to its BLAS address.
    fn tlas_inputs(&self) -> RtResult<Vec<TlasInput>> {
        self.instances
            .in_use()
            .map(|(slot, instance)| -> RtResult<TlasInput> {
                let geometry = self.meshes.resolve(instance.mesh).ok_or(RtError::StaleGeometry {
                    instance: slot,
                    mesh: instance.mesh.index(),
                })?;
                let blas_address = geometry.blas().device_address().ok_or_else(|| {
                    RtError::ResourceCreation(format!("BLAS for mesh slot {} has no device address", instance.mesh.index()))
                })?;
                Ok(TlasInput {
                    slot,
                    transform: instance.transform,
                    blas_address,
                })
            })
            .collect()
    }

    // ============================================================
    // Uniform data
    // ============================================================

    /// Upload camera data for `camera_id`. Returns `false` if the camera
    /// has no render target.
    pub fn update_camera(&mut self, camera_id: i32, camera: &ShaderCameraParam) -> RtResult<bool> {
        let Some(target) = self.targets.get_mut(&camera_id) else {
            log::debug!("UpdateCamera: no render target for camera {}", camera_id);
            return Ok(false);
        };
        logged("UpdateCamera", target.upload_camera(self.device.as_ref(), camera))?;
        Ok(true)
    }

    pub fn update_scene_data(&mut self, ambient: [f32; 4]) -> RtResult<()> {
        let param = ShaderSceneParam { ambient };
        match &self.scene {
            Some(scene) => logged("UpdateSceneData", scene.write(0, std::slice::from_ref(&param))),
            None => {
                let scene = logged("UpdateSceneData", Self::create_scene_buffer(self.device.as_ref(), &param))?;
                self.scene = Some(scene);
                Ok(())
            }
        }
    }

    fn create_scene_buffer(device: &dyn RayTracingDevice, param: &ShaderSceneParam) -> RtResult<GpuBuffer> {
        upload(
            device,
            std::slice::from_ref(param),
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "scene_uniform",
        )
    }

    // ============================================================
    // Pipeline lifecycle
    // ============================================================

    /// Create the descriptor layouts and pool, the scene uniform and the
    /// pipeline layout. Safe to call repeatedly.
    pub fn prepare(&mut self) -> RtResult<()> {
        logged("Prepare", self.prepare_inner())
    }

    fn prepare_inner(&mut self) -> RtResult<()> {
        let device = self.device.as_ref();

        if self.descriptors.is_none() {
            self.descriptors = Some(DescriptorBindingManager::new(device, &self.config)?);
        }
        if self.scene.is_none() {
            self.scene = Some(Self::create_scene_buffer(device, &ShaderSceneParam::default())?);
        }
        if let Some(manager) = &self.descriptors {
            self.pipeline.ensure_layout(device, manager.layouts())?;
        }
        Ok(())
    }

    /// Destroy the pipeline, keeping its layout. The next trace recreates it.
    pub fn reset_pipeline(&mut self) -> RtResult<()> {
        if self.pipeline.state() == PipelineState::Ready {
            logged("ResetPipeline", self.device.wait_idle())?;
        }
        self.pipeline.reset(self.device.as_ref());
        Ok(())
    }

    /// Load stage binaries from `folder` from the next pipeline creation on.
    pub fn set_shader_folder(&mut self, folder: impl Into<PathBuf>) -> RtResult<()> {
        let folder = folder.into();
        if folder.as_os_str().is_empty() {
            return logged("SetShaderFolder", Err(ConfigError::EmptyShaderFolder.into()));
        }
        log::info!("Shader folder set to {}", folder.display());
        self.config.shader_folder = folder;
        Ok(())
    }

    // ============================================================
    // Frame dispatch
    // ============================================================

    /// Record a trace for `camera_id` into the host's current command
    /// buffer, then copy the result into the camera's host texture.
    pub fn trace_rays(&mut self, camera_id: i32, host: &dyn HostGraphics) -> RtResult<TraceOutcome> {
        match self.readiness(camera_id, host) {
            Ok(cmd) => logged("TraceRays", self.dispatch(camera_id, cmd, host)),
            Err(reason) => {
                log::debug!("TraceRays skipped for camera {}: {:?}", camera_id, reason);
                Ok(TraceOutcome::Skipped(reason))
            }
        }
    }

    fn readiness(&self, camera_id: i32, host: &dyn HostGraphics) -> Result<vk::CommandBuffer, NotReady> {
        let target = self.targets.get(&camera_id).ok_or(NotReady::NoTarget)?;
        target.camera().ok_or(NotReady::NoCameraData)?;
        self.tlas.structure().ok_or(NotReady::NoTlas)?;
        host.recording_command_buffer().ok_or(NotReady::NoCommandStream)
    }

    fn dispatch(&mut self, camera_id: i32, cmd: vk::CommandBuffer, host: &dyn HostGraphics) -> RtResult<TraceOutcome> {
        self.prepare_inner()?;

        let device = self.device.as_ref();
        let manager = self.descriptors.as_ref().ok_or_else(|| {
            RtError::ResourceCreation("descriptor layouts".to_string())
        })?;
        let layout = self.pipeline.ensure_layout(device, manager.layouts())?;
        self.pipeline.ensure_pipeline(device, &self.config)?;

        let (Some(pipeline), Some(sbt)) = (self.pipeline.pipeline(), self.pipeline.sbt()) else {
            return Err(RtError::ResourceCreation("ray tracing pipeline".to_string()));
        };
        let (Some(target), Some(tlas), Some(scene)) =
            (self.targets.get_mut(&camera_id), self.tlas.structure(), self.scene.as_ref())
        else {
            return Err(RtError::ResourceCreation("trace inputs".to_string()));
        };

        // Refresh descriptors
        let mesh_capacity = self.meshes.capacity() as u32;
        let stamp = BindingStamp {
            mesh_capacity,
            mesh_epoch: self.mesh_epoch,
            tlas_epoch: self.tlas.epoch(),
        };
        let sets = target.ensure_descriptor_sets(device, manager, mesh_capacity)?;
        if target.descriptors_dirty(stamp) {
            let sources = binding_sources(&self.meshes, tlas, scene, target)?;
            device.update_descriptor_sets(&plan_writes(&sets, &sources));
            target.mark_descriptors_written(stamp);
            log::debug!("Descriptor sets for camera {} rewritten", camera_id);
        }

        device.record_trace_rays(
            cmd,
            &TraceDispatch {
                pipeline,
                layout,
                descriptor_sets: &sets,
                image: target.image().raw(),
                regions: sbt.regions(),
                extent: target.extent(),
            },
        );

        match host.access_texture(target.texture()) {
            Some(texture) => device.record_copy_to_texture(cmd, target.image(), &texture),
            None => log::warn!(
                "Host texture {:?} for camera {} is not accessible; trace result not copied",
                target.texture(),
                camera_id
            ),
        }
        Ok(TraceOutcome::Dispatched)
    }
}

/// Snapshot the buffer and image infos a target's sets point at.
fn binding_sources(
    meshes: &ResourcePool<i32, GeometryRecord>,
    tlas: &GpuAccelerationStructure,
    scene: &GpuBuffer,
    target: &RenderTarget,
) -> RtResult<BindingSources> {
    let camera = target
        .camera()
        .ok_or_else(|| RtError::ResourceCreation("camera uniform".to_string()))?;

    let (attributes, faces) = meshes
        .allocated()
        .map(|(_, geometry)| {
            (
                geometry.map(|g| g.attribute_buffer().descriptor_info()),
                geometry.map(|g| g.face_buffer().descriptor_info()),
            )
        })
        .unzip();

    Ok(BindingSources {
        tlas: tlas.raw(),
        scene: scene.descriptor_info(),
        camera: camera.descriptor_info(),
        output: target.image().descriptor_info(),
        attributes,
        faces,
    })
}

impl Drop for RayTracer {
    fn drop(&mut self) {
        let device = self.device.as_ref();
        if let Err(err) = device.wait_idle() {
            log::error!("Ray tracer shutdown: wait for device idle failed: {}", err);
        }

        self.pipeline.destroy(device);
        self.targets.clear();
        if let Some(mut manager) = self.descriptors.take() {
            manager.destroy(device);
        }
        self.scene = None;
        self.tlas = TlasBuilder::new();
        self.instances.clear();
        self.meshes.clear();
        log::info!("Ray tracer shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyDevice;
    use crate::error::ErrorKind;
    use crate::host::HostTexture;
    use crate::raytracing::acceleration::{RtInstance, INSTANCE_SIZE};
    use crate::raytracing::pipeline::tests::write_test_shaders;
    use crate::device::BuildMode;
    use ash::vk::Handle;

    const VERTICES: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    const NORMALS: [f32; 9] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    const UVS: [f32; 6] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    const INDICES: [u32; 3] = [0, 1, 2];

    const IDENTITY_4X4: [f32; 16] = [
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ];

    const CAMERA: i32 = 1;
    const TEXTURE: HostTextureHandle = HostTextureHandle(0x77);

    struct TestHost {
        cmd: Option<vk::CommandBuffer>,
        texture: Option<HostTexture>,
    }

    impl TestHost {
        fn recording() -> Self {
            Self {
                cmd: Some(vk::CommandBuffer::from_raw(0xC0)),
                texture: Some(HostTexture {
                    image: vk::Image::from_raw(0xD0),
                    layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    extent: vk::Extent2D { width: 64, height: 32 },
                }),
            }
        }
    }

    impl HostGraphics for TestHost {
        fn recording_command_buffer(&self) -> Option<vk::CommandBuffer> {
            self.cmd
        }

        fn access_texture(&self, handle: HostTextureHandle) -> Option<HostTexture> {
            self.texture.filter(|_| handle == TEXTURE)
        }
    }

    fn tracer(tag: &str) -> (RayTracer, DummyDevice) {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = DummyDevice::new();
        let config = RayTracerConfig::default()
            .with_shader_folder(write_test_shaders(tag))
            .with_max_meshes(4);
        let tracer = RayTracer::new(Box::new(device.clone()), config).unwrap();
        (tracer, device)
    }

    fn triangle() -> MeshData<'static> {
        MeshData::new(&VERTICES, &NORMALS, &UVS, &INDICES)
    }

    fn translation(x: f32) -> [f32; 12] {
        [1.0, 0.0, 0.0, x, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
    }

    fn camera_param() -> ShaderCameraParam {
        ShaderCameraParam::new(
            [0.0, 0.0, 5.0],
            [0.0, 0.0, -1.0],
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.1, 100.0, 60.0],
        )
    }

    /// One mesh, one instance, a built TLAS and a camera with data.
    fn ready_scene(tag: &str) -> (RayTracer, DummyDevice) {
        let (mut tracer, device) = tracer(tag);
        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();
        tracer.add_tlas_instance(100, mesh, &IDENTITY_4X4).unwrap();
        tracer.build_tlas().unwrap();
        tracer.set_render_target(CAMERA, 4, 64, 32, TEXTURE).unwrap();
        assert!(tracer.update_camera(CAMERA, &camera_param()).unwrap());
        (tracer, device)
    }

    fn staged_instances(tracer: &RayTracer) -> Vec<RtInstance> {
        let contents = tracer.tlas.instance_buffer().unwrap().contents();
        contents
            .chunks_exact(INSTANCE_SIZE as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    // ============================================================
    // Construction
    // ============================================================

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = RayTracerConfig::default().with_max_meshes(0);
        let err = RayTracer::new(Box::new(DummyDevice::new()), config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    // ============================================================
    // Shared meshes
    // ============================================================

    #[test]
    fn test_repeated_mesh_id_is_idempotent() {
        let (mut tracer, device) = tracer("mesh-idempotent");

        let first = tracer.add_shared_mesh(10, &triangle()).unwrap();
        let second = tracer.add_shared_mesh(10, &triangle()).unwrap();
        let third = tracer.add_shared_mesh(10, &triangle()).unwrap();

        assert_eq!(first, 0);
        assert_eq!((second, third), (first, first));
        assert_eq!(tracer.mesh_count(), 1);
        assert_eq!(tracer.shared_mesh_index(10), Some(0));
        assert_eq!(tracer.shared_mesh_index(11), None);

        let log = device.log();
        assert_eq!(log.builds.len(), 1);
        assert_eq!(log.builds[0].ty, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
    }

    #[test]
    fn test_mesh_capacity_is_enforced() {
        let (mut tracer, _device) = tracer("mesh-capacity");
        for id in 0..4 {
            tracer.add_shared_mesh(id, &triangle()).unwrap();
        }

        let err = tracer.add_shared_mesh(4, &triangle()).unwrap_err();
        assert!(matches!(err, RtError::MeshCapacityExceeded { max: 4 }));
        // Known ids still resolve once full.
        assert_eq!(tracer.add_shared_mesh(2, &triangle()).unwrap(), 2);
    }

    #[test]
    fn test_bad_index_count_rejected_before_device_work() {
        let (mut tracer, device) = tracer("mesh-invalid");
        let mesh = MeshData::new(&VERTICES, &NORMALS, &UVS, &INDICES[..2]);

        let err = tracer.add_shared_mesh(10, &mesh).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(tracer.shared_mesh_index(10), None);
        assert_eq!(device.log().buffers_created, 0);
    }

    #[test]
    fn test_failed_mesh_upload_leaves_pool_untouched() {
        let (mut tracer, device) = tracer("mesh-oom");
        device.fail_buffers_after(1);
        let err = tracer.add_shared_mesh(10, &triangle()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceCreation);
        assert_eq!(tracer.shared_mesh_index(10), None);

        device.heal_buffers();
        assert_eq!(tracer.add_shared_mesh(10, &triangle()).unwrap(), 0);
    }

    // ============================================================
    // Instances
    // ============================================================

    #[test]
    fn test_instance_lookup_tracks_live_set() {
        let (mut tracer, _device) = tracer("instance-lookup");
        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();

        let a = tracer.add_tlas_instance(1, mesh, &IDENTITY_4X4).unwrap();
        let b = tracer.add_tlas_instance(2, mesh, &translation(1.0)).unwrap();
        let c = tracer.add_tlas_instance(3, mesh, &translation(2.0)).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(tracer.add_tlas_instance(2, mesh, &IDENTITY_4X4).unwrap(), b);

        tracer.remove_tlas_instance(b).unwrap();
        assert_eq!(tracer.tlas_instance_index(1), Some(a));
        assert_eq!(tracer.tlas_instance_index(2), None);
        assert_eq!(tracer.tlas_instance_index(3), Some(c));

        // The freed slot is reused; the others keep their indices.
        assert_eq!(tracer.add_tlas_instance(4, mesh, &IDENTITY_4X4).unwrap(), b);
        assert_eq!(tracer.tlas_instance_index(3), Some(c));
        assert_eq!(tracer.instance_count(), 3);

        assert!(matches!(tracer.remove_tlas_instance(9), Err(RtError::UnknownInstance(9))));
    }

    #[test]
    fn test_instance_input_validation() {
        let (mut tracer, _device) = tracer("instance-validation");
        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();

        assert!(matches!(
            tracer.add_tlas_instance(1, 3, &IDENTITY_4X4),
            Err(RtError::UnknownMesh(3))
        ));
        assert!(matches!(
            tracer.add_tlas_instance(1, mesh, &[1.0; 9]),
            Err(RtError::Config(ConfigError::TransformLength(9)))
        ));
        assert_eq!(tracer.tlas_instance_index(1), None);
        assert!(!tracer.tlas.needs_full_rebuild());
    }

    // ============================================================
    // TLAS builds
    // ============================================================

    #[test]
    fn test_transform_only_change_refits_in_place() {
        let (mut tracer, device) = tracer("tlas-refit");
        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();
        tracer.add_tlas_instance(1, mesh, &IDENTITY_4X4).unwrap();
        tracer.add_tlas_instance(2, mesh, &translation(3.0)).unwrap();
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Built { instance_count: 2 });

        let before = staged_instances(&tracer);
        let tlas = tracer.tlas().unwrap().raw();

        tracer.update_tlas_instance_transform(1, &translation(-4.0)).unwrap();
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Updated { instance_count: 2 });

        let after = staged_instances(&tracer);
        assert_eq!(tracer.tlas().unwrap().raw(), tlas);
        for (old, new) in before.iter().zip(&after) {
            assert_eq!(old.acceleration_structure_reference, new.acceleration_structure_reference);
            assert_eq!(old.custom_index(), new.custom_index());
        }
        assert_eq!(after[0].transform, before[0].transform);
        assert_eq!(after[1].transform.translation(), [-4.0, 0.0, 0.0]);

        let builds = device.log().builds;
        let last = builds.last().unwrap();
        assert_eq!(last.mode, BuildMode::Update);
        assert_eq!(last.structure, tlas);
    }

    #[test]
    fn test_unchanged_transform_needs_no_build() {
        let (mut tracer, device) = tracer("tlas-unchanged");
        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();
        let instance = tracer.add_tlas_instance(1, mesh, &translation(1.0)).unwrap();
        tracer.build_tlas().unwrap();

        tracer.update_tlas_instance_transform(instance, &translation(1.0)).unwrap();
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Skipped);
        assert_eq!(device.log().builds.len(), 2);
    }

    #[test]
    fn test_add_or_remove_forces_full_rebuild() {
        let (mut tracer, device) = tracer("tlas-rebuild");
        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();
        tracer.add_tlas_instance(1, mesh, &IDENTITY_4X4).unwrap();
        tracer.build_tlas().unwrap();

        // A pending transform change does not downgrade the rebuild.
        tracer.update_tlas_instance_transform(0, &translation(1.0)).unwrap();
        tracer.add_tlas_instance(2, mesh, &translation(2.0)).unwrap();
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Built { instance_count: 2 });

        tracer.remove_tlas_instance(0).unwrap();
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Built { instance_count: 1 });

        let tlas_builds: Vec<_> = device
            .log()
            .builds
            .into_iter()
            .filter(|build| build.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .collect();
        assert_eq!(tlas_builds.len(), 3);
        assert!(tlas_builds.iter().all(|build| build.mode == BuildMode::Build));
        assert_eq!(tlas_builds[2].primitive_count as usize, tracer.instance_count());

        let staged = staged_instances(&tracer);
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].custom_index(), 1);
    }

    #[test]
    fn test_empty_build_leaves_tlas_unset() {
        let (mut tracer, device) = tracer("tlas-empty");
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Skipped);
        assert!(tracer.tlas().is_none());

        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();
        let instance = tracer.add_tlas_instance(1, mesh, &IDENTITY_4X4).unwrap();
        tracer.remove_tlas_instance(instance).unwrap();
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Released);
        assert!(tracer.tlas().is_none());
        assert!(device.log().structures_created.iter().all(|ty| *ty != vk::AccelerationStructureTypeKHR::TOP_LEVEL));

        tracer.set_render_target(CAMERA, 4, 64, 32, TEXTURE).unwrap();
        tracer.update_camera(CAMERA, &camera_param()).unwrap();
        assert_eq!(
            tracer.trace_rays(CAMERA, &TestHost::recording()).unwrap(),
            TraceOutcome::Skipped(NotReady::NoTlas)
        );
        assert!(device.log().traces.is_empty());
    }

    #[test]
    fn test_failed_refit_recovers_with_full_rebuild() {
        let (mut tracer, device) = tracer("tlas-refit-fail");
        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();
        tracer.add_tlas_instance(1, mesh, &IDENTITY_4X4).unwrap();
        tracer.build_tlas().unwrap();

        tracer.update_tlas_instance_transform(0, &translation(1.0)).unwrap();
        device.fail_next_build();
        let err = tracer.build_tlas().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert!(tracer.tlas().is_none());

        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Built { instance_count: 1 });
        assert_eq!(staged_instances(&tracer)[0].transform.translation(), [1.0, 0.0, 0.0]);
    }

    // ============================================================
    // Render targets and uniforms
    // ============================================================

    #[test]
    fn test_render_target_format_rejected_without_device_work() {
        let (mut tracer, device) = tracer("target-format");
        let err = tracer.set_render_target(CAMERA, 0, 64, 32, TEXTURE).unwrap_err();
        assert!(matches!(err, RtError::UnsupportedPixelFormat(0)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(device.log().images_created, 0);
        assert!(!tracer.update_camera(CAMERA, &camera_param()).unwrap());
    }

    #[test]
    fn test_render_target_replaced_only_when_parameters_change() {
        let (mut tracer, device) = ready_scene("target-replace");
        let waits = device.log().wait_idle_calls;

        tracer.set_render_target(CAMERA, 4, 64, 32, TEXTURE).unwrap();
        assert_eq!(device.log().images_created, 1);
        assert_eq!(device.log().wait_idle_calls, waits);

        tracer.set_render_target(CAMERA, 4, 128, 64, TEXTURE).unwrap();
        let log = device.log();
        assert_eq!(log.images_created, 2);
        assert_eq!(log.wait_idle_calls, waits + 1);

        // The replacement starts without camera data.
        assert_eq!(
            tracer.trace_rays(CAMERA, &TestHost::recording()).unwrap(),
            TraceOutcome::Skipped(NotReady::NoCameraData)
        );
    }

    #[test]
    fn test_scene_data_before_prepare() {
        let (mut tracer, device) = tracer("scene-data");
        tracer.update_scene_data([0.1, 0.2, 0.3, 1.0]).unwrap();
        tracer.prepare().unwrap();
        tracer.update_scene_data([0.5, 0.5, 0.5, 1.0]).unwrap();

        let scene = tracer.scene.as_ref().unwrap();
        let param: ShaderSceneParam = bytemuck::pod_read_unaligned(&scene.contents());
        assert_eq!(param.ambient, [0.5, 0.5, 0.5, 1.0]);
        assert_eq!(device.log().buffers_created, 1);
    }

    // ============================================================
    // Pipeline lifecycle
    // ============================================================

    #[test]
    fn test_prepare_is_idempotent() {
        let (mut tracer, device) = tracer("prepare");
        assert_eq!(tracer.pipeline_state(), PipelineState::Uninitialized);

        tracer.prepare().unwrap();
        tracer.prepare().unwrap();

        let log = device.log();
        assert_eq!(log.layouts.len(), 4);
        assert_eq!(log.pipeline_layouts_created, 1);
        assert_eq!(log.buffers_created, 1);
        assert_eq!(tracer.pipeline_state(), PipelineState::LayoutReady);
    }

    #[test]
    fn test_reset_pipeline_rebuilds_on_next_trace() {
        let (mut tracer, device) = ready_scene("reset");
        let host = TestHost::recording();
        tracer.trace_rays(CAMERA, &host).unwrap();
        assert_eq!(tracer.pipeline_state(), PipelineState::Ready);

        tracer.reset_pipeline().unwrap();
        assert_eq!(tracer.pipeline_state(), PipelineState::LayoutReady);
        assert_eq!(device.log().pipelines_destroyed, 1);

        assert_eq!(tracer.trace_rays(CAMERA, &host).unwrap(), TraceOutcome::Dispatched);
        let log = device.log();
        assert_eq!(log.pipelines_created, 2);
        assert_eq!(log.pipeline_layouts_created, 1);
        assert_eq!(tracer.pipeline_state(), PipelineState::Ready);
    }

    #[test]
    fn test_missing_shaders_fail_trace() {
        let (mut tracer, device) = ready_scene("missing-shaders");
        tracer.set_shader_folder(std::env::temp_dir().join("vkrt-no-such-folder")).unwrap();

        let err = tracer.trace_rays(CAMERA, &TestHost::recording()).unwrap_err();
        assert!(matches!(err, RtError::ShaderLoad { .. }));
        assert_eq!(tracer.pipeline_state(), PipelineState::LayoutReady);
        assert!(device.log().traces.is_empty());
        assert!(tracer.set_shader_folder("").is_err());
    }

    // ============================================================
    // Trace dispatch
    // ============================================================

    #[test]
    fn test_trace_preconditions_skip_silently() {
        let (mut tracer, device) = tracer("preconditions");
        let host = TestHost::recording();
        assert_eq!(
            tracer.trace_rays(CAMERA, &host).unwrap(),
            TraceOutcome::Skipped(NotReady::NoTarget)
        );

        tracer.set_render_target(CAMERA, 4, 64, 32, TEXTURE).unwrap();
        assert_eq!(
            tracer.trace_rays(CAMERA, &host).unwrap(),
            TraceOutcome::Skipped(NotReady::NoCameraData)
        );

        tracer.update_camera(CAMERA, &camera_param()).unwrap();
        assert_eq!(
            tracer.trace_rays(CAMERA, &host).unwrap(),
            TraceOutcome::Skipped(NotReady::NoTlas)
        );

        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();
        tracer.add_tlas_instance(1, mesh, &IDENTITY_4X4).unwrap();
        tracer.build_tlas().unwrap();
        let idle = TestHost { cmd: None, ..TestHost::recording() };
        assert_eq!(
            tracer.trace_rays(CAMERA, &idle).unwrap(),
            TraceOutcome::Skipped(NotReady::NoCommandStream)
        );

        assert_eq!(tracer.trace_rays(CAMERA, &host).unwrap(), TraceOutcome::Dispatched);
        assert_eq!(device.log().traces.len(), 1);
    }

    #[test]
    fn test_trace_records_dispatch_and_copy() {
        let (mut tracer, device) = ready_scene("dispatch");
        let host = TestHost::recording();
        assert_eq!(tracer.trace_rays(CAMERA, &host).unwrap(), TraceOutcome::Dispatched);

        let log = device.log();
        assert_eq!(log.traces.len(), 1);
        let trace = &log.traces[0];
        assert_eq!(trace.extent, vk::Extent2D { width: 64, height: 32 });
        assert_eq!(trace.descriptor_sets.len(), 4);
        assert_eq!(log.copies, vec![(trace.image, vk::Image::from_raw(0xD0))]);

        // Set 0: TLAS, scene, camera. Set 1: output. Sets 2/3: one mesh each.
        assert_eq!(log.update_calls, 1);
        assert_eq!(log.writes.len(), 6);
        assert_eq!(log.writes[0].descriptor_type, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
    }

    #[test]
    fn test_descriptors_written_only_when_stale() {
        let (mut tracer, device) = ready_scene("stale");
        let host = TestHost::recording();
        tracer.trace_rays(CAMERA, &host).unwrap();
        tracer.trace_rays(CAMERA, &host).unwrap();
        assert_eq!(device.log().update_calls, 1);

        // A refit keeps the structure handle.
        tracer.update_tlas_instance_transform(0, &translation(2.0)).unwrap();
        tracer.build_tlas().unwrap();
        tracer.trace_rays(CAMERA, &host).unwrap();
        assert_eq!(device.log().update_calls, 1);

        // A rebuild does not.
        tracer.add_tlas_instance(101, 0, &IDENTITY_4X4).unwrap();
        tracer.build_tlas().unwrap();
        tracer.trace_rays(CAMERA, &host).unwrap();
        assert_eq!(device.log().update_calls, 2);
        assert_eq!(device.log().traces.len(), 4);
    }

    #[test]
    fn test_variable_counts_follow_pool_capacity() {
        let (mut tracer, device) = ready_scene("capacity");
        let host = TestHost::recording();
        tracer.trace_rays(CAMERA, &host).unwrap();
        assert_eq!(device.log().allocations.last().unwrap(), &vec![0, 0, 1, 1]);

        tracer.add_shared_mesh(11, &triangle()).unwrap();
        tracer.add_shared_mesh(12, &triangle()).unwrap();
        tracer.trace_rays(CAMERA, &host).unwrap();

        let log = device.log();
        assert_eq!(log.allocations.last().unwrap(), &vec![0, 0, 3, 3]);
        assert_eq!(log.allocations.len(), 2);
        let attribute_writes: Vec<_> = log.writes.iter().filter(|write| write.count == 3).collect();
        assert_eq!(attribute_writes.len(), 2);
    }

    #[test]
    fn test_inaccessible_texture_still_dispatches() {
        let (mut tracer, device) = ready_scene("no-texture");
        let host = TestHost {
            texture: None,
            ..TestHost::recording()
        };

        assert_eq!(tracer.trace_rays(CAMERA, &host).unwrap(), TraceOutcome::Dispatched);
        let log = device.log();
        assert_eq!(log.traces.len(), 1);
        assert!(log.copies.is_empty());
    }

    #[test]
    fn test_exhausted_descriptor_pool_fails_without_dispatch() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = DummyDevice::new();
        let config = RayTracerConfig::default()
            .with_shader_folder(write_test_shaders("pool-exhausted"))
            .with_max_render_targets(1);
        let mut tracer = RayTracer::new(Box::new(device.clone()), config).unwrap();

        let mesh = tracer.add_shared_mesh(10, &triangle()).unwrap();
        tracer.add_tlas_instance(100, mesh, &IDENTITY_4X4).unwrap();
        tracer.build_tlas().unwrap();
        for camera in [CAMERA, CAMERA + 1] {
            tracer.set_render_target(camera, 4, 64, 32, TEXTURE).unwrap();
            assert!(tracer.update_camera(camera, &camera_param()).unwrap());
        }

        let host = TestHost::recording();
        assert_eq!(tracer.trace_rays(CAMERA, &host).unwrap(), TraceOutcome::Dispatched);

        let err = tracer.trace_rays(CAMERA + 1, &host).unwrap_err();
        assert!(matches!(err, RtError::DescriptorPoolExhausted));
        assert_eq!(err.kind(), ErrorKind::ResourceCreation);
        assert_eq!(device.log().traces.len(), 1);

        // The first camera keeps its sets and still traces.
        assert_eq!(tracer.trace_rays(CAMERA, &host).unwrap(), TraceOutcome::Dispatched);
        assert_eq!(device.log().traces.len(), 2);
    }

    #[test]
    fn test_single_triangle_scenario() {
        let (mut tracer, device) = tracer("scenario");
        let host = TestHost::recording();

        assert_eq!(tracer.add_shared_mesh(10, &triangle()).unwrap(), 0);
        assert_eq!(tracer.add_tlas_instance(100, 0, &IDENTITY_4X4).unwrap(), 0);
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Built { instance_count: 1 });
        let tlas = tracer.tlas().unwrap().raw();
        assert_eq!(device.log().builds.last().unwrap().mode, BuildMode::Build);

        tracer.update_tlas_instance_transform(0, &translation(5.0)).unwrap();
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Updated { instance_count: 1 });
        assert_eq!(tracer.tlas().unwrap().raw(), tlas);
        assert!(tracer.tlas().unwrap().device_address().is_some());

        tracer.set_render_target(CAMERA, 4, 64, 32, TEXTURE).unwrap();
        tracer.update_camera(CAMERA, &camera_param()).unwrap();
        assert_eq!(tracer.trace_rays(CAMERA, &host).unwrap(), TraceOutcome::Dispatched);

        tracer.remove_tlas_instance(0).unwrap();
        assert_eq!(tracer.build_tlas().unwrap(), TlasBuildOutcome::Released);
        assert!(tracer.tlas().is_none());
        assert_eq!(
            tracer.trace_rays(CAMERA, &host).unwrap(),
            TraceOutcome::Skipped(NotReady::NoTlas)
        );
        assert_eq!(device.log().traces.len(), 1);
    }

    #[test]
    fn test_drop_releases_device_objects() {
        let (mut tracer, device) = ready_scene("drop");
        tracer.trace_rays(CAMERA, &TestHost::recording()).unwrap();
        drop(tracer);

        let log = device.log();
        assert_eq!(log.pipelines_destroyed, 1);
        assert_eq!(log.layouts_destroyed, 4);
        assert_eq!(log.pools_destroyed, 1);
    }
}
