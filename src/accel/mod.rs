//! Scene acceleration pipeline
//!
//! [`AccelScene`] drives the whole path from scene description to traceable
//! buffers: pack geometry, read packed positions back to the host, feed the
//! external builder, upload the resulting BVH blobs, and keep instances and
//! materials in sync frame to frame. Every stage is asynchronous and
//! advanced by [`AccelScene::update`]; [`AccelScene::can_render`] reports
//! when the trace kernel has everything it needs.

pub mod builder;
pub mod client;
pub mod instances;
pub mod pack;
pub mod readback;

pub use builder::{AccelBuilder, BuildPoll, DummyBuilder, VertexSpan};
pub use client::{BlasOffsets, BuilderClient};
pub use instances::{GpuInstanceRecord, InstanceTracker};
pub use pack::{MeshRecord, PackedScene};
pub use readback::{ReadbackCoordinator, ReadbackState};

use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;

use crate::backend::traits::{BufferHandle, DeviceError, TraceDevice};
use crate::backend::types::TraceFeatures;
use crate::resources::encoder::MaterialEncoder;
use crate::resources::material::MaterialDescriptor;
use crate::scene::SceneObject;
use crate::GeometryMode;

/// Acceleration pipeline error type
#[derive(Error, Debug)]
pub enum AccelError {
    #[error("Scene contains no geometry")]
    NoGeometry,
    #[error("Acceleration build failed: {0}")]
    Build(String),
    #[error("Position readback failed: {0}")]
    Readback(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// What changed during one [`AccelScene::update`] call.
///
/// `structure_updated` means a new BLAS batch or TLAS landed on the device;
/// accumulated samples were traced against stale geometry and the renderer
/// must restart.
#[derive(Debug, Default, Clone, Copy)]
pub struct AccelUpdate {
    pub structure_updated: bool,
    pub became_ready: bool,
}

/// Buffers and flags the trace kernel binds for one frame.
#[derive(Debug, Clone)]
pub struct SceneBindings {
    pub bvh_nodes: BufferHandle,
    pub bvh_triangles: BufferHandle,
    pub triangle_attributes: BufferHandle,
    pub materials: BufferHandle,
    pub tlas_nodes: Option<BufferHandle>,
    pub tlas_indices: Option<BufferHandle>,
    pub tlas_instances: Option<BufferHandle>,
    pub texture_descriptors: Option<BufferHandle>,
    pub texture_data: Option<BufferHandle>,
    pub instance_count: u32,
    pub features: TraceFeatures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildPhase {
    Idle,
    AwaitingReadback,
    Building,
}

/// Owns the acceleration state of one scene.
pub struct AccelScene {
    mode: GeometryMode,
    packed: Option<PackedScene>,
    readback: ReadbackCoordinator,
    client: BuilderClient,
    tracker: InstanceTracker,
    encoder: MaterialEncoder,
    materials: Vec<Arc<MaterialDescriptor>>,
    material_indices: Vec<i32>,
    instance_buffer: Option<BufferHandle>,
    phase: BuildPhase,
}

impl AccelScene {
    pub fn new(mode: GeometryMode) -> Self {
        Self {
            mode,
            packed: None,
            readback: ReadbackCoordinator::new(),
            client: BuilderClient::new(),
            tracker: InstanceTracker::new(),
            encoder: MaterialEncoder::new(),
            materials: Vec::new(),
            material_indices: Vec::new(),
            instance_buffer: None,
            phase: BuildPhase::Idle,
        }
    }

    pub fn mode(&self) -> GeometryMode {
        self.mode
    }

    /// Structural rebuild: pack all geometry, encode materials and textures,
    /// and start the readback that feeds the builder. Rendering falls back
    /// to pass-through until the new structures land.
    pub fn rebuild<D: TraceDevice>(
        &mut self,
        device: &mut D,
        objects: &[SceneObject],
    ) -> Result<(), AccelError> {
        if let Some(packed) = self.packed.take() {
            packed.release(device);
        }

        self.collect_materials(objects);
        let packed = pack::pack_scene(device, objects, &self.material_indices, self.mode)?;
        self.encoder.encode(device, &self.materials, true)?;
        self.tracker.rebuild(objects, &packed, &self.material_indices);

        self.readback.request(device, packed.positions)?;
        self.packed = Some(packed);
        self.phase = BuildPhase::AwaitingReadback;
        info!(
            "Scene rebuild started: {} objects, {} instances",
            objects.len(),
            self.tracker.len()
        );
        Ok(())
    }

    /// Advance the pipeline one frame: poll the readback, the BLAS batch and
    /// the TLAS, and sync instance transforms.
    pub fn update<B: AccelBuilder, D: TraceDevice>(
        &mut self,
        device: &mut D,
        builder: &mut B,
        objects: &[SceneObject],
    ) -> Result<AccelUpdate, AccelError> {
        let was_ready = self.can_render();
        let mut update = AccelUpdate::default();

        if self.phase == BuildPhase::AwaitingReadback {
            match self.readback.poll(device) {
                ReadbackState::Ready(positions) => {
                    let packed = self
                        .packed
                        .as_ref()
                        .ok_or_else(|| AccelError::Internal("readback without scene".to_string()))?;
                    // Instanced: one BLAS per unique mesh. Baked: everything
                    // is already in world space, one BLAS over the lot.
                    let spans = match self.mode {
                        GeometryMode::Instanced => packed
                            .meshes
                            .iter()
                            .map(|mesh| {
                                VertexSpan::new(
                                    positions.clone(),
                                    mesh.triangle_offset,
                                    mesh.triangle_count,
                                )
                            })
                            .collect(),
                        GeometryMode::Baked => {
                            vec![VertexSpan::new(positions.clone(), 0, packed.total_triangles)]
                        }
                    };
                    self.client.begin_blas_builds(builder, spans);
                    self.phase = BuildPhase::Building;
                }
                ReadbackState::Failed(message) => {
                    self.phase = BuildPhase::Idle;
                    return Err(AccelError::Readback(message));
                }
                ReadbackState::Pending | ReadbackState::Idle => {}
            }
        }

        if self.client.poll_blas_builds(builder, device)? {
            self.phase = BuildPhase::Idle;
            match self.mode {
                GeometryMode::Instanced => {
                    self.upload_instances(device)?;
                    self.client.request_tlas(builder, self.tracker.tlas_records());
                }
                GeometryMode::Baked => {
                    update.structure_updated = true;
                }
            }
        }

        if self.mode == GeometryMode::Instanced && self.client.poll_tlas(builder, device)? {
            update.structure_updated = true;
        }

        self.sync_instances(device, builder, objects)?;

        update.became_ready = !was_ready && self.can_render();
        Ok(update)
    }

    /// Per-frame transform sync. Moved instances are patched in place in
    /// the instance buffer and a TLAS rebuild is requested.
    ///
    /// Skipped while a structural rebuild is in flight: the tracker already
    /// reflects the new scene but the uploaded offsets still belong to the
    /// previous BLAS batch. Moves are picked up on the first sync after the
    /// new batch lands.
    fn sync_instances<B: AccelBuilder, D: TraceDevice>(
        &mut self,
        device: &mut D,
        builder: &mut B,
        objects: &[SceneObject],
    ) -> Result<(), AccelError> {
        if self.phase != BuildPhase::Idle {
            return Ok(());
        }
        let moved = self.tracker.sync(objects);
        if moved.is_empty() {
            return Ok(());
        }
        if self.mode == GeometryMode::Baked {
            warn!("Instance moved in baked mode; geometry stays where it was packed");
            return Ok(());
        }
        if !self.client.is_blas_ready() {
            return Ok(());
        }

        let Some(packed) = self.packed.as_ref() else {
            return Ok(());
        };
        if let Some(buffer) = self.instance_buffer {
            let records = self
                .tracker
                .gpu_records(&packed.meshes, self.client.blas_offsets());
            let stride = std::mem::size_of::<GpuInstanceRecord>() as u64;
            for &index in &moved {
                device.write_buffer(
                    buffer,
                    index as u64 * stride,
                    bytemuck::bytes_of(&records[index]),
                );
            }
        }
        debug!("{} instances moved, requesting TLAS rebuild", moved.len());
        self.client.request_tlas(builder, self.tracker.tlas_records());
        Ok(())
    }

    fn upload_instances<D: TraceDevice>(&mut self, device: &mut D) -> Result<(), AccelError> {
        let Some(packed) = self.packed.as_ref() else {
            return Ok(());
        };
        let records = self
            .tracker
            .gpu_records(&packed.meshes, self.client.blas_offsets());
        if records.is_empty() {
            return Ok(());
        }
        self.instance_buffer = Some(client::upload(
            device,
            self.instance_buffer.take(),
            "instances",
            bytemuck::cast_slice(&records),
        )?);
        Ok(())
    }

    /// Re-encode materials after their properties changed. Set
    /// `update_textures` when texture assignments changed too; plain factor
    /// edits skip the texture pass.
    ///
    /// The caller must restart accumulation afterwards.
    pub fn update_materials<D: TraceDevice>(
        &mut self,
        device: &mut D,
        objects: &[SceneObject],
        update_textures: bool,
    ) -> Result<(), AccelError> {
        self.collect_materials(objects);
        self.encoder
            .encode(device, &self.materials, update_textures)?;
        Ok(())
    }

    fn collect_materials(&mut self, objects: &[SceneObject]) {
        self.materials.clear();
        self.material_indices.clear();
        for object in objects {
            let index = match self
                .materials
                .iter()
                .position(|m| Arc::ptr_eq(m, &object.material))
            {
                Some(index) => index,
                None => {
                    self.materials.push(object.material.clone());
                    self.materials.len() - 1
                }
            };
            self.material_indices.push(index as i32);
        }
    }

    /// Whether the trace kernel has a complete set of buffers to run with.
    pub fn can_render(&self) -> bool {
        let structures = match self.mode {
            GeometryMode::Instanced => {
                self.client.is_blas_ready()
                    && self.client.is_tlas_ready()
                    && self.instance_buffer.is_some()
            }
            GeometryMode::Baked => self.client.is_blas_ready(),
        };
        self.packed.is_some() && structures && self.encoder.material_buffer().is_some()
    }

    /// The frame's bindings, or `None` while the pipeline is not ready.
    pub fn bindings(&self) -> Option<SceneBindings> {
        if !self.can_render() {
            return None;
        }
        let packed = self.packed.as_ref()?;
        let (bvh_nodes, bvh_triangles) = self.client.blas_buffers()?;
        let materials = self.encoder.material_buffer()?;

        let mut features = TraceFeatures::NONE;
        let (tlas_nodes, tlas_indices, tlas_instances) = match self.mode {
            GeometryMode::Instanced => {
                features = features | TraceFeatures::HAS_TLAS;
                let (nodes, indices) = self.client.tlas_buffers()?;
                (Some(nodes), Some(indices), self.instance_buffer)
            }
            GeometryMode::Baked => (None, None, None),
        };
        let (texture_descriptors, texture_data) = match self.encoder.texture_buffers() {
            Some((descriptors, data)) => {
                features = features | TraceFeatures::HAS_TEXTURES;
                (Some(descriptors), Some(data))
            }
            None => (None, None),
        };

        Some(SceneBindings {
            bvh_nodes,
            bvh_triangles,
            triangle_attributes: packed.attributes,
            materials,
            tlas_nodes,
            tlas_indices,
            tlas_instances,
            texture_descriptors,
            texture_data,
            instance_count: self.tracker.len() as u32,
            features,
        })
    }

    /// Tear down in dependency order: drain the readback and any in-flight
    /// builds first, then free device buffers. Builds cannot be cancelled,
    /// so shutdown waits for builder forward progress rather than orphaning
    /// builder-side allocations.
    pub fn shutdown<B: AccelBuilder, D: TraceDevice>(&mut self, device: &mut D, builder: &mut B) {
        self.readback.drain(device);

        self.client.release(builder, device);
        self.encoder.release(device);
        if let Some(packed) = self.packed.take() {
            packed.release(device);
        }
        if let Some(buffer) = self.instance_buffer.take() {
            device.destroy_buffer(buffer);
        }
        self.phase = BuildPhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::resources::mesh::MeshData;
    use glam::{Mat4, Vec3};

    fn test_objects() -> Vec<SceneObject> {
        let cube = Arc::new(MeshData::cube());
        let material = Arc::new(MaterialDescriptor::new("shared"));
        (0..3)
            .map(|i| {
                SceneObject::new(
                    cube.clone(),
                    material.clone(),
                    Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, 0.0)),
                )
            })
            .collect()
    }

    fn drive_to_ready(
        scene: &mut AccelScene,
        device: &mut DummyDevice,
        builder: &mut DummyBuilder,
        objects: &[SceneObject],
    ) -> u32 {
        for frame in 0..32 {
            let update = scene.update(device, builder, objects).unwrap();
            if update.became_ready {
                return frame;
            }
        }
        panic!("pipeline never became ready");
    }

    #[test]
    fn test_instanced_pipeline_becomes_ready() {
        let mut device = DummyDevice::new();
        let mut builder = DummyBuilder::new();
        let mut scene = AccelScene::new(GeometryMode::Instanced);
        let objects = test_objects();

        scene.rebuild(&mut device, &objects).unwrap();
        assert!(!scene.can_render());

        drive_to_ready(&mut scene, &mut device, &mut builder, &objects);
        assert!(scene.can_render());

        // one unique mesh, one BLAS build, one TLAS build
        assert_eq!(builder.blas_builds(), 1);
        assert_eq!(builder.tlas_builds(), 1);

        let bindings = scene.bindings().unwrap();
        assert_eq!(bindings.instance_count, 3);
        assert!(bindings.features.contains(TraceFeatures::HAS_TLAS));
        assert!(bindings.tlas_nodes.is_some());

        scene.shutdown(&mut device, &mut builder);
        assert_eq!(builder.live_builds(), 0);
    }

    #[test]
    fn test_baked_pipeline_skips_tlas() {
        let mut device = DummyDevice::new();
        let mut builder = DummyBuilder::new();
        let mut scene = AccelScene::new(GeometryMode::Baked);
        let objects = test_objects();

        scene.rebuild(&mut device, &objects).unwrap();
        drive_to_ready(&mut scene, &mut device, &mut builder, &objects);

        // one BLAS over all baked geometry, no TLAS
        assert_eq!(builder.blas_builds(), 1);
        assert_eq!(builder.tlas_builds(), 0);
        let bindings = scene.bindings().unwrap();
        assert!(!bindings.features.contains(TraceFeatures::HAS_TLAS));
        assert!(bindings.tlas_nodes.is_none());

        scene.shutdown(&mut device, &mut builder);
    }

    #[test]
    fn test_static_frames_make_no_builder_calls() {
        let mut device = DummyDevice::new();
        let mut builder = DummyBuilder::new();
        let mut scene = AccelScene::new(GeometryMode::Instanced);
        let objects = test_objects();

        scene.rebuild(&mut device, &objects).unwrap();
        drive_to_ready(&mut scene, &mut device, &mut builder, &objects);

        let blas_before = builder.blas_builds();
        let tlas_before = builder.tlas_builds();
        for _ in 0..10 {
            let update = scene.update(&mut device, &mut builder, &objects).unwrap();
            assert!(!update.structure_updated);
        }
        assert_eq!(builder.blas_builds(), blas_before);
        assert_eq!(builder.tlas_builds(), tlas_before);

        scene.shutdown(&mut device, &mut builder);
    }

    #[test]
    fn test_moving_one_instance_rebuilds_tlas_once() {
        let mut device = DummyDevice::new();
        let mut builder = DummyBuilder::new();
        let mut scene = AccelScene::new(GeometryMode::Instanced);
        let mut objects = test_objects();

        scene.rebuild(&mut device, &objects).unwrap();
        drive_to_ready(&mut scene, &mut device, &mut builder, &objects);
        let tlas_before = builder.tlas_builds();

        objects[1].transform = Mat4::from_translation(Vec3::new(2.0, 3.0, 0.0));
        let mut structure_updates = 0;
        for _ in 0..8 {
            let update = scene.update(&mut device, &mut builder, &objects).unwrap();
            if update.structure_updated {
                structure_updates += 1;
            }
        }

        assert_eq!(builder.tlas_builds(), tlas_before + 1);
        assert_eq!(builder.blas_builds(), 1);
        assert_eq!(structure_updates, 1);

        scene.shutdown(&mut device, &mut builder);
    }

    #[test]
    fn test_move_during_rebuild_waits_for_new_offsets() {
        let mut device = DummyDevice::new();
        device.set_readback_latency(2);
        let mut builder = DummyBuilder::new();
        let mut scene = AccelScene::new(GeometryMode::Instanced);
        let mut objects = test_objects();

        scene.rebuild(&mut device, &objects).unwrap();
        drive_to_ready(&mut scene, &mut device, &mut builder, &objects);

        // grow to a second unique mesh and rebuild
        let plane = Arc::new(MeshData::plane(4.0, 4.0));
        let material = objects[0].material.clone();
        objects.push(SceneObject::new(plane, material, Mat4::IDENTITY));
        scene.rebuild(&mut device, &objects).unwrap();

        // moved while the new readback is still pending; nothing may be
        // patched or rebuilt against the previous batch's offsets
        objects[3].transform = Mat4::from_translation(Vec3::Y);
        let tlas_before = builder.tlas_builds();
        scene.update(&mut device, &mut builder, &objects).unwrap();
        assert_eq!(builder.tlas_builds(), tlas_before);

        for _ in 0..16 {
            scene.update(&mut device, &mut builder, &objects).unwrap();
        }
        assert!(scene.can_render());
        let bindings = scene.bindings().unwrap();
        assert_eq!(bindings.instance_count, 4);
        // one BLAS per unique mesh in the second batch
        assert_eq!(builder.blas_builds(), 3);

        scene.shutdown(&mut device, &mut builder);
    }

    #[test]
    fn test_material_update_reuses_texture_buffers() {
        let mut device = DummyDevice::new();
        let mut builder = DummyBuilder::new();
        let mut scene = AccelScene::new(GeometryMode::Instanced);
        let objects = test_objects();

        scene.rebuild(&mut device, &objects).unwrap();
        drive_to_ready(&mut scene, &mut device, &mut builder, &objects);

        let copies_before = device.texture_copy_dispatches();
        scene.update_materials(&mut device, &objects, false).unwrap();
        assert_eq!(device.texture_copy_dispatches(), copies_before);

        scene.shutdown(&mut device, &mut builder);
    }
}
