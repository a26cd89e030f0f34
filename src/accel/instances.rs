//! Instance tracking
//!
//! Maintains the per-instance view of the scene between structural
//! rebuilds: which packed mesh each object points at, its material, its
//! transform and world bounds. The per-frame sync path compares transforms
//! exactly, so a static scene costs one matrix compare per instance and no
//! uploads.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::accel::builder::TlasInstanceRecord;
use crate::accel::client::BlasOffsets;
use crate::accel::pack::{MeshRecord, PackedScene};
use crate::resources::mesh::Aabb;
use crate::scene::SceneObject;

/// One tracked instance.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Index into the packed mesh directory.
    pub mesh_index: u32,
    pub material_index: u32,
    pub transform: Mat4,
    pub world_bounds: Aabb,
    local_bounds: Aabb,
}

/// Per-instance GPU record indexed by the trace kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuInstanceRecord {
    pub transform: Mat4,
    pub inverse_transform: Mat4,
    pub blas_node_offset: u32,
    pub blas_triangle_offset: u32,
    /// First triangle of the instance's mesh in the attribute buffer.
    pub attribute_offset: u32,
    pub material_index: u32,
}

/// Tracks instances across frames.
pub struct InstanceTracker {
    instances: Vec<Instance>,
}

impl InstanceTracker {
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Full rescan after a structural rebuild. Objects whose mesh did not
    /// survive packing (empty meshes) produce no instance.
    pub fn rebuild(
        &mut self,
        objects: &[SceneObject],
        packed: &PackedScene,
        material_indices: &[i32],
    ) {
        debug_assert_eq!(objects.len(), material_indices.len());

        self.instances.clear();
        for (object, &material_index) in objects.iter().zip(material_indices) {
            let Some(mesh_index) = packed.mesh_index(&object.mesh) else {
                continue;
            };
            let local_bounds = object.mesh.local_bounds;
            self.instances.push(Instance {
                mesh_index,
                material_index: material_index.max(0) as u32,
                transform: object.transform,
                world_bounds: local_bounds.transformed(&object.transform),
                local_bounds,
            });
        }
    }

    /// Per-frame transform sync. Compares matrices exactly and updates
    /// changed instances in place. Returns the indices that moved.
    ///
    /// Assumes the object list is structurally unchanged since the last
    /// rebuild; additions and removals require [`InstanceTracker::rebuild`].
    pub fn sync(&mut self, objects: &[SceneObject]) -> Vec<usize> {
        let mut moved = Vec::new();
        let mut instance_index = 0usize;
        for object in objects {
            if object.mesh.triangle_count() == 0 {
                continue;
            }
            let Some(instance) = self.instances.get_mut(instance_index) else {
                break;
            };
            if instance.transform != object.transform {
                instance.transform = object.transform;
                instance.world_bounds = instance.local_bounds.transformed(&object.transform);
                moved.push(instance_index);
            }
            instance_index += 1;
        }
        moved
    }

    /// GPU records for the trace kernel, resolved against the BLAS offsets
    /// of each packed mesh.
    pub fn gpu_records(
        &self,
        meshes: &[MeshRecord],
        offsets: &[BlasOffsets],
    ) -> Vec<GpuInstanceRecord> {
        self.instances
            .iter()
            .map(|instance| {
                let mesh = &meshes[instance.mesh_index as usize];
                let blas = &offsets[instance.mesh_index as usize];
                GpuInstanceRecord {
                    transform: instance.transform,
                    inverse_transform: instance.transform.inverse(),
                    blas_node_offset: blas.node_offset,
                    blas_triangle_offset: blas.triangle_offset,
                    attribute_offset: mesh.triangle_offset,
                    material_index: instance.material_index,
                }
            })
            .collect()
    }

    /// TLAS input records for the builder. Each instance references its BLAS
    /// by batch index; the builder never sees buffer offsets.
    pub fn tlas_records(&self) -> Vec<TlasInstanceRecord> {
        self.instances
            .iter()
            .map(|instance| TlasInstanceRecord {
                transform: instance.transform,
                inverse_transform: instance.transform.inverse(),
                bounds_min: instance.world_bounds.min,
                blas_index: instance.mesh_index,
                bounds_max: instance.world_bounds.max,
                _padding: 0,
            })
            .collect()
    }
}

impl Default for InstanceTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::accel::pack::pack_scene;
    use crate::resources::material::MaterialDescriptor;
    use crate::resources::mesh::MeshData;
    use crate::GeometryMode;
    use glam::Vec3;
    use std::sync::Arc;

    fn scene() -> (DummyDevice, Vec<SceneObject>, PackedScene) {
        let mut device = DummyDevice::new();
        let cube = Arc::new(MeshData::cube());
        let material = Arc::new(MaterialDescriptor::new("m"));
        let objects: Vec<_> = (0..3)
            .map(|i| {
                SceneObject::new(
                    cube.clone(),
                    material.clone(),
                    Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, 0.0)),
                )
            })
            .collect();
        let packed =
            pack_scene(&mut device, &objects, &[0, 0, 0], GeometryMode::Instanced).unwrap();
        (device, objects, packed)
    }

    #[test]
    fn test_rebuild_tracks_all_objects() {
        let (_, objects, packed) = scene();
        let mut tracker = InstanceTracker::new();
        tracker.rebuild(&objects, &packed, &[0, 0, 0]);
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.instances()[2].mesh_index, 0);
        assert_eq!(
            tracker.instances()[2].world_bounds.center(),
            Vec3::new(4.0, 0.0, 0.0)
        );
    }

    #[test]
    fn test_sync_detects_single_moved_instance() {
        let (_, mut objects, packed) = scene();
        let mut tracker = InstanceTracker::new();
        tracker.rebuild(&objects, &packed, &[0, 0, 0]);

        assert!(tracker.sync(&objects).is_empty());

        objects[1].transform = Mat4::from_translation(Vec3::new(2.0, 1.0, 0.0));
        assert_eq!(tracker.sync(&objects), vec![1]);
        assert_eq!(
            tracker.instances()[1].world_bounds.center(),
            Vec3::new(2.0, 1.0, 0.0)
        );

        // second sync with no further movement is clean
        assert!(tracker.sync(&objects).is_empty());
    }

    #[test]
    fn test_records_resolve_offsets() {
        let (_, objects, packed) = scene();
        let mut tracker = InstanceTracker::new();
        tracker.rebuild(&objects, &packed, &[0, 0, 0]);

        let offsets = vec![BlasOffsets {
            node_offset: 7,
            triangle_offset: 11,
        }];
        let records = tracker.gpu_records(&packed.meshes, &offsets);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].blas_node_offset, 7);
        assert_eq!(records[0].blas_triangle_offset, 11);
        assert_eq!(records[0].attribute_offset, 0);

        let tlas = tracker.tlas_records();
        assert_eq!(tlas.len(), 3);
        assert_eq!(tlas[2].blas_index, 0);
        assert_eq!(tlas[2].bounds_min, Vec3::new(3.5, -0.5, -0.5));
    }

    #[test]
    fn test_gpu_record_size() {
        assert_eq!(std::mem::size_of::<GpuInstanceRecord>(), 144);
    }
}
