//! Scene geometry packing
//!
//! Uploads each mesh's native interleaved buffers, then runs the pack kernel
//! to produce two global buffers: homogeneous world- or local-space
//! positions for the builder, and fixed-stride triangle attributes for the
//! trace kernel. Native staging buffers are destroyed as soon as their
//! dispatch is recorded.

use log::{debug, warn};
use std::sync::Arc;

use crate::accel::AccelError;
use crate::backend::traits::{BufferHandle, TraceDevice};
use crate::backend::types::{
    BufferDescriptor, MeshPackDispatch, MeshPackFeatures, MeshPackParams, MESH_PACK_GROUP_SIZE,
};
use crate::resources::mesh::{
    IndexData, MeshData, VertexAttributeKind, TRIANGLE_ATTRIBUTE_SIZE, VERTEX_POSITION_SIZE,
};
use crate::scene::SceneObject;
use crate::GeometryMode;

/// One packed entry in the global buffers.
#[derive(Debug, Clone)]
pub struct MeshRecord {
    pub mesh: Arc<MeshData>,
    /// First triangle within the global buffers.
    pub triangle_offset: u32,
    pub triangle_count: u32,
}

/// The packed scene: global buffers plus the per-mesh directory.
///
/// In instanced mode `meshes` holds one record per unique mesh packed in
/// local space; in baked mode one record per object, pre-transformed to
/// world space with its material index baked into the attributes.
pub struct PackedScene {
    pub positions: BufferHandle,
    pub attributes: BufferHandle,
    pub meshes: Vec<MeshRecord>,
    pub total_triangles: u32,
}

impl PackedScene {
    /// Index into `meshes` for an object, by mesh identity (instanced mode).
    pub fn mesh_index(&self, mesh: &Arc<MeshData>) -> Option<u32> {
        self.meshes
            .iter()
            .position(|record| Arc::ptr_eq(&record.mesh, mesh))
            .map(|index| index as u32)
    }

    pub fn release<D: TraceDevice>(&self, device: &mut D) {
        device.destroy_buffer(self.positions);
        device.destroy_buffer(self.attributes);
    }
}

/// Pack all scene geometry into global buffers.
///
/// Empty meshes are skipped with a warning; a scene with no triangles at
/// all is an error, since nothing downstream can proceed.
pub fn pack_scene<D: TraceDevice>(
    device: &mut D,
    objects: &[SceneObject],
    material_indices: &[i32],
    mode: GeometryMode,
) -> Result<PackedScene, AccelError> {
    debug_assert_eq!(objects.len(), material_indices.len());

    // (mesh, transform, baked material index) per pack dispatch
    let mut entries: Vec<(Arc<MeshData>, glam::Mat4, i32)> = Vec::new();
    match mode {
        GeometryMode::Instanced => {
            for object in objects {
                if !entries.iter().any(|(mesh, _, _)| Arc::ptr_eq(mesh, &object.mesh)) {
                    entries.push((object.mesh.clone(), glam::Mat4::IDENTITY, -1));
                }
            }
        }
        GeometryMode::Baked => {
            for (object, &material_index) in objects.iter().zip(material_indices) {
                entries.push((object.mesh.clone(), object.transform, material_index));
            }
        }
    }

    let mut meshes = Vec::with_capacity(entries.len());
    let mut total_triangles = 0u32;
    for (mesh, _, _) in &entries {
        let triangle_count = mesh.triangle_count();
        if triangle_count == 0 {
            warn!("Skipping empty mesh '{}'", mesh.name);
            continue;
        }
        meshes.push(MeshRecord {
            mesh: mesh.clone(),
            triangle_offset: total_triangles,
            triangle_count,
        });
        total_triangles += triangle_count;
    }
    if total_triangles == 0 {
        return Err(AccelError::NoGeometry);
    }

    let positions = device.create_buffer(&BufferDescriptor::storage(
        "packed positions",
        total_triangles as u64 * 3 * VERTEX_POSITION_SIZE,
    ))?;
    let attributes = device.create_buffer(&BufferDescriptor::storage(
        "triangle attributes",
        total_triangles as u64 * TRIANGLE_ATTRIBUTE_SIZE,
    ))?;

    let mut record_iter = meshes.iter().enumerate();
    for (mesh, transform, material_index) in &entries {
        if mesh.triangle_count() == 0 {
            continue;
        }
        let (index, record) = record_iter
            .next()
            .ok_or_else(|| AccelError::Internal("mesh directory out of sync".to_string()))?;
        debug!(
            "Packing mesh {}/{}: '{}' ({} triangles)",
            index + 1,
            meshes.len(),
            mesh.name,
            record.triangle_count
        );
        pack_mesh(
            device,
            mesh,
            *transform,
            *material_index,
            record.triangle_offset,
            positions,
            attributes,
        )?;
    }

    debug!(
        "Packed {} meshes, {} triangles",
        meshes.len(),
        total_triangles
    );
    Ok(PackedScene {
        positions,
        attributes,
        meshes,
        total_triangles,
    })
}

fn pack_mesh<D: TraceDevice>(
    device: &mut D,
    mesh: &MeshData,
    transform: glam::Mat4,
    material_index: i32,
    output_start: u32,
    positions: BufferHandle,
    attributes: BufferHandle,
) -> Result<(), AccelError> {
    let layout = &mesh.layout;
    let mut features = MeshPackFeatures::NONE;
    if layout.has(VertexAttributeKind::Normal) {
        features = features | MeshPackFeatures::HAS_NORMALS;
    }
    if layout.has(VertexAttributeKind::TexCoord) {
        features = features | MeshPackFeatures::HAS_UVS;
    }
    if layout.has(VertexAttributeKind::Tangent) {
        features = features | MeshPackFeatures::HAS_TANGENTS;
    }

    let vertex_buffer = device.create_buffer_init(
        &BufferDescriptor::storage(&mesh.name, mesh.vertex_data.len() as u64),
        &mesh.vertex_data,
    )?;
    let index_buffer = match &mesh.indices {
        Some(indices) => {
            features = features | MeshPackFeatures::HAS_INDEX_BUFFER;
            if matches!(indices, IndexData::U32(_)) {
                features = features | MeshPackFeatures::INDICES_32_BIT;
            }
            Some(device.create_buffer_init(
                &BufferDescriptor::storage(&mesh.name, indices.as_bytes().len() as u64),
                indices.as_bytes(),
            )?)
        }
        None => None,
    };

    let triangle_count = mesh.triangle_count();
    let result = device.dispatch_mesh_pack(&MeshPackDispatch {
        vertex_buffer,
        index_buffer,
        positions,
        attributes,
        params: MeshPackParams {
            local_to_world: transform,
            vertex_stride: layout.stride(),
            position_offset: layout.locate(VertexAttributeKind::Position).unwrap_or(0),
            normal_offset: layout.locate(VertexAttributeKind::Normal).unwrap_or(0),
            tangent_offset: layout.locate(VertexAttributeKind::Tangent).unwrap_or(0),
            uv_offset: layout.locate(VertexAttributeKind::TexCoord).unwrap_or(0),
            triangle_count,
            output_start,
            material_index,
            features: features.bits(),
            _padding: [0; 3],
        },
        group_count: triangle_count.div_ceil(MESH_PACK_GROUP_SIZE),
    });

    device.destroy_buffer(vertex_buffer);
    if let Some(buffer) = index_buffer {
        device.destroy_buffer(buffer);
    }
    result.map_err(AccelError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyDevice;
    use crate::resources::material::MaterialDescriptor;
    use glam::{Mat4, Vec3};

    fn object(mesh: &Arc<MeshData>, transform: Mat4) -> SceneObject {
        SceneObject::new(
            mesh.clone(),
            Arc::new(MaterialDescriptor::new("m")),
            transform,
        )
    }

    #[test]
    fn test_instanced_mode_dedupes_shared_meshes() {
        let mut device = DummyDevice::new();
        let cube = Arc::new(MeshData::cube());
        let objects: Vec<_> = (0..3)
            .map(|i| {
                object(
                    &cube,
                    Mat4::from_translation(Vec3::new(i as f32 * 2.0, 0.0, 0.0)),
                )
            })
            .collect();

        let packed =
            pack_scene(&mut device, &objects, &[0, 0, 0], GeometryMode::Instanced).unwrap();
        assert_eq!(packed.meshes.len(), 1);
        assert_eq!(packed.total_triangles, 12);
        assert_eq!(device.mesh_pack_dispatches(), 1);
        assert_eq!(packed.mesh_index(&cube), Some(0));

        // staging buffers released; only the two globals remain
        assert_eq!(device.buffer_count(), 2);
        packed.release(&mut device);
    }

    #[test]
    fn test_baked_mode_packs_per_object() {
        let mut device = DummyDevice::new();
        let cube = Arc::new(MeshData::cube());
        let objects = vec![
            object(&cube, Mat4::IDENTITY),
            object(&cube, Mat4::from_translation(Vec3::X * 5.0)),
        ];

        let packed = pack_scene(&mut device, &objects, &[0, 1], GeometryMode::Baked).unwrap();
        assert_eq!(packed.meshes.len(), 2);
        assert_eq!(packed.total_triangles, 24);
        assert_eq!(packed.meshes[1].triangle_offset, 12);
        assert_eq!(device.mesh_pack_dispatches(), 2);
        packed.release(&mut device);
    }

    #[test]
    fn test_empty_mesh_skipped() {
        let mut device = DummyDevice::new();
        let cube = Arc::new(MeshData::cube());
        let mut empty = MeshData::cube();
        empty.vertex_data.clear();
        empty.indices = Some(IndexData::U32(Vec::new()));
        let empty = Arc::new(empty);

        let objects = vec![object(&empty, Mat4::IDENTITY), object(&cube, Mat4::IDENTITY)];
        let packed =
            pack_scene(&mut device, &objects, &[0, 0], GeometryMode::Instanced).unwrap();
        assert_eq!(packed.meshes.len(), 1);
        assert_eq!(packed.total_triangles, 12);
        packed.release(&mut device);
    }

    #[test]
    fn test_no_geometry_is_fatal() {
        let mut device = DummyDevice::new();
        let mut empty = MeshData::cube();
        empty.vertex_data.clear();
        empty.indices = Some(IndexData::U32(Vec::new()));

        let objects = vec![object(&Arc::new(empty), Mat4::IDENTITY)];
        let result = pack_scene(&mut device, &objects, &[0], GeometryMode::Instanced);
        assert!(matches!(result, Err(AccelError::NoGeometry)));
    }
}
