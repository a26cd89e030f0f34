//! Scene description consumed by the acceleration and rendering stages

pub mod camera;

pub use camera::{Camera, TraceCameraParams};

use glam::Mat4;
use std::sync::Arc;

use crate::resources::material::MaterialDescriptor;
use crate::resources::mesh::MeshData;

/// One renderable object: a mesh, a material, and a world transform.
///
/// Meshes and materials are shared by `Arc`; the acceleration stage dedupes
/// geometry by mesh pointer identity.
#[derive(Debug, Clone)]
pub struct SceneObject {
    pub mesh: Arc<MeshData>,
    pub material: Arc<MaterialDescriptor>,
    pub transform: Mat4,
}

impl SceneObject {
    pub fn new(mesh: Arc<MeshData>, material: Arc<MaterialDescriptor>, transform: Mat4) -> Self {
        Self {
            mesh,
            material,
            transform,
        }
    }
}
