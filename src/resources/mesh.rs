//! Mesh data in native interleaved form
//!
//! Meshes enter the tracer in whatever interleaved vertex layout the asset
//! pipeline produced. [`VertexLayout`] describes that layout so the pack
//! kernel can read attributes at their native byte offsets; nothing is
//! de-interleaved on the CPU.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

/// Byte size of one packed vertex position (homogeneous `Vec4`).
pub const VERTEX_POSITION_SIZE: u64 = 16;
/// Byte size of one packed per-triangle attribute record.
pub const TRIANGLE_ATTRIBUTE_SIZE: u64 = 128;

/// Vertex attribute semantics understood by the pack kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexAttributeKind {
    Position,
    Normal,
    Tangent,
    TexCoord,
    /// Anything else present in the source layout; contributes to the
    /// stride but is never read.
    Other,
}

/// Per-element storage format of a vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexAttributeFormat {
    Float32,
    Float16,
    Unorm16,
    Snorm16,
    Unorm8,
    Snorm8,
}

impl VertexAttributeFormat {
    /// Byte size of a single element.
    pub fn size(&self) -> u32 {
        match self {
            VertexAttributeFormat::Float32 => 4,
            VertexAttributeFormat::Float16
            | VertexAttributeFormat::Unorm16
            | VertexAttributeFormat::Snorm16 => 2,
            VertexAttributeFormat::Unorm8 | VertexAttributeFormat::Snorm8 => 1,
        }
    }
}

/// One attribute of an interleaved vertex layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub kind: VertexAttributeKind,
    pub format: VertexAttributeFormat,
    pub dimension: u32,
}

impl VertexAttribute {
    pub fn new(kind: VertexAttributeKind, format: VertexAttributeFormat, dimension: u32) -> Self {
        Self {
            kind,
            format,
            dimension,
        }
    }

    /// Byte size of the whole attribute.
    pub fn size(&self) -> u32 {
        self.format.size() * self.dimension
    }
}

/// Interleaved vertex layout: an ordered attribute list within one stream.
///
/// Offsets follow declaration order with no implicit padding, matching how
/// asset pipelines lay out a single interleaved stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    pub fn new(attributes: Vec<VertexAttribute>) -> Self {
        Self { attributes }
    }

    /// The standard layout produced by [`MeshData::from_vertices`]:
    /// float3 position, float3 normal, float4 tangent, float2 uv.
    pub fn standard() -> Self {
        Self::new(vec![
            VertexAttribute::new(
                VertexAttributeKind::Position,
                VertexAttributeFormat::Float32,
                3,
            ),
            VertexAttribute::new(
                VertexAttributeKind::Normal,
                VertexAttributeFormat::Float32,
                3,
            ),
            VertexAttribute::new(
                VertexAttributeKind::Tangent,
                VertexAttributeFormat::Float32,
                4,
            ),
            VertexAttribute::new(
                VertexAttributeKind::TexCoord,
                VertexAttributeFormat::Float32,
                2,
            ),
        ])
    }

    /// Total byte stride of one vertex.
    pub fn stride(&self) -> u32 {
        self.attributes.iter().map(|a| a.size()).sum()
    }

    /// Byte offset of the first attribute with the given semantic, or `None`
    /// if the layout does not carry it.
    pub fn locate(&self, kind: VertexAttributeKind) -> Option<u32> {
        let mut offset = 0;
        for attribute in &self.attributes {
            if attribute.kind == kind {
                return Some(offset);
            }
            offset += attribute.size();
        }
        None
    }

    pub fn has(&self, kind: VertexAttributeKind) -> bool {
        self.locate(kind).is_some()
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// An empty box that unions correctly with any point.
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut aabb = Self::empty();
        for point in points {
            aabb.grow(point);
        }
        aabb
    }

    pub fn grow(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// World-space box enclosing all eight transformed corners.
    pub fn transformed(&self, matrix: &Mat4) -> Aabb {
        let mut aabb = Aabb::empty();
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            aabb.grow(matrix.transform_point3(corner));
        }
        aabb
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }
}

/// Index data in its native width.
#[derive(Debug, Clone)]
pub enum IndexData {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl IndexData {
    pub fn len(&self) -> usize {
        match self {
            IndexData::U16(indices) => indices.len(),
            IndexData::U32(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IndexData::U16(indices) => bytemuck::cast_slice(indices),
            IndexData::U32(indices) => bytemuck::cast_slice(indices),
        }
    }
}

/// A mesh in native interleaved form.
///
/// Shared between scene objects via `Arc`; pointer identity is what the
/// packing stage dedupes on, so cloning the underlying data creates a new
/// mesh as far as acceleration structures are concerned.
#[derive(Debug, Clone)]
pub struct MeshData {
    pub name: String,
    pub vertex_data: Vec<u8>,
    pub layout: VertexLayout,
    pub indices: Option<IndexData>,
    pub local_bounds: Aabb,
}

impl MeshData {
    /// Build a mesh from separate attribute arrays, interleaving them into
    /// the standard layout.
    pub fn from_vertices(
        name: &str,
        positions: &[Vec3],
        normals: &[Vec3],
        tangents: &[Vec4],
        uvs: &[Vec2],
        indices: Vec<u32>,
    ) -> Self {
        debug_assert_eq!(positions.len(), normals.len());
        debug_assert_eq!(positions.len(), tangents.len());
        debug_assert_eq!(positions.len(), uvs.len());

        let layout = VertexLayout::standard();
        let mut vertex_data = Vec::with_capacity(positions.len() * layout.stride() as usize);
        for i in 0..positions.len() {
            vertex_data.extend_from_slice(bytemuck::bytes_of(&positions[i]));
            vertex_data.extend_from_slice(bytemuck::bytes_of(&normals[i]));
            vertex_data.extend_from_slice(bytemuck::bytes_of(&tangents[i]));
            vertex_data.extend_from_slice(bytemuck::bytes_of(&uvs[i]));
        }

        Self {
            name: name.to_string(),
            vertex_data,
            layout,
            indices: Some(IndexData::U32(indices)),
            local_bounds: Aabb::from_points(positions.iter().copied()),
        }
    }

    pub fn vertex_count(&self) -> u32 {
        let stride = self.layout.stride();
        if stride == 0 {
            return 0;
        }
        (self.vertex_data.len() as u32) / stride
    }

    /// Triangle count: indexed meshes count index triples, non-indexed
    /// meshes count vertex triples.
    pub fn triangle_count(&self) -> u32 {
        match &self.indices {
            Some(indices) => (indices.len() / 3) as u32,
            None => self.vertex_count() / 3,
        }
    }

    /// Create a unit cube centered at origin.
    pub fn cube() -> Self {
        let face_normals = [Vec3::Z, -Vec3::Z, Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y];

        let mut positions = Vec::new();
        let mut normals = Vec::new();
        let mut tangents = Vec::new();
        let mut uvs = Vec::new();
        let mut indices = Vec::new();

        for normal in face_normals {
            let up = if normal.abs().y > 0.9 { Vec3::Z } else { Vec3::Y };
            let right = up.cross(normal).normalize();
            let face_up = normal.cross(right);

            let base = positions.len() as u32;
            for (u, v) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
                positions.push(normal * 0.5 + right * u + face_up * v);
                normals.push(normal);
                tangents.push(right.extend(1.0));
                uvs.push(Vec2::new(u + 0.5, v + 0.5));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self::from_vertices("cube", &positions, &normals, &tangents, &uvs, indices)
    }

    /// Create a plane on the XZ axis.
    pub fn plane(width: f32, depth: f32) -> Self {
        let hw = width / 2.0;
        let hd = depth / 2.0;
        let positions = [
            Vec3::new(-hw, 0.0, -hd),
            Vec3::new(hw, 0.0, -hd),
            Vec3::new(hw, 0.0, hd),
            Vec3::new(-hw, 0.0, hd),
        ];
        let normals = [Vec3::Y; 4];
        let tangents = [Vec4::new(1.0, 0.0, 0.0, 1.0); 4];
        let uvs = [
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];

        Self::from_vertices(
            "plane",
            &positions,
            &normals,
            &tangents,
            &uvs,
            vec![0, 1, 2, 0, 2, 3],
        )
    }
}

/// One packed vertex position: world-space xyz with w = 1.
pub type PackedVertex = Vec4;

/// Per-triangle shading attributes written by the pack kernel.
///
/// Fixed stride regardless of what the source mesh carried; attributes the
/// source lacks are zero-filled.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TriangleAttributes {
    pub normals: [Vec4; 3],
    pub tangents: [Vec4; 3],
    pub uvs: [Vec2; 3],
    /// Material index, or -1 when the material is resolved per instance.
    pub material_index: i32,
    pub _padding: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_layout_offsets() {
        let layout = VertexLayout::standard();
        assert_eq!(layout.stride(), 48);
        assert_eq!(layout.locate(VertexAttributeKind::Position), Some(0));
        assert_eq!(layout.locate(VertexAttributeKind::Normal), Some(12));
        assert_eq!(layout.locate(VertexAttributeKind::Tangent), Some(24));
        assert_eq!(layout.locate(VertexAttributeKind::TexCoord), Some(40));
    }

    #[test]
    fn test_locate_missing_attribute() {
        let layout = VertexLayout::new(vec![VertexAttribute::new(
            VertexAttributeKind::Position,
            VertexAttributeFormat::Float32,
            3,
        )]);
        assert_eq!(layout.stride(), 12);
        assert_eq!(layout.locate(VertexAttributeKind::Normal), None);
    }

    #[test]
    fn test_locate_with_half_float_attributes() {
        // uv stored as two half floats after an 8-bit normalized color
        let layout = VertexLayout::new(vec![
            VertexAttribute::new(
                VertexAttributeKind::Position,
                VertexAttributeFormat::Float32,
                3,
            ),
            VertexAttribute::new(VertexAttributeKind::Other, VertexAttributeFormat::Unorm8, 4),
            VertexAttribute::new(
                VertexAttributeKind::TexCoord,
                VertexAttributeFormat::Float16,
                2,
            ),
        ]);
        assert_eq!(layout.locate(VertexAttributeKind::TexCoord), Some(16));
        assert_eq!(layout.stride(), 20);
    }

    #[test]
    fn test_cube_counts_and_bounds() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.triangle_count(), 12);
        assert_eq!(cube.local_bounds.min, Vec3::splat(-0.5));
        assert_eq!(cube.local_bounds.max, Vec3::splat(0.5));
    }

    #[test]
    fn test_non_indexed_triangle_count() {
        let mut mesh = MeshData::cube();
        mesh.indices = None;
        assert_eq!(mesh.triangle_count(), 8);
    }

    #[test]
    fn test_aabb_transformed() {
        let aabb = Aabb {
            min: Vec3::splat(-1.0),
            max: Vec3::splat(1.0),
        };
        let moved = aabb.transformed(&Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(2.0, -1.0, -1.0));
        assert_eq!(moved.max, Vec3::new(4.0, 1.0, 1.0));
    }

    #[test]
    fn test_triangle_attributes_size() {
        assert_eq!(
            std::mem::size_of::<TriangleAttributes>() as u64,
            TRIANGLE_ATTRIBUTE_SIZE
        );
    }
}
