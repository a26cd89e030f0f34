//! Common types shared between device implementations

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::backend::traits::{BufferHandle, TargetHandle, TextureHandle};

/// Thread-group width of the mesh transform-and-pack kernel.
pub const MESH_PACK_GROUP_SIZE: u32 = 64;
/// Thread-group width of the texture copy kernel.
pub const TEXTURE_COPY_GROUP_SIZE: u32 = 128;
/// Thread-group width of the trace kernel (one thread per pixel).
pub const TRACE_GROUP_SIZE: u32 = 256;

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba32Float,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const UNIFORM: Self = Self(1 << 2);
    pub const STORAGE: Self = Self(1 << 3);
    pub const READBACK: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn storage(label: &str, size: u64) -> Self {
        Self {
            label: Some(label.to_string()),
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
        }
    }
}

/// Descriptor for a source texture consumed by the texture copy kernel.
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Descriptor for an accumulation render target.
///
/// Targets are recreated, never resized in place, when any field changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

/// Feature flags for the mesh pack kernel.
///
/// These replace per-variant kernel compilation: the kernel reads them from a
/// uniform and branches on the source mesh's actual layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshPackFeatures(u32);

impl MeshPackFeatures {
    pub const NONE: Self = Self(0);
    pub const HAS_INDEX_BUFFER: Self = Self(1 << 0);
    pub const INDICES_32_BIT: Self = Self(1 << 1);
    pub const HAS_NORMALS: Self = Self(1 << 2);
    pub const HAS_UVS: Self = Self(1 << 3);
    pub const HAS_TANGENTS: Self = Self(1 << 4);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for MeshPackFeatures {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Integer/matrix parameters of the mesh pack kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MeshPackParams {
    pub local_to_world: Mat4,
    pub vertex_stride: u32,
    pub position_offset: u32,
    pub normal_offset: u32,
    pub tangent_offset: u32,
    pub uv_offset: u32,
    pub triangle_count: u32,
    /// First output triangle index within the global buffers.
    pub output_start: u32,
    /// Material index baked into the attribute records, or -1 when the
    /// material is resolved per instance.
    pub material_index: i32,
    pub features: u32,
    pub _padding: [u32; 3],
}

/// One mesh pack dispatch: source buffers, destination globals, parameters.
#[derive(Debug, Clone)]
pub struct MeshPackDispatch {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: Option<BufferHandle>,
    pub positions: BufferHandle,
    pub attributes: BufferHandle,
    pub params: MeshPackParams,
    pub group_count: u32,
}

/// Parameters of the texture copy kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct TextureCopyParams {
    pub width: u32,
    pub height: u32,
    /// Destination texel offset into the linear texture data buffer.
    pub data_offset: u32,
    pub has_alpha: u32,
}

/// One texture copy dispatch into the shared linear texture data buffer.
#[derive(Debug, Clone)]
pub struct TextureCopyDispatch {
    pub texture: TextureHandle,
    pub data: BufferHandle,
    pub params: TextureCopyParams,
    pub group_count: u32,
}

/// Feature flags for the trace kernel.
///
/// Must be consistent with which optional bindings are present; see
/// [`TraceDispatch::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceFeatures(u32);

impl TraceFeatures {
    pub const NONE: Self = Self(0);
    pub const HAS_TLAS: Self = Self(1 << 0);
    pub const HAS_TEXTURES: Self = Self(1 << 1);
    pub const HAS_LIGHTS: Self = Self(1 << 2);
    pub const HAS_ENVIRONMENT: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for TraceFeatures {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Named buffer bindings of the trace kernel.
#[derive(Debug, Clone)]
pub struct TraceBindings {
    pub bvh_nodes: BufferHandle,
    pub bvh_triangles: BufferHandle,
    pub triangle_attributes: BufferHandle,
    pub materials: BufferHandle,
    pub tlas_nodes: Option<BufferHandle>,
    /// TLAS leaf order to instance index mapping.
    pub tlas_indices: Option<BufferHandle>,
    pub tlas_instances: Option<BufferHandle>,
    pub texture_descriptors: Option<BufferHandle>,
    pub texture_data: Option<BufferHandle>,
    /// Accumulation target written this pass.
    pub output: TargetHandle,
    /// Previous accumulation, read only.
    pub accumulated: TargetHandle,
}

/// Scalar/vector parameters of the trace kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct TraceUniforms {
    pub cam_to_world: Mat4,
    pub cam_inverse_projection: Mat4,
    pub width: u32,
    pub height: u32,
    pub rng_seed: u32,
    pub sample_index: u32,
    pub samples_per_pass: u32,
    pub bounce_limit: u32,
    pub instance_count: u32,
    pub features: u32,
    pub aperture: f32,
    pub focal_length: f32,
    pub environment_rotation: f32,
    pub _padding: [u32; 5],
}

/// One trace kernel dispatch.
#[derive(Debug, Clone)]
pub struct TraceDispatch {
    pub bindings: TraceBindings,
    pub uniforms: TraceUniforms,
    pub features: TraceFeatures,
    pub group_count: u32,
}

impl TraceDispatch {
    /// Check that feature flags agree with which optional buffers are bound.
    pub fn validate(&self) -> Result<(), String> {
        let b = &self.bindings;
        if self.features.contains(TraceFeatures::HAS_TLAS)
            && (b.tlas_nodes.is_none() || b.tlas_indices.is_none() || b.tlas_instances.is_none())
        {
            return Err("HAS_TLAS set without TLAS node/index/instance buffers".to_string());
        }
        if self.features.contains(TraceFeatures::HAS_TEXTURES)
            && (b.texture_descriptors.is_none() || b.texture_data.is_none())
        {
            return Err("HAS_TEXTURES set without texture buffers".to_string());
        }
        if !self.features.contains(TraceFeatures::HAS_TEXTURES)
            && (b.texture_descriptors.is_some() || b.texture_data.is_some())
        {
            return Err("texture buffers bound without HAS_TEXTURES".to_string());
        }
        Ok(())
    }
}

/// Exposure resolve of an accumulation target into the output buffer.
///
/// A `source` of `None` presents pass-through: the output buffer is cleared
/// instead of resolved, used while the acceleration structure is not ready.
#[derive(Debug, Clone)]
pub struct PresentParams {
    pub source: Option<TargetHandle>,
    pub destination: BufferHandle,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
    pub exposure: f32,
}
