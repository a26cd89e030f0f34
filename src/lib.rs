//! Tracelight - scene acceleration and progressive rendering for GPU path tracing
//!
//! The crate turns a scene of meshes, materials and transforms into the
//! buffers a wavefront path tracing kernel consumes, and drives progressive
//! sample accumulation over it:
//! - Geometry is packed on the GPU from native interleaved vertex layouts
//!   into homogeneous positions and fixed-stride triangle attributes
//! - BVH construction is delegated to an external builder over an
//!   asynchronous handle-and-poll ABI; results are uploaded as opaque blobs
//! - Instances are tracked per frame with exact transform comparison, so a
//!   static scene makes zero builder calls
//! - The renderer accumulates samples across ping-ponged float targets and
//!   restarts whenever camera, scene structure or materials change
//!
//! GPU access goes through the [`TraceDevice`](backend::traits::TraceDevice)
//! trait: [`DummyDevice`](backend::dummy::DummyDevice) runs the pipeline on
//! the CPU for tests, [`WgpuDevice`](backend::wgpu_backend::WgpuDevice) runs
//! it headless on a real GPU.

pub mod accel;
pub mod backend;
pub mod renderer;
pub mod resources;
pub mod scene;

pub use accel::{AccelBuilder, AccelError, AccelScene, AccelUpdate, DummyBuilder, SceneBindings};
pub use backend::dummy::DummyDevice;
pub use backend::traits::{DeviceError, TraceDevice};
pub use renderer::{FrameReport, ProgressiveRenderer, RenderError, RenderState};
pub use resources::{MaterialDescriptor, MeshData, TextureData};
pub use scene::{Camera, SceneObject};

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuDevice;

/// How scene geometry maps to acceleration structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GeometryMode {
    /// One BLAS per unique mesh, instanced through a TLAS. Instances can
    /// move without rebuilding bottom-level structures.
    #[default]
    Instanced,
    /// All geometry pre-transformed into one BLAS, no TLAS. Cheaper to
    /// trace, but any movement requires a full rebuild.
    Baked,
}

/// Configuration for the tracer
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Accumulation stops once this many samples per pixel are reached
    pub max_samples: u32,
    /// Samples traced per frame
    pub samples_per_pass: u32,
    /// Maximum path depth
    pub bounce_limit: u32,
    /// Exposure applied at presentation
    pub exposure: f32,
    /// Acceleration structure layout
    pub geometry: GeometryMode,
    /// Root seed of the per-frame RNG stream
    pub seed: u64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            max_samples: 1024,
            samples_per_pass: 1,
            bounce_limit: 8,
            exposure: 1.0,
            geometry: GeometryMode::Instanced,
            seed: 0x5ee0,
        }
    }
}
