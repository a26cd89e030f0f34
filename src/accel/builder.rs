//! External acceleration structure builder ABI
//!
//! BVH construction is delegated to an external builder service. The builder
//! consumes packed world-space vertex positions and hands back opaque
//! compressed wide BVH blobs; this crate never inspects their internals,
//! only sizes and offsets. Builds are asynchronous: a build call returns a
//! handle immediately and the caller polls it to completion.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::collections::HashMap;
use std::sync::Arc;

use crate::resources::mesh::PackedVertex;

/// Byte size of one compressed wide BVH node.
pub const BVH_NODE_SIZE: u64 = 80;
/// Byte size of one BVH triangle entry (three positions).
pub const BVH_TRIANGLE_SIZE: u64 = 48;
/// Byte size of one TLAS node.
pub const TLAS_NODE_SIZE: u64 = 64;

/// Handle to a bottom-level build owned by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlasHandle(pub(crate) u64);

/// Handle to a top-level build owned by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlasHandle(pub(crate) u64);

/// Result of polling an asynchronous build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildPoll {
    Pending,
    Ready,
    Failed(String),
}

/// A view of packed vertex positions handed to the builder.
///
/// Holds a shared reference to the readback data, so the positions stay
/// alive for as long as any build still references them regardless of what
/// the GPU side does with its buffers in the meantime.
#[derive(Debug, Clone)]
pub struct VertexSpan {
    data: Arc<Vec<PackedVertex>>,
    start_triangle: u32,
    triangle_count: u32,
}

impl VertexSpan {
    pub fn new(data: Arc<Vec<PackedVertex>>, start_triangle: u32, triangle_count: u32) -> Self {
        debug_assert!(
            ((start_triangle + triangle_count) as usize) * 3 <= data.len(),
            "span exceeds packed vertex data"
        );
        Self {
            data,
            start_triangle,
            triangle_count,
        }
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn positions(&self) -> &[PackedVertex] {
        let start = self.start_triangle as usize * 3;
        let end = start + self.triangle_count as usize * 3;
        &self.data[start..end]
    }
}

/// Completed bottom-level build: opaque node and triangle blobs.
#[derive(Debug, Clone)]
pub struct BlasData {
    pub nodes: Vec<u8>,
    pub triangles: Vec<u8>,
}

impl BlasData {
    pub fn node_count(&self) -> u32 {
        (self.nodes.len() as u64 / BVH_NODE_SIZE) as u32
    }

    pub fn triangle_count(&self) -> u32 {
        (self.triangles.len() as u64 / BVH_TRIANGLE_SIZE) as u32
    }
}

/// Completed top-level build: node blob plus instance index order.
#[derive(Debug, Clone)]
pub struct TlasData {
    pub nodes: Vec<u8>,
    pub indices: Vec<u8>,
}

/// One TLAS input instance: transforms, world bounds and the index of the
/// instance's BLAS within the build batch. Buffer offsets travel separately
/// in the per-instance GPU records.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TlasInstanceRecord {
    pub transform: Mat4,
    pub inverse_transform: Mat4,
    pub bounds_min: Vec3,
    pub blas_index: u32,
    pub bounds_max: Vec3,
    pub _padding: u32,
}

/// Asynchronous acceleration structure builder.
pub trait AccelBuilder {
    /// Start a bottom-level build over a span of packed positions.
    fn build_blas(&mut self, span: VertexSpan) -> BlasHandle;

    /// Poll a bottom-level build. Never blocks.
    fn poll_blas(&mut self, handle: BlasHandle) -> BuildPoll;

    /// Byte size of a completed build's node blob, `None` until ready.
    fn blas_nodes_size(&self, handle: BlasHandle) -> Option<u64>;

    /// Byte size of a completed build's triangle blob, `None` until ready.
    fn blas_triangles_size(&self, handle: BlasHandle) -> Option<u64>;

    /// Take the data of a completed bottom-level build.
    fn blas_data(&mut self, handle: BlasHandle) -> Option<BlasData>;

    /// Free builder-side resources of a bottom-level build.
    fn destroy_blas(&mut self, handle: BlasHandle);

    /// Start a top-level build over instance records.
    fn build_tlas(&mut self, instances: Vec<TlasInstanceRecord>) -> TlasHandle;

    /// Poll a top-level build. Never blocks.
    fn poll_tlas(&mut self, handle: TlasHandle) -> BuildPoll;

    /// Byte size of a completed build's node blob, `None` until ready.
    fn tlas_nodes_size(&self, handle: TlasHandle) -> Option<u64>;

    /// Take the data of a completed top-level build.
    fn tlas_data(&mut self, handle: TlasHandle) -> Option<TlasData>;

    /// Free builder-side resources of a top-level build.
    fn destroy_tlas(&mut self, handle: TlasHandle);
}

struct PendingBlas {
    span: VertexSpan,
    polls_remaining: u32,
    data: Option<BlasData>,
}

struct PendingTlas {
    instances: Vec<TlasInstanceRecord>,
    polls_remaining: u32,
    data: Option<TlasData>,
}

/// In-process builder for tests and development.
///
/// Produces deterministic blobs with the real node and triangle strides:
/// one node per triangle carrying its bounds, and the triangle positions
/// verbatim. Builds complete after a configurable number of polls.
pub struct DummyBuilder {
    blas: HashMap<u64, PendingBlas>,
    tlas: HashMap<u64, PendingTlas>,
    next_id: u64,
    build_latency: u32,
    blas_builds: u32,
    tlas_builds: u32,
    blas_destroyed: u32,
    tlas_destroyed: u32,
}

impl DummyBuilder {
    pub fn new() -> Self {
        Self {
            blas: HashMap::new(),
            tlas: HashMap::new(),
            next_id: 1,
            build_latency: 1,
            blas_builds: 0,
            tlas_builds: 0,
            blas_destroyed: 0,
            tlas_destroyed: 0,
        }
    }

    /// Number of polls before a build reports `Ready`.
    pub fn set_build_latency(&mut self, polls: u32) {
        self.build_latency = polls;
    }

    pub fn blas_builds(&self) -> u32 {
        self.blas_builds
    }

    pub fn tlas_builds(&self) -> u32 {
        self.tlas_builds
    }

    pub fn blas_destroyed(&self) -> u32 {
        self.blas_destroyed
    }

    pub fn tlas_destroyed(&self) -> u32 {
        self.tlas_destroyed
    }

    /// Builds still owned by the builder; zero after a clean shutdown.
    pub fn live_builds(&self) -> usize {
        self.blas.len() + self.tlas.len()
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn make_blas_data(span: &VertexSpan) -> BlasData {
        let positions = span.positions();
        let mut nodes = Vec::with_capacity(positions.len() / 3 * BVH_NODE_SIZE as usize);
        let mut triangles = Vec::with_capacity(positions.len() * 16);

        for triangle in positions.chunks_exact(3) {
            let min = triangle[0].min(triangle[1]).min(triangle[2]);
            let max = triangle[0].max(triangle[1]).max(triangle[2]);

            let mut node = [0u8; BVH_NODE_SIZE as usize];
            node[..16].copy_from_slice(bytemuck::bytes_of(&min));
            node[16..32].copy_from_slice(bytemuck::bytes_of(&max));
            nodes.extend_from_slice(&node);

            triangles.extend_from_slice(bytemuck::cast_slice(triangle));
        }

        BlasData { nodes, triangles }
    }

    fn make_tlas_data(instances: &[TlasInstanceRecord]) -> TlasData {
        let mut nodes = Vec::with_capacity(instances.len() * TLAS_NODE_SIZE as usize);
        let mut indices = Vec::with_capacity(instances.len() * 4);

        for (index, instance) in instances.iter().enumerate() {
            let mut node = [0u8; TLAS_NODE_SIZE as usize];
            node[..12].copy_from_slice(bytemuck::bytes_of(&instance.bounds_min));
            node[16..28].copy_from_slice(bytemuck::bytes_of(&instance.bounds_max));
            node[28..32].copy_from_slice(&(index as u32).to_le_bytes());
            nodes.extend_from_slice(&node);

            indices.extend_from_slice(&(index as u32).to_le_bytes());
        }

        TlasData { nodes, indices }
    }
}

impl Default for DummyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AccelBuilder for DummyBuilder {
    fn build_blas(&mut self, span: VertexSpan) -> BlasHandle {
        let id = self.alloc_id();
        self.blas.insert(
            id,
            PendingBlas {
                span,
                polls_remaining: self.build_latency,
                data: None,
            },
        );
        self.blas_builds += 1;
        BlasHandle(id)
    }

    fn poll_blas(&mut self, handle: BlasHandle) -> BuildPoll {
        match self.blas.get_mut(&handle.0) {
            Some(pending) => {
                if pending.polls_remaining > 0 {
                    pending.polls_remaining -= 1;
                    BuildPoll::Pending
                } else {
                    if pending.data.is_none() {
                        pending.data = Some(Self::make_blas_data(&pending.span));
                    }
                    BuildPoll::Ready
                }
            }
            None => BuildPoll::Failed("unknown BLAS handle".to_string()),
        }
    }

    fn blas_nodes_size(&self, handle: BlasHandle) -> Option<u64> {
        self.blas
            .get(&handle.0)
            .and_then(|p| p.data.as_ref())
            .map(|d| d.nodes.len() as u64)
    }

    fn blas_triangles_size(&self, handle: BlasHandle) -> Option<u64> {
        self.blas
            .get(&handle.0)
            .and_then(|p| p.data.as_ref())
            .map(|d| d.triangles.len() as u64)
    }

    fn blas_data(&mut self, handle: BlasHandle) -> Option<BlasData> {
        self.blas.get_mut(&handle.0).and_then(|p| p.data.take())
    }

    fn destroy_blas(&mut self, handle: BlasHandle) {
        if self.blas.remove(&handle.0).is_some() {
            self.blas_destroyed += 1;
        }
    }

    fn build_tlas(&mut self, instances: Vec<TlasInstanceRecord>) -> TlasHandle {
        let id = self.alloc_id();
        self.tlas.insert(
            id,
            PendingTlas {
                instances,
                polls_remaining: self.build_latency,
                data: None,
            },
        );
        self.tlas_builds += 1;
        TlasHandle(id)
    }

    fn poll_tlas(&mut self, handle: TlasHandle) -> BuildPoll {
        match self.tlas.get_mut(&handle.0) {
            Some(pending) => {
                if pending.polls_remaining > 0 {
                    pending.polls_remaining -= 1;
                    BuildPoll::Pending
                } else {
                    if pending.data.is_none() {
                        pending.data = Some(Self::make_tlas_data(&pending.instances));
                    }
                    BuildPoll::Ready
                }
            }
            None => BuildPoll::Failed("unknown TLAS handle".to_string()),
        }
    }

    fn tlas_nodes_size(&self, handle: TlasHandle) -> Option<u64> {
        self.tlas
            .get(&handle.0)
            .and_then(|p| p.data.as_ref())
            .map(|d| d.nodes.len() as u64)
    }

    fn tlas_data(&mut self, handle: TlasHandle) -> Option<TlasData> {
        self.tlas.get_mut(&handle.0).and_then(|p| p.data.take())
    }

    fn destroy_tlas(&mut self, handle: TlasHandle) {
        if self.tlas.remove(&handle.0).is_some() {
            self.tlas_destroyed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn span(triangles: u32) -> VertexSpan {
        let positions = (0..triangles * 3)
            .map(|i| Vec4::new(i as f32, 0.0, 0.0, 1.0))
            .collect();
        VertexSpan::new(Arc::new(positions), 0, triangles)
    }

    #[test]
    fn test_build_completes_after_latency() {
        let mut builder = DummyBuilder::new();
        builder.set_build_latency(2);
        let handle = builder.build_blas(span(4));

        assert_eq!(builder.poll_blas(handle), BuildPoll::Pending);
        assert!(builder.blas_nodes_size(handle).is_none());
        assert_eq!(builder.poll_blas(handle), BuildPoll::Pending);
        assert_eq!(builder.poll_blas(handle), BuildPoll::Ready);
        assert_eq!(builder.blas_nodes_size(handle), Some(4 * BVH_NODE_SIZE));
        assert_eq!(builder.blas_triangles_size(handle), Some(4 * BVH_TRIANGLE_SIZE));

        let data = builder.blas_data(handle).unwrap();
        assert_eq!(data.node_count(), 4);
        assert_eq!(data.triangle_count(), 4);
        builder.destroy_blas(handle);
        assert_eq!(builder.live_builds(), 0);
    }

    #[test]
    fn test_identical_spans_build_identical_blobs() {
        let mut builder = DummyBuilder::new();
        builder.set_build_latency(0);

        let a = builder.build_blas(span(8));
        let b = builder.build_blas(span(8));
        builder.poll_blas(a);
        builder.poll_blas(b);
        let a_data = builder.blas_data(a).unwrap();
        let b_data = builder.blas_data(b).unwrap();
        assert_eq!(a_data.nodes, b_data.nodes);
        assert_eq!(a_data.triangles, b_data.triangles);
    }

    #[test]
    fn test_span_survives_source_drop() {
        let data = Arc::new(vec![Vec4::ONE; 6]);
        let span = VertexSpan::new(data.clone(), 1, 1);
        drop(data);
        assert_eq!(span.positions().len(), 3);
    }

    #[test]
    fn test_tlas_record_size() {
        assert_eq!(std::mem::size_of::<TlasInstanceRecord>(), 160);
    }
}
