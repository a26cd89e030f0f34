//! Builder client: BLAS/TLAS lifecycle on the GPU side
//!
//! Owns the GPU copies of everything the builder produces. Bottom-level
//! builds run as one batch per structural rebuild; their blobs are
//! concatenated into two shared buffers with a per-mesh offset directory.
//! Top-level builds are single-flight: a rebuild requested while one is in
//! flight is queued, and a newer request overwrites the queued one, so at
//! most one stale TLAS is ever built.

use log::debug;

use crate::accel::builder::{
    AccelBuilder, BlasHandle, BuildPoll, TlasHandle, TlasInstanceRecord, VertexSpan,
    BVH_NODE_SIZE, BVH_TRIANGLE_SIZE,
};
use crate::accel::AccelError;
use crate::backend::traits::{BufferHandle, TraceDevice};
use crate::backend::types::BufferDescriptor;

/// Where one mesh's BLAS sits in the concatenated buffers, in node and
/// triangle-entry units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasOffsets {
    pub node_offset: u32,
    pub triangle_offset: u32,
}

/// Drives builder interaction and owns the resulting GPU buffers.
pub struct BuilderClient {
    pending_blas: Vec<BlasHandle>,
    blas_offsets: Vec<BlasOffsets>,
    nodes_buffer: Option<BufferHandle>,
    triangles_buffer: Option<BufferHandle>,
    tlas_nodes_buffer: Option<BufferHandle>,
    tlas_indices_buffer: Option<BufferHandle>,
    tlas_in_flight: Option<TlasHandle>,
    tlas_queued: Option<Vec<TlasInstanceRecord>>,
    blas_ready: bool,
    tlas_uploaded: bool,
}

impl BuilderClient {
    pub fn new() -> Self {
        Self {
            pending_blas: Vec::new(),
            blas_offsets: Vec::new(),
            nodes_buffer: None,
            triangles_buffer: None,
            tlas_nodes_buffer: None,
            tlas_indices_buffer: None,
            tlas_in_flight: None,
            tlas_queued: None,
            blas_ready: false,
            tlas_uploaded: false,
        }
    }

    /// Start one bottom-level build per span. Invalidates previous BLAS
    /// state; the old buffers stay bound until the new batch lands.
    pub fn begin_blas_builds<B: AccelBuilder>(&mut self, builder: &mut B, spans: Vec<VertexSpan>) {
        debug!("Starting {} BLAS builds", spans.len());
        self.blas_ready = false;
        self.pending_blas = spans
            .into_iter()
            .map(|span| builder.build_blas(span))
            .collect();
    }

    /// Poll the pending BLAS batch. When the whole batch has completed, the
    /// blobs are concatenated and uploaded and the builder handles freed.
    /// Returns whether the batch landed this call.
    pub fn poll_blas_builds<B: AccelBuilder, D: TraceDevice>(
        &mut self,
        builder: &mut B,
        device: &mut D,
    ) -> Result<bool, AccelError> {
        if self.pending_blas.is_empty() {
            return Ok(false);
        }

        for &handle in &self.pending_blas {
            match builder.poll_blas(handle) {
                BuildPoll::Ready => {}
                BuildPoll::Pending => return Ok(false),
                BuildPoll::Failed(message) => {
                    self.abandon_blas(builder);
                    return Err(AccelError::Build(message));
                }
            }
        }

        // Sizes first, so the concatenated totals and per-mesh offsets are
        // known before any blob is consumed.
        let mut offsets = Vec::with_capacity(self.pending_blas.len());
        let mut node_total = 0u64;
        let mut triangle_total = 0u64;
        for &handle in &self.pending_blas {
            let node_bytes = builder.blas_nodes_size(handle).ok_or_else(|| {
                AccelError::Build("completed BLAS reported no node size".to_string())
            })?;
            let triangle_bytes = builder.blas_triangles_size(handle).ok_or_else(|| {
                AccelError::Build("completed BLAS reported no triangle size".to_string())
            })?;
            offsets.push(BlasOffsets {
                node_offset: (node_total / BVH_NODE_SIZE) as u32,
                triangle_offset: (triangle_total / BVH_TRIANGLE_SIZE) as u32,
            });
            node_total += node_bytes;
            triangle_total += triangle_bytes;
        }

        let mut nodes = Vec::with_capacity(node_total as usize);
        let mut triangles = Vec::with_capacity(triangle_total as usize);
        for &handle in &self.pending_blas {
            let data = builder.blas_data(handle).ok_or_else(|| {
                AccelError::Build("completed BLAS returned no data".to_string())
            })?;
            nodes.extend_from_slice(&data.nodes);
            triangles.extend_from_slice(&data.triangles);
        }
        for handle in self.pending_blas.drain(..) {
            builder.destroy_blas(handle);
        }

        self.nodes_buffer = Some(upload(device, self.nodes_buffer.take(), "bvh nodes", &nodes)?);
        self.triangles_buffer = Some(upload(
            device,
            self.triangles_buffer.take(),
            "bvh triangles",
            &triangles,
        )?);
        self.blas_offsets = offsets;
        self.blas_ready = true;
        debug!(
            "BLAS batch uploaded: {} nodes bytes, {} triangle bytes",
            nodes.len(),
            triangles.len()
        );
        Ok(true)
    }

    /// Request a top-level rebuild. Single-flight: while a build is in
    /// flight the request is queued, and only the latest queued request
    /// survives.
    pub fn request_tlas<B: AccelBuilder>(
        &mut self,
        builder: &mut B,
        instances: Vec<TlasInstanceRecord>,
    ) {
        if self.tlas_in_flight.is_some() {
            self.tlas_queued = Some(instances);
        } else {
            self.tlas_in_flight = Some(builder.build_tlas(instances));
        }
    }

    /// Poll the in-flight TLAS build; upload on completion and kick off the
    /// queued rebuild, if any. Returns whether a new TLAS landed this call.
    pub fn poll_tlas<B: AccelBuilder, D: TraceDevice>(
        &mut self,
        builder: &mut B,
        device: &mut D,
    ) -> Result<bool, AccelError> {
        let Some(handle) = self.tlas_in_flight else {
            return Ok(false);
        };

        match builder.poll_tlas(handle) {
            BuildPoll::Pending => Ok(false),
            BuildPoll::Failed(message) => {
                self.tlas_in_flight = None;
                builder.destroy_tlas(handle);
                Err(AccelError::Build(message))
            }
            BuildPoll::Ready => {
                let node_bytes = builder.tlas_nodes_size(handle).unwrap_or(0);
                let data = builder.tlas_data(handle).ok_or_else(|| {
                    AccelError::Build("completed TLAS returned no data".to_string())
                })?;
                builder.destroy_tlas(handle);
                self.tlas_in_flight = None;
                debug!(
                    "TLAS ready: {} node bytes, {} instances",
                    node_bytes,
                    data.indices.len() / 4
                );

                self.tlas_nodes_buffer = Some(upload(
                    device,
                    self.tlas_nodes_buffer.take(),
                    "tlas nodes",
                    &data.nodes,
                )?);
                self.tlas_indices_buffer = Some(upload(
                    device,
                    self.tlas_indices_buffer.take(),
                    "tlas indices",
                    &data.indices,
                )?);
                self.tlas_uploaded = true;

                if let Some(queued) = self.tlas_queued.take() {
                    self.tlas_in_flight = Some(builder.build_tlas(queued));
                }
                Ok(true)
            }
        }
    }

    pub fn is_blas_ready(&self) -> bool {
        self.blas_ready
    }

    /// A TLAS has been uploaded at least once; a newer build may still be
    /// in flight, in which case the last uploaded one stays bound.
    pub fn is_tlas_ready(&self) -> bool {
        self.tlas_uploaded
    }

    pub fn blas_offsets(&self) -> &[BlasOffsets] {
        &self.blas_offsets
    }

    pub fn blas_buffers(&self) -> Option<(BufferHandle, BufferHandle)> {
        match (self.nodes_buffer, self.triangles_buffer) {
            (Some(nodes), Some(triangles)) => Some((nodes, triangles)),
            _ => None,
        }
    }

    pub fn tlas_buffers(&self) -> Option<(BufferHandle, BufferHandle)> {
        match (self.tlas_nodes_buffer, self.tlas_indices_buffer) {
            (Some(nodes), Some(indices)) => Some((nodes, indices)),
            _ => None,
        }
    }

    fn abandon_blas<B: AccelBuilder>(&mut self, builder: &mut B) {
        for handle in self.pending_blas.drain(..) {
            builder.destroy_blas(handle);
        }
    }

    /// Drain in-flight builds and free everything. Builds cannot be
    /// cancelled, so pending ones are polled to completion before their
    /// handles are destroyed.
    pub fn release<B: AccelBuilder, D: TraceDevice>(&mut self, builder: &mut B, device: &mut D) {
        for handle in self.pending_blas.drain(..) {
            while builder.poll_blas(handle) == BuildPoll::Pending {}
            builder.destroy_blas(handle);
        }
        if let Some(handle) = self.tlas_in_flight.take() {
            while builder.poll_tlas(handle) == BuildPoll::Pending {}
            builder.destroy_tlas(handle);
        }
        self.tlas_queued = None;

        for buffer in [
            self.nodes_buffer.take(),
            self.triangles_buffer.take(),
            self.tlas_nodes_buffer.take(),
            self.tlas_indices_buffer.take(),
        ]
        .into_iter()
        .flatten()
        {
            device.destroy_buffer(buffer);
        }
        self.blas_offsets.clear();
        self.blas_ready = false;
        self.tlas_uploaded = false;
    }
}

impl Default for BuilderClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Upload a blob, reusing the existing buffer when the size matches and
/// recreating it otherwise.
pub(crate) fn upload<D: TraceDevice>(
    device: &mut D,
    existing: Option<BufferHandle>,
    label: &str,
    data: &[u8],
) -> Result<BufferHandle, AccelError> {
    if let Some(buffer) = existing {
        if device.buffer_size(buffer) == data.len() as u64 {
            device.write_buffer(buffer, 0, data);
            return Ok(buffer);
        }
        device.destroy_buffer(buffer);
    }
    let buffer = device.create_buffer_init(
        &BufferDescriptor::storage(label, data.len() as u64),
        data,
    )?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::builder::DummyBuilder;
    use crate::backend::dummy::DummyDevice;
    use glam::{Mat4, Vec3, Vec4};
    use std::sync::Arc;

    fn spans(counts: &[u32]) -> Vec<VertexSpan> {
        let total: u32 = counts.iter().sum();
        let data = Arc::new(vec![Vec4::new(0.0, 0.0, 0.0, 1.0); total as usize * 3]);
        let mut start = 0;
        counts
            .iter()
            .map(|&count| {
                let span = VertexSpan::new(data.clone(), start, count);
                start += count;
                span
            })
            .collect()
    }

    fn instance_records(count: usize) -> Vec<TlasInstanceRecord> {
        (0..count)
            .map(|i| TlasInstanceRecord {
                transform: Mat4::from_translation(Vec3::X * i as f32),
                inverse_transform: Mat4::from_translation(Vec3::X * -(i as f32)),
                bounds_min: Vec3::splat(-0.5),
                blas_index: 0,
                bounds_max: Vec3::splat(0.5),
                _padding: 0,
            })
            .collect()
    }

    #[test]
    fn test_blas_batch_offsets() {
        let mut builder = DummyBuilder::new();
        builder.set_build_latency(0);
        let mut device = DummyDevice::new();
        let mut client = BuilderClient::new();

        client.begin_blas_builds(&mut builder, spans(&[4, 2, 6]));
        assert!(client.poll_blas_builds(&mut builder, &mut device).unwrap());
        assert!(client.is_blas_ready());

        let offsets = client.blas_offsets();
        assert_eq!(offsets[0], BlasOffsets { node_offset: 0, triangle_offset: 0 });
        assert_eq!(offsets[1], BlasOffsets { node_offset: 4, triangle_offset: 4 });
        assert_eq!(offsets[2], BlasOffsets { node_offset: 6, triangle_offset: 6 });

        let (nodes, triangles) = client.blas_buffers().unwrap();
        assert_eq!(device.buffer_size(nodes), 12 * BVH_NODE_SIZE);
        assert_eq!(device.buffer_size(triangles), 12 * BVH_TRIANGLE_SIZE);

        // handles freed after upload
        assert_eq!(builder.live_builds(), 0);
        client.release(&mut builder, &mut device);
    }

    #[test]
    fn test_blas_buffer_reused_when_size_unchanged() {
        let mut builder = DummyBuilder::new();
        builder.set_build_latency(0);
        let mut device = DummyDevice::new();
        let mut client = BuilderClient::new();

        client.begin_blas_builds(&mut builder, spans(&[4]));
        client.poll_blas_builds(&mut builder, &mut device).unwrap();
        let first = client.blas_buffers().unwrap();

        client.begin_blas_builds(&mut builder, spans(&[4]));
        client.poll_blas_builds(&mut builder, &mut device).unwrap();
        assert_eq!(client.blas_buffers().unwrap(), first);

        // size change forces recreation
        client.begin_blas_builds(&mut builder, spans(&[8]));
        client.poll_blas_builds(&mut builder, &mut device).unwrap();
        assert_ne!(client.blas_buffers().unwrap(), first);

        client.release(&mut builder, &mut device);
    }

    #[test]
    fn test_tlas_single_flight_queues_latest() {
        let mut builder = DummyBuilder::new();
        builder.set_build_latency(1);
        let mut device = DummyDevice::new();
        let mut client = BuilderClient::new();

        client.request_tlas(&mut builder, instance_records(2));
        assert_eq!(builder.tlas_builds(), 1);

        // both requests land while the first build is in flight; only the
        // newest survives
        client.request_tlas(&mut builder, instance_records(3));
        client.request_tlas(&mut builder, instance_records(4));
        assert_eq!(builder.tlas_builds(), 1);

        assert!(!client.poll_tlas(&mut builder, &mut device).unwrap());
        assert!(client.poll_tlas(&mut builder, &mut device).unwrap());
        assert!(client.is_tlas_ready());
        // queued rebuild started
        assert_eq!(builder.tlas_builds(), 2);

        assert!(!client.poll_tlas(&mut builder, &mut device).unwrap());
        assert!(client.poll_tlas(&mut builder, &mut device).unwrap());
        assert_eq!(builder.tlas_builds(), 2);

        client.release(&mut builder, &mut device);
        assert_eq!(builder.live_builds(), 0);
    }

    #[test]
    fn test_release_drains_in_flight_builds() {
        let mut builder = DummyBuilder::new();
        builder.set_build_latency(5);
        let mut device = DummyDevice::new();
        let mut client = BuilderClient::new();

        client.begin_blas_builds(&mut builder, spans(&[4]));
        client.request_tlas(&mut builder, instance_records(1));
        client.release(&mut builder, &mut device);
        assert_eq!(builder.live_builds(), 0);
        assert!(client.blas_buffers().is_none());
    }
}
