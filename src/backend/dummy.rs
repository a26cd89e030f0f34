//! Dummy device for testing and development.
//!
//! Holds all buffers in host memory and emulates the mesh pack and texture
//! copy kernels on the CPU, so the full pipeline runs byte-for-byte without
//! GPU hardware. Trace and present dispatches are validated and counted but
//! produce no image. Readbacks complete after a configurable number of polls
//! to exercise the asynchronous paths.

use std::collections::HashMap;

use glam::{Mat3, Mat4, Vec2, Vec4};

use crate::backend::traits::{
    BufferHandle, DeviceError, DeviceResult, ReadbackHandle, ReadbackPoll, TargetHandle,
    TextureHandle, TraceDevice,
};
use crate::backend::types::*;
use crate::resources::mesh::TriangleAttributes;

struct DummyTexture {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

struct PendingReadback {
    data: Vec<u8>,
    polls_remaining: u32,
}

/// In-memory device.
pub struct DummyDevice {
    buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, DummyTexture>,
    targets: HashMap<u64, TargetDescriptor>,
    readbacks: HashMap<u64, PendingReadback>,
    next_id: u64,
    readback_latency: u32,
    mesh_pack_dispatches: u32,
    texture_copy_dispatches: u32,
    trace_dispatches: u32,
    present_calls: u32,
    last_present: Option<PresentParams>,
    last_trace_uniforms: Option<TraceUniforms>,
}

impl DummyDevice {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            textures: HashMap::new(),
            targets: HashMap::new(),
            readbacks: HashMap::new(),
            next_id: 1,
            readback_latency: 1,
            mesh_pack_dispatches: 0,
            texture_copy_dispatches: 0,
            trace_dispatches: 0,
            present_calls: 0,
            last_present: None,
            last_trace_uniforms: None,
        }
    }

    /// Number of polls before a readback reports `Ready`.
    pub fn set_readback_latency(&mut self, polls: u32) {
        self.readback_latency = polls;
    }

    pub fn mesh_pack_dispatches(&self) -> u32 {
        self.mesh_pack_dispatches
    }

    pub fn texture_copy_dispatches(&self) -> u32 {
        self.texture_copy_dispatches
    }

    pub fn trace_dispatches(&self) -> u32 {
        self.trace_dispatches
    }

    pub fn present_calls(&self) -> u32 {
        self.present_calls
    }

    pub fn last_present(&self) -> Option<&PresentParams> {
        self.last_present.as_ref()
    }

    pub fn last_trace_uniforms(&self) -> Option<&TraceUniforms> {
        self.last_trace_uniforms.as_ref()
    }

    /// Inspect buffer contents (tests only; a real device cannot do this
    /// synchronously).
    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|data| data.as_slice())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Readbacks requested but not yet consumed by a `Ready` poll.
    pub fn pending_readbacks(&self) -> usize {
        self.readbacks.len()
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn run_mesh_pack(&mut self, dispatch: &MeshPackDispatch) -> DeviceResult<()> {
        let params = &dispatch.params;
        let features = MeshPackFeatures::from_bits(params.features);

        let vertex_data = self
            .buffers
            .get(&dispatch.vertex_buffer.0)
            .ok_or_else(|| DeviceError::InvalidBindings("unknown vertex buffer".to_string()))?
            .clone();
        let index_data = match dispatch.index_buffer {
            Some(buffer) => Some(
                self.buffers
                    .get(&buffer.0)
                    .ok_or_else(|| {
                        DeviceError::InvalidBindings("unknown index buffer".to_string())
                    })?
                    .clone(),
            ),
            None => None,
        };

        let local_to_world = params.local_to_world;
        let normal_matrix = Mat3::from_mat4(local_to_world).inverse().transpose();

        let mut positions = Vec::with_capacity(params.triangle_count as usize * 3);
        let mut attributes = Vec::with_capacity(params.triangle_count as usize);

        for triangle in 0..params.triangle_count {
            let mut record = TriangleAttributes {
                normals: [Vec4::ZERO; 3],
                tangents: [Vec4::ZERO; 3],
                uvs: [Vec2::ZERO; 3],
                material_index: params.material_index,
                _padding: 0,
            };

            for corner in 0..3u32 {
                let element = triangle * 3 + corner;
                let index = vertex_index(&index_data, features, element)?;
                let base = (index * params.vertex_stride) as usize;

                let local = read_vec3(&vertex_data, base + params.position_offset as usize)?;
                positions.push(local_to_world.transform_point3(local).extend(1.0));

                if features.contains(MeshPackFeatures::HAS_NORMALS) {
                    let normal = read_vec3(&vertex_data, base + params.normal_offset as usize)?;
                    record.normals[corner as usize] =
                        (normal_matrix * normal).normalize_or_zero().extend(0.0);
                }
                if features.contains(MeshPackFeatures::HAS_TANGENTS) {
                    let tangent = read_vec4(&vertex_data, base + params.tangent_offset as usize)?;
                    let rotated = local_to_world.transform_vector3(tangent.truncate());
                    record.tangents[corner as usize] =
                        rotated.normalize_or_zero().extend(tangent.w);
                }
                if features.contains(MeshPackFeatures::HAS_UVS) {
                    record.uvs[corner as usize] =
                        read_vec2(&vertex_data, base + params.uv_offset as usize)?;
                }
            }
            attributes.push(record);
        }

        let position_offset = (params.output_start as usize * 3) * 16;
        let attribute_offset = params.output_start as usize * 128;
        write_into(
            self.buffers.get_mut(&dispatch.positions.0).ok_or_else(|| {
                DeviceError::InvalidBindings("unknown position buffer".to_string())
            })?,
            position_offset,
            bytemuck::cast_slice(&positions),
        )?;
        write_into(
            self.buffers.get_mut(&dispatch.attributes.0).ok_or_else(|| {
                DeviceError::InvalidBindings("unknown attribute buffer".to_string())
            })?,
            attribute_offset,
            bytemuck::cast_slice(&attributes),
        )?;
        Ok(())
    }

    fn run_texture_copy(&mut self, dispatch: &TextureCopyDispatch) -> DeviceResult<()> {
        let params = &dispatch.params;
        let texture = self
            .textures
            .get(&dispatch.texture.0)
            .ok_or_else(|| DeviceError::InvalidBindings("unknown texture".to_string()))?;

        if params.width > texture.width || params.height > texture.height {
            return Err(DeviceError::InvalidBindings(
                "copy extent exceeds texture size".to_string(),
            ));
        }
        let texel_count = (params.width * params.height) as usize;
        if texture.data.len() < texel_count * 4 {
            return Err(DeviceError::InvalidBindings(
                "texture data smaller than copy extent".to_string(),
            ));
        }
        let texels = texture.data[..texel_count * 4].to_vec();

        let destination = self
            .buffers
            .get_mut(&dispatch.data.0)
            .ok_or_else(|| DeviceError::InvalidBindings("unknown data buffer".to_string()))?;
        write_into(destination, params.data_offset as usize * 4, &texels)
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceDevice for DummyDevice {
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle> {
        log::trace!(
            "DummyDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.alloc_id();
        self.buffers.insert(id, vec![0u8; desc.size as usize]);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> DeviceResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        self.write_buffer(handle, 0, data);
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some(contents) = self.buffers.get_mut(&buffer.0) {
            let offset = offset as usize;
            if offset + data.len() <= contents.len() {
                contents[offset..offset + data.len()].copy_from_slice(data);
            } else {
                log::warn!(
                    "DummyDevice: write of {} bytes at {} exceeds buffer size {}",
                    data.len(),
                    offset,
                    contents.len()
                );
            }
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> u64 {
        self.buffers
            .get(&buffer.0)
            .map(|data| data.len() as u64)
            .unwrap_or(0)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> DeviceResult<TextureHandle> {
        log::trace!(
            "DummyDevice: creating texture {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        let id = self.alloc_id();
        let size = (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize;
        self.textures.insert(
            id,
            DummyTexture {
                width: desc.width,
                height: desc.height,
                data: vec![0u8; size],
            },
        );
        Ok(TextureHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) {
        if let Some(entry) = self.textures.get_mut(&texture.0) {
            let len = data.len().min(entry.data.len());
            entry.data[..len].copy_from_slice(&data[..len]);
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn create_target(&mut self, desc: &TargetDescriptor) -> DeviceResult<TargetHandle> {
        let id = self.alloc_id();
        self.targets.insert(id, *desc);
        Ok(TargetHandle(id))
    }

    fn destroy_target(&mut self, target: TargetHandle) {
        self.targets.remove(&target.0);
    }

    fn dispatch_mesh_pack(&mut self, dispatch: &MeshPackDispatch) -> DeviceResult<()> {
        let expected = dispatch.params.triangle_count.div_ceil(MESH_PACK_GROUP_SIZE);
        if dispatch.group_count < expected {
            return Err(DeviceError::DispatchFailed(format!(
                "mesh pack group count {} covers fewer than {} triangles",
                dispatch.group_count, dispatch.params.triangle_count
            )));
        }
        self.run_mesh_pack(dispatch)?;
        self.mesh_pack_dispatches += 1;
        Ok(())
    }

    fn dispatch_texture_copy(&mut self, dispatch: &TextureCopyDispatch) -> DeviceResult<()> {
        self.run_texture_copy(dispatch)?;
        self.texture_copy_dispatches += 1;
        Ok(())
    }

    fn dispatch_trace(&mut self, dispatch: &TraceDispatch) -> DeviceResult<()> {
        dispatch.validate().map_err(DeviceError::InvalidBindings)?;
        if !self.targets.contains_key(&dispatch.bindings.output.0)
            || !self.targets.contains_key(&dispatch.bindings.accumulated.0)
        {
            return Err(DeviceError::InvalidBindings(
                "unknown accumulation target".to_string(),
            ));
        }
        self.trace_dispatches += 1;
        self.last_trace_uniforms = Some(dispatch.uniforms);
        Ok(())
    }

    fn present(&mut self, params: &PresentParams) -> DeviceResult<()> {
        if !self.buffers.contains_key(&params.destination.0) {
            return Err(DeviceError::InvalidBindings(
                "unknown present destination".to_string(),
            ));
        }
        if let Some(source) = params.source {
            if !self.targets.contains_key(&source.0) {
                return Err(DeviceError::InvalidBindings(
                    "unknown present source".to_string(),
                ));
            }
        }
        self.present_calls += 1;
        self.last_present = Some(params.clone());
        Ok(())
    }

    fn request_readback(&mut self, buffer: BufferHandle) -> DeviceResult<ReadbackHandle> {
        let data = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| DeviceError::ReadbackFailed("unknown buffer".to_string()))?
            .clone();
        let id = self.alloc_id();
        self.readbacks.insert(
            id,
            PendingReadback {
                data,
                polls_remaining: self.readback_latency,
            },
        );
        Ok(ReadbackHandle(id))
    }

    fn poll_readback(&mut self, readback: ReadbackHandle) -> ReadbackPoll {
        let Some(pending) = self.readbacks.get_mut(&readback.0) else {
            return ReadbackPoll::Failed("unknown readback handle".to_string());
        };
        if pending.polls_remaining > 0 {
            pending.polls_remaining -= 1;
            return ReadbackPoll::Pending;
        }
        match self.readbacks.remove(&readback.0) {
            Some(pending) => ReadbackPoll::Ready(pending.data),
            None => ReadbackPoll::Failed("readback handle consumed".to_string()),
        }
    }
}

fn vertex_index(
    index_data: &Option<Vec<u8>>,
    features: MeshPackFeatures,
    element: u32,
) -> DeviceResult<u32> {
    if !features.contains(MeshPackFeatures::HAS_INDEX_BUFFER) {
        return Ok(element);
    }
    let data = index_data
        .as_ref()
        .ok_or_else(|| DeviceError::InvalidBindings("index buffer missing".to_string()))?;
    if features.contains(MeshPackFeatures::INDICES_32_BIT) {
        let offset = element as usize * 4;
        let bytes = data
            .get(offset..offset + 4)
            .ok_or_else(|| DeviceError::DispatchFailed("index read out of bounds".to_string()))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    } else {
        let offset = element as usize * 2;
        let bytes = data
            .get(offset..offset + 2)
            .ok_or_else(|| DeviceError::DispatchFailed("index read out of bounds".to_string()))?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]) as u32)
    }
}

fn read_f32(data: &[u8], offset: usize) -> DeviceResult<f32> {
    let bytes = data
        .get(offset..offset + 4)
        .ok_or_else(|| DeviceError::DispatchFailed("vertex read out of bounds".to_string()))?;
    Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_vec2(data: &[u8], offset: usize) -> DeviceResult<Vec2> {
    Ok(Vec2::new(read_f32(data, offset)?, read_f32(data, offset + 4)?))
}

fn read_vec3(data: &[u8], offset: usize) -> DeviceResult<glam::Vec3> {
    Ok(glam::Vec3::new(
        read_f32(data, offset)?,
        read_f32(data, offset + 4)?,
        read_f32(data, offset + 8)?,
    ))
}

fn read_vec4(data: &[u8], offset: usize) -> DeviceResult<Vec4> {
    Ok(Vec4::new(
        read_f32(data, offset)?,
        read_f32(data, offset + 4)?,
        read_f32(data, offset + 8)?,
        read_f32(data, offset + 12)?,
    ))
}

fn write_into(buffer: &mut [u8], offset: usize, data: &[u8]) -> DeviceResult<()> {
    let end = offset + data.len();
    if end > buffer.len() {
        return Err(DeviceError::DispatchFailed(format!(
            "kernel write of {} bytes at {} exceeds buffer size {}",
            data.len(),
            offset,
            buffer.len()
        )));
    }
    buffer[offset..end].copy_from_slice(data);
    Ok(())
}
