//! wgpu device implementation
//!
//! Headless: the device renders into buffers and targets only, no surface.
//! The mesh pack, texture copy and present kernels are embedded WGSL; the
//! trace kernel can be replaced by the host via
//! [`WgpuDevice::set_trace_shader`] as long as it declares the binding
//! contract of group 0 (see [`TRACE_SHADER`] for the reference layout).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Mesh transform-and-pack kernel.
///
/// Reads the native interleaved vertex stream as raw words and branches on
/// the layout feature bits, so one pipeline covers every source layout.
const MESH_PACK_SHADER: &str = r#"
struct PackParams {
    local_to_world: mat4x4<f32>,
    vertex_stride: u32,
    position_offset: u32,
    normal_offset: u32,
    tangent_offset: u32,
    uv_offset: u32,
    triangle_count: u32,
    output_start: u32,
    material_index: i32,
    features: u32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
};

const HAS_INDEX_BUFFER: u32 = 1u;
const INDICES_32_BIT: u32 = 2u;
const HAS_NORMALS: u32 = 4u;
const HAS_UVS: u32 = 8u;
const HAS_TANGENTS: u32 = 16u;

struct TriangleAttributes {
    normals: array<vec4<f32>, 3>,
    tangents: array<vec4<f32>, 3>,
    uv0: vec2<f32>,
    uv1: vec2<f32>,
    uv2: vec2<f32>,
    material_index: i32,
    pad: u32,
};

@group(0) @binding(0) var<storage, read> vertices: array<u32>;
@group(0) @binding(1) var<storage, read> indices: array<u32>;
@group(0) @binding(2) var<storage, read_write> positions: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read_write> attributes: array<TriangleAttributes>;
@group(0) @binding(4) var<uniform> params: PackParams;

fn read_f32(byte_offset: u32) -> f32 {
    return bitcast<f32>(vertices[byte_offset / 4u]);
}

fn read_vec2(byte_offset: u32) -> vec2<f32> {
    return vec2<f32>(read_f32(byte_offset), read_f32(byte_offset + 4u));
}

fn read_vec3(byte_offset: u32) -> vec3<f32> {
    return vec3<f32>(read_f32(byte_offset), read_f32(byte_offset + 4u), read_f32(byte_offset + 8u));
}

fn read_vec4(byte_offset: u32) -> vec4<f32> {
    return vec4<f32>(read_vec3(byte_offset), read_f32(byte_offset + 12u));
}

fn vertex_index(element: u32) -> u32 {
    if ((params.features & HAS_INDEX_BUFFER) == 0u) {
        return element;
    }
    if ((params.features & INDICES_32_BIT) != 0u) {
        return indices[element];
    }
    let word = indices[element / 2u];
    if ((element & 1u) == 0u) {
        return word & 0xffffu;
    }
    return word >> 16u;
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let triangle = gid.x;
    if (triangle >= params.triangle_count) {
        return;
    }

    let rotation = mat3x3<f32>(
        params.local_to_world[0].xyz,
        params.local_to_world[1].xyz,
        params.local_to_world[2].xyz,
    );

    var attrs: TriangleAttributes;
    attrs.material_index = params.material_index;
    attrs.pad = 0u;

    for (var corner = 0u; corner < 3u; corner++) {
        let index = vertex_index(triangle * 3u + corner);
        let base = index * params.vertex_stride;

        let local = read_vec3(base + params.position_offset);
        let world = params.local_to_world * vec4<f32>(local, 1.0);
        positions[(params.output_start + triangle) * 3u + corner] = vec4<f32>(world.xyz, 1.0);

        if ((params.features & HAS_NORMALS) != 0u) {
            let normal = normalize(rotation * read_vec3(base + params.normal_offset));
            attrs.normals[corner] = vec4<f32>(normal, 0.0);
        }
        if ((params.features & HAS_TANGENTS) != 0u) {
            let tangent = read_vec4(base + params.tangent_offset);
            attrs.tangents[corner] = vec4<f32>(normalize(rotation * tangent.xyz), tangent.w);
        }
        if ((params.features & HAS_UVS) != 0u) {
            let uv = read_vec2(base + params.uv_offset);
            if (corner == 0u) { attrs.uv0 = uv; }
            if (corner == 1u) { attrs.uv1 = uv; }
            if (corner == 2u) { attrs.uv2 = uv; }
        }
    }

    attributes[params.output_start + triangle] = attrs;
}
"#;

/// Texture to linear data buffer copy kernel, one thread per texel.
const TEXTURE_COPY_SHADER: &str = r#"
struct CopyParams {
    width: u32,
    height: u32,
    data_offset: u32,
    has_alpha: u32,
};

@group(0) @binding(0) var source: texture_2d<f32>;
@group(0) @binding(1) var<storage, read_write> data: array<u32>;
@group(0) @binding(2) var<uniform> params: CopyParams;

fn channel(value: f32) -> u32 {
    return u32(clamp(value, 0.0, 1.0) * 255.0 + 0.5);
}

@compute @workgroup_size(128)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let texel = gid.x;
    if (texel >= params.width * params.height) {
        return;
    }
    let coords = vec2<i32>(i32(texel % params.width), i32(texel / params.width));
    let color = textureLoad(source, coords, 0);
    data[params.data_offset + texel] =
        channel(color.r) | (channel(color.g) << 8u) | (channel(color.b) << 16u) | (channel(color.a) << 24u);
}
"#;

/// Reference trace kernel, mainly documenting the group 0 binding contract
/// a host-supplied kernel must follow. Traces nothing; accumulates a flat
/// ambient term so the progressive plumbing is observable end to end.
const TRACE_SHADER: &str = r#"
struct TraceUniforms {
    cam_to_world: mat4x4<f32>,
    cam_inverse_projection: mat4x4<f32>,
    width: u32,
    height: u32,
    rng_seed: u32,
    sample_index: u32,
    samples_per_pass: u32,
    bounce_limit: u32,
    instance_count: u32,
    features: u32,
    aperture: f32,
    focal_length: f32,
    environment_rotation: f32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
    pad3: u32,
    pad4: u32,
};

@group(0) @binding(0) var<uniform> uniforms: TraceUniforms;
@group(0) @binding(1) var<storage, read> bvh_nodes: array<u32>;
@group(0) @binding(2) var<storage, read> bvh_triangles: array<vec4<f32>>;
@group(0) @binding(3) var<storage, read> triangle_attributes: array<u32>;
@group(0) @binding(4) var<storage, read> materials: array<vec4<f32>>;
@group(0) @binding(5) var<storage, read> tlas_nodes: array<u32>;
@group(0) @binding(6) var<storage, read> tlas_indices: array<u32>;
@group(0) @binding(7) var<storage, read> tlas_instances: array<u32>;
@group(0) @binding(8) var<storage, read> texture_descriptors: array<u32>;
@group(0) @binding(9) var<storage, read> texture_data: array<u32>;
@group(0) @binding(10) var accumulated: texture_2d<f32>;
@group(0) @binding(11) var output: texture_storage_2d<rgba32float, write>;

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let pixel = gid.x;
    if (pixel >= uniforms.width * uniforms.height) {
        return;
    }
    let coords = vec2<i32>(i32(pixel % uniforms.width), i32(pixel / uniforms.width));
    var radiance = vec4<f32>(0.0);
    if (uniforms.sample_index > 0u) {
        radiance = textureLoad(accumulated, coords, 0);
    }
    radiance += vec4<f32>(0.5, 0.5, 0.5, 1.0) * f32(uniforms.samples_per_pass);
    textureStore(output, coords, radiance);
}
"#;

/// Resolve kernel: averages accumulated radiance, applies exposure and
/// gamma, and packs RGBA8 into the output buffer. Pass-through writes
/// opaque black.
const PRESENT_SHADER: &str = r#"
struct PresentUniforms {
    width: u32,
    height: u32,
    sample_count: u32,
    pass_through: u32,
    exposure: f32,
    pad0: u32,
    pad1: u32,
    pad2: u32,
};

@group(0) @binding(0) var<uniform> uniforms: PresentUniforms;
@group(0) @binding(1) var source: texture_2d<f32>;
@group(0) @binding(2) var<storage, read_write> output: array<u32>;

fn channel(value: f32) -> u32 {
    return u32(clamp(value, 0.0, 1.0) * 255.0 + 0.5);
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let pixel = gid.x;
    if (pixel >= uniforms.width * uniforms.height) {
        return;
    }
    if (uniforms.pass_through != 0u) {
        output[pixel] = 0xff000000u;
        return;
    }
    let coords = vec2<i32>(i32(pixel % uniforms.width), i32(pixel / uniforms.width));
    let accumulated = textureLoad(source, coords, 0);
    let linear = accumulated.rgb / f32(uniforms.sample_count) * uniforms.exposure;
    let gamma = pow(max(linear, vec3<f32>(0.0)), vec3<f32>(1.0 / 2.2));
    output[pixel] = channel(gamma.r) | (channel(gamma.g) << 8u) | (channel(gamma.b) << 16u) | (255u << 24u);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PresentUniforms {
    width: u32,
    height: u32,
    sample_count: u32,
    pass_through: u32,
    exposure: f32,
    _padding: [u32; 3],
}

struct TargetEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct ReadbackEntry {
    staging: wgpu::Buffer,
    status: Arc<Mutex<Option<Result<(), wgpu::BufferAsyncError>>>>,
}

/// wgpu implementation of [`TraceDevice`].
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,

    // Resource storage
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, (wgpu::Texture, wgpu::TextureView)>,
    targets: HashMap<u64, TargetEntry>,
    readbacks: HashMap<u64, ReadbackEntry>,
    next_id: u64,

    // Fixed-function pipelines
    mesh_pack_pipeline: wgpu::ComputePipeline,
    texture_copy_pipeline: wgpu::ComputePipeline,
    trace_layout: wgpu::BindGroupLayout,
    trace_pipeline: wgpu::ComputePipeline,
    present_pipeline: wgpu::ComputePipeline,

    /// Stand-ins for optional bindings the frame does not use.
    placeholder_buffer: wgpu::Buffer,
    placeholder_view: wgpu::TextureView,
}

impl WgpuDevice {
    /// Create a headless device on the best available adapter.
    pub fn new() -> DeviceResult<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> DeviceResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| {
                DeviceError::InitializationFailed("no suitable adapter".to_string())
            })?;

        log::info!("Using adapter: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("trace device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;

        let mesh_pack_pipeline = create_pipeline(&device, "mesh pack", MESH_PACK_SHADER, None);
        let texture_copy_pipeline =
            create_pipeline(&device, "texture copy", TEXTURE_COPY_SHADER, None);

        let trace_layout = Self::create_trace_layout(&device);
        let trace_pipeline =
            create_pipeline(&device, "trace", TRACE_SHADER, Some(&trace_layout));
        let present_pipeline = create_pipeline(&device, "present", PRESENT_SHADER, None);

        let placeholder_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("placeholder"),
            size: 16,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let placeholder_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("placeholder"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let placeholder_view =
            placeholder_texture.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            device,
            queue,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            targets: HashMap::new(),
            readbacks: HashMap::new(),
            next_id: 1,
            mesh_pack_pipeline,
            texture_copy_pipeline,
            trace_layout,
            trace_pipeline,
            present_pipeline,
            placeholder_buffer,
            placeholder_view,
        })
    }

    /// Replace the trace kernel. The module must target the group 0 layout
    /// documented by the built-in kernel.
    pub fn set_trace_shader(&mut self, wgsl: &str) {
        self.trace_pipeline = create_pipeline(&self.device, "trace", wgsl, Some(&self.trace_layout));
    }

    fn create_trace_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
        let storage_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for binding in 1..=9 {
            entries.push(storage_entry(binding));
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 10,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 11,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: wgpu::TextureFormat::Rgba32Float,
                view_dimension: wgpu::TextureViewDimension::D2,
            },
            count: None,
        });

        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("trace bindings"),
            entries: &entries,
        })
    }

    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::COPY_SRC) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        if usage.contains(BufferUsage::STORAGE) {
            result |= wgpu::BufferUsages::STORAGE;
        }
        if usage.contains(BufferUsage::READBACK) {
            result |= wgpu::BufferUsages::COPY_SRC;
        }
        result
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, handle: BufferHandle) -> DeviceResult<&wgpu::Buffer> {
        self.buffers
            .get(&handle.0)
            .ok_or_else(|| DeviceError::InvalidBindings(format!("unknown buffer {}", handle.0)))
    }

    fn target(&self, handle: TargetHandle) -> DeviceResult<&TargetEntry> {
        self.targets
            .get(&handle.0)
            .ok_or_else(|| DeviceError::InvalidBindings(format!("unknown target {}", handle.0)))
    }

    fn optional_buffer(&self, handle: Option<BufferHandle>) -> DeviceResult<&wgpu::Buffer> {
        match handle {
            Some(handle) => self.buffer(handle),
            None => Ok(&self.placeholder_buffer),
        }
    }

    fn uniform_buffer(&self, label: &str, data: &[u8]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    fn run_compute(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        group_count: u32,
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(group_count, 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

impl TraceDevice for WgpuDevice {
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> DeviceResult<BufferHandle> {
        if desc.size == 0 {
            return Err(DeviceError::BufferCreationFailed(
                "zero-sized buffer".to_string(),
            ));
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: desc.size,
            usage: Self::convert_buffer_usage(desc.usage),
            mapped_at_creation: false,
        });
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> DeviceResult<BufferHandle> {
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: desc.label.as_deref(),
                contents: data,
                usage: Self::convert_buffer_usage(desc.usage),
            });
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some(buffer) = self.buffers.get(&buffer.0) {
            self.queue.write_buffer(buffer, offset, data);
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> u64 {
        self.buffers
            .get(&buffer.0)
            .map(|buffer| buffer.size())
            .unwrap_or(0)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&buffer.0) {
            buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> DeviceResult<TextureHandle> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.alloc_id();
        self.textures.insert(id, (texture, view));
        Ok(TextureHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8]) {
        let Some((texture, _)) = self.textures.get(&texture.0) else {
            return;
        };
        let size = texture.size();
        let bytes_per_row = data.len() as u32 / size.height;
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(size.height),
            },
            size,
        );
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some((texture, _)) = self.textures.remove(&texture.0) {
            texture.destroy();
        }
    }

    fn create_target(&mut self, desc: &TargetDescriptor) -> DeviceResult<TargetHandle> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("accumulation target"),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::STORAGE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.alloc_id();
        self.targets.insert(id, TargetEntry { texture, view });
        Ok(TargetHandle(id))
    }

    fn destroy_target(&mut self, target: TargetHandle) {
        if let Some(entry) = self.targets.remove(&target.0) {
            entry.texture.destroy();
        }
    }

    fn dispatch_mesh_pack(&mut self, dispatch: &MeshPackDispatch) -> DeviceResult<()> {
        let params = self.uniform_buffer("pack params", bytemuck::bytes_of(&dispatch.params));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("mesh pack"),
            layout: &self.mesh_pack_pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.buffer(dispatch.vertex_buffer)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.optional_buffer(dispatch.index_buffer)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.buffer(dispatch.positions)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.buffer(dispatch.attributes)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        self.run_compute(
            "mesh pack",
            &self.mesh_pack_pipeline,
            &bind_group,
            dispatch.group_count,
        );
        Ok(())
    }

    fn dispatch_texture_copy(&mut self, dispatch: &TextureCopyDispatch) -> DeviceResult<()> {
        let (_, view) = self
            .textures
            .get(&dispatch.texture.0)
            .ok_or_else(|| DeviceError::InvalidBindings("unknown texture".to_string()))?;
        let params = self.uniform_buffer("copy params", bytemuck::bytes_of(&dispatch.params));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("texture copy"),
            layout: &self.texture_copy_pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.buffer(dispatch.data)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        self.run_compute(
            "texture copy",
            &self.texture_copy_pipeline,
            &bind_group,
            dispatch.group_count,
        );
        Ok(())
    }

    fn dispatch_trace(&mut self, dispatch: &TraceDispatch) -> DeviceResult<()> {
        dispatch.validate().map_err(DeviceError::InvalidBindings)?;

        let b = &dispatch.bindings;
        let uniforms = self.uniform_buffer("trace uniforms", bytemuck::bytes_of(&dispatch.uniforms));
        let accumulated = &self.target(b.accumulated)?.view;
        let output = &self.target(b.output)?.view;

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("trace"),
            layout: &self.trace_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: self.buffer(b.bvh_nodes)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.buffer(b.bvh_triangles)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: self.buffer(b.triangle_attributes)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: self.buffer(b.materials)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: self.optional_buffer(b.tlas_nodes)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: self.optional_buffer(b.tlas_indices)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: self.optional_buffer(b.tlas_instances)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: self
                        .optional_buffer(b.texture_descriptors)?
                        .as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 9,
                    resource: self.optional_buffer(b.texture_data)?.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 10,
                    resource: wgpu::BindingResource::TextureView(accumulated),
                },
                wgpu::BindGroupEntry {
                    binding: 11,
                    resource: wgpu::BindingResource::TextureView(output),
                },
            ],
        });
        self.run_compute("trace", &self.trace_pipeline, &bind_group, dispatch.group_count);
        Ok(())
    }

    fn present(&mut self, params: &PresentParams) -> DeviceResult<()> {
        let source_view = match params.source {
            Some(target) => &self.target(target)?.view,
            None => &self.placeholder_view,
        };
        let uniforms = self.uniform_buffer(
            "present uniforms",
            bytemuck::bytes_of(&PresentUniforms {
                width: params.width,
                height: params.height,
                sample_count: params.sample_count.max(1),
                pass_through: params.source.is_none() as u32,
                exposure: params.exposure,
                _padding: [0; 3],
            }),
        );
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("present"),
            layout: &self.present_pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(source_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.buffer(params.destination)?.as_entire_binding(),
                },
            ],
        });
        let pixel_count = params.width * params.height;
        self.run_compute(
            "present",
            &self.present_pipeline,
            &bind_group,
            pixel_count.div_ceil(TRACE_GROUP_SIZE),
        );
        Ok(())
    }

    fn request_readback(&mut self, buffer: BufferHandle) -> DeviceResult<ReadbackHandle> {
        let source = self.buffer(buffer)?;
        let size = source.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let status: Arc<Mutex<Option<Result<(), wgpu::BufferAsyncError>>>> =
            Arc::new(Mutex::new(None));
        let slot = status.clone();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                *slot.lock() = Some(result);
            });

        let id = self.alloc_id();
        self.readbacks.insert(id, ReadbackEntry { staging, status });
        Ok(ReadbackHandle(id))
    }

    fn poll_readback(&mut self, readback: ReadbackHandle) -> ReadbackPoll {
        let _ = self.device.poll(wgpu::Maintain::Poll);

        let Some(entry) = self.readbacks.get(&readback.0) else {
            return ReadbackPoll::Failed("unknown readback handle".to_string());
        };
        let status = entry.status.lock().take();
        match status {
            None => ReadbackPoll::Pending,
            Some(Ok(())) => match self.readbacks.remove(&readback.0) {
                Some(entry) => {
                    let data = entry.staging.slice(..).get_mapped_range().to_vec();
                    entry.staging.unmap();
                    ReadbackPoll::Ready(data)
                }
                None => ReadbackPoll::Failed("readback handle consumed".to_string()),
            },
            Some(Err(error)) => {
                self.readbacks.remove(&readback.0);
                ReadbackPoll::Failed(error.to_string())
            }
        }
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    wgsl: &str,
    layout: Option<&wgpu::BindGroupLayout>,
) -> wgpu::ComputePipeline {
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(wgsl.into()),
    });
    let pipeline_layout = layout.map(|layout| {
        device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[layout],
            push_constant_ranges: &[],
        })
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: pipeline_layout.as_ref(),
        module: &module,
        entry_point: "main",
        compilation_options: Default::default(),
    })
}
