//! Material and texture encoding onto the device
//!
//! Turns the scene's material descriptors into the three buffers the trace
//! kernel binds: material records, texture descriptors, and the linear
//! texture data buffer. Texture uploads go through the texture copy kernel
//! so source textures of any size land tightly packed in one buffer.

use log::debug;
use std::sync::Arc;

use crate::backend::traits::{BufferHandle, DeviceResult, TraceDevice};
use crate::backend::types::{
    BufferDescriptor, TextureCopyDispatch, TextureCopyParams, TextureDescriptor, TextureFormat,
    TEXTURE_COPY_GROUP_SIZE,
};
use crate::resources::material::{MaterialDescriptor, MaterialRecord};
use crate::resources::texture::{TextureData, TextureRecord};

/// Encodes materials and their textures into device buffers.
///
/// Owns the buffers it creates; [`MaterialEncoder::release`] must run before
/// the device goes away.
pub struct MaterialEncoder {
    material_buffer: Option<BufferHandle>,
    material_count: usize,
    texture_descriptor_buffer: Option<BufferHandle>,
    texture_data_buffer: Option<BufferHandle>,
}

impl MaterialEncoder {
    pub fn new() -> Self {
        Self {
            material_buffer: None,
            material_count: 0,
            texture_descriptor_buffer: None,
            texture_data_buffer: None,
        }
    }

    /// Encode material records, and when `update_textures` is set, re-upload
    /// the texture buffers as well.
    ///
    /// Texture slot indices are assigned in first-seen order across the
    /// material list; a texture shared by several materials (by `Arc`
    /// identity) is uploaded once. Slot assignment runs on every call so
    /// records stay consistent with the buffers a previous texture pass
    /// uploaded.
    pub fn encode<D: TraceDevice>(
        &mut self,
        device: &mut D,
        materials: &[Arc<MaterialDescriptor>],
        update_textures: bool,
    ) -> DeviceResult<()> {
        let unique_textures = collect_unique_textures(materials);

        let records: Vec<MaterialRecord> = materials
            .iter()
            .map(|material| material.resolve(texture_slots(material, &unique_textures)))
            .collect();
        self.upload_records(device, &records)?;

        if update_textures {
            self.upload_textures(device, &unique_textures)?;
        }
        Ok(())
    }

    fn upload_records<D: TraceDevice>(
        &mut self,
        device: &mut D,
        records: &[MaterialRecord],
    ) -> DeviceResult<()> {
        if records.is_empty() {
            if let Some(buffer) = self.material_buffer.take() {
                device.destroy_buffer(buffer);
            }
            self.material_count = 0;
            return Ok(());
        }

        // Recreate only when the count changes; in-place writes otherwise.
        if self.material_count != records.len() {
            if let Some(buffer) = self.material_buffer.take() {
                device.destroy_buffer(buffer);
            }
            let size = (records.len() * std::mem::size_of::<MaterialRecord>()) as u64;
            self.material_buffer =
                Some(device.create_buffer(&BufferDescriptor::storage("materials", size))?);
            self.material_count = records.len();
        }

        if let Some(buffer) = self.material_buffer {
            device.write_buffer(buffer, 0, bytemuck::cast_slice(records));
        }
        Ok(())
    }

    fn upload_textures<D: TraceDevice>(
        &mut self,
        device: &mut D,
        textures: &[Arc<TextureData>],
    ) -> DeviceResult<()> {
        if let Some(buffer) = self.texture_descriptor_buffer.take() {
            device.destroy_buffer(buffer);
        }
        if let Some(buffer) = self.texture_data_buffer.take() {
            device.destroy_buffer(buffer);
        }

        let total_texels: u64 = textures.iter().map(|t| t.texel_count() as u64).sum();
        if total_texels == 0 {
            return Ok(());
        }

        let mut records = Vec::with_capacity(textures.len());
        let mut data_offset = 0u32;
        for texture in textures {
            records.push(TextureRecord {
                width: texture.width,
                height: texture.height,
                data_offset,
                has_alpha: texture.has_alpha as u32,
            });
            data_offset += texture.texel_count();
        }

        let descriptor_buffer = device.create_buffer_init(
            &BufferDescriptor::storage(
                "texture descriptors",
                (records.len() * std::mem::size_of::<TextureRecord>()) as u64,
            ),
            bytemuck::cast_slice(&records),
        )?;
        let data_buffer =
            device.create_buffer(&BufferDescriptor::storage("texture data", total_texels * 4))?;

        for (texture, record) in textures.iter().zip(&records) {
            let staging = device.create_texture(&TextureDescriptor {
                label: Some(texture.name.clone()),
                width: texture.width,
                height: texture.height,
                format: TextureFormat::Rgba8Unorm,
            })?;
            device.write_texture(staging, &texture.data);

            let texels = texture.texel_count();
            device.dispatch_texture_copy(&TextureCopyDispatch {
                texture: staging,
                data: data_buffer,
                params: TextureCopyParams {
                    width: texture.width,
                    height: texture.height,
                    data_offset: record.data_offset,
                    has_alpha: record.has_alpha,
                },
                group_count: texels.div_ceil(TEXTURE_COPY_GROUP_SIZE),
            })?;
            device.destroy_texture(staging);
        }

        debug!(
            "Uploaded {} textures, {} texels",
            textures.len(),
            total_texels
        );
        self.texture_descriptor_buffer = Some(descriptor_buffer);
        self.texture_data_buffer = Some(data_buffer);
        Ok(())
    }

    pub fn material_buffer(&self) -> Option<BufferHandle> {
        self.material_buffer
    }

    /// Descriptor and data buffers, present only when at least one texture
    /// was uploaded.
    pub fn texture_buffers(&self) -> Option<(BufferHandle, BufferHandle)> {
        match (self.texture_descriptor_buffer, self.texture_data_buffer) {
            (Some(descriptors), Some(data)) => Some((descriptors, data)),
            _ => None,
        }
    }

    pub fn release<D: TraceDevice>(&mut self, device: &mut D) {
        for buffer in [
            self.material_buffer.take(),
            self.texture_descriptor_buffer.take(),
            self.texture_data_buffer.take(),
        ]
        .into_iter()
        .flatten()
        {
            device.destroy_buffer(buffer);
        }
        self.material_count = 0;
    }
}

impl Default for MaterialEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique textures across all slots of all materials, in first-seen order.
fn collect_unique_textures(materials: &[Arc<MaterialDescriptor>]) -> Vec<Arc<TextureData>> {
    let mut unique: Vec<Arc<TextureData>> = Vec::new();
    for material in materials {
        for texture in material_textures(material).into_iter().flatten() {
            if !unique.iter().any(|t| Arc::ptr_eq(t, &texture)) {
                unique.push(texture);
            }
        }
    }
    unique
}

fn material_textures(material: &MaterialDescriptor) -> [Option<Arc<TextureData>>; 4] {
    [
        material.base_color_texture.clone(),
        material.metallic_roughness_texture.clone(),
        material.normal_texture.clone(),
        material.emission_texture.clone(),
    ]
}

fn texture_slots(material: &MaterialDescriptor, unique: &[Arc<TextureData>]) -> [f32; 4] {
    let mut slots = MaterialRecord::NO_TEXTURES;
    for (slot, texture) in slots.iter_mut().zip(material_textures(material)) {
        if let Some(texture) = texture {
            if let Some(index) = unique.iter().position(|t| Arc::ptr_eq(t, &texture)) {
                *slot = index as f32;
            }
        }
    }
    slots
}
