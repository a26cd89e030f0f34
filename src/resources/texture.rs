//! Texture data on the CPU side
//!
//! The trace kernel samples textures from one big linear `u32` texel buffer,
//! not from sampled texture objects. [`TextureData`] is the decoded RGBA8
//! source that gets copied into that buffer, and [`TextureRecord`] is the
//! per-texture descriptor the kernel uses to address into it.

use bytemuck::{Pod, Zeroable};
use image::GenericImageView;

/// Decoded RGBA8 texture data.
///
/// Shared between materials via `Arc`; the material encoder dedupes texture
/// uploads by pointer identity.
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8, row-major.
    pub data: Vec<u8>,
    /// Whether the alpha channel carries meaningful coverage.
    pub has_alpha: bool,
    pub name: String,
}

impl TextureData {
    /// Decode a texture from an encoded image (PNG, JPEG, ...).
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, String> {
        let img = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
        let (width, height) = img.dimensions();
        let has_alpha = img.color().has_alpha();
        let data = img.to_rgba8().into_raw();

        Ok(Self {
            width,
            height,
            data,
            has_alpha,
            name: name.to_string(),
        })
    }

    /// Create a solid color texture.
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            data: color.to_vec(),
            has_alpha: color[3] != 255,
            name: name.to_string(),
        }
    }

    /// Create a default white texture.
    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Create a checkerboard texture.
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                data.extend_from_slice(if is_even { &color1 } else { &color2 });
            }
        }

        Self {
            width: size,
            height: size,
            data,
            has_alpha: false,
            name: "checkerboard".to_string(),
        }
    }

    /// Texel count, which is also the texture's size in the linear data
    /// buffer (one `u32` per texel).
    pub fn texel_count(&self) -> u32 {
        self.width * self.height
    }
}

/// Per-texture descriptor in the texture descriptor buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TextureRecord {
    pub width: u32,
    pub height: u32,
    /// Texel offset into the linear texture data buffer.
    pub data_offset: u32,
    pub has_alpha: u32,
}
