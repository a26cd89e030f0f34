//! Material descriptions and GPU encoding
//!
//! Materials arrive in one of two authoring conventions: the legacy
//! standard-shader set (`color`, `glossiness`, cutout `blend_mode`) and the
//! glTF factor set (`base_color_factor`, `roughness_factor`, `alpha_mode`).
//! Every property is optional; resolution tries the legacy field first, then
//! the glTF field, then a fixed default. The resolved result is a fixed
//! 32-float [`MaterialRecord`] the trace kernel indexes directly.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use std::sync::Arc;

use crate::resources::texture::TextureData;

/// A material in authoring form.
#[derive(Debug, Clone, Default)]
pub struct MaterialDescriptor {
    pub name: String,

    // Legacy standard-shader convention.
    pub color: Option<Vec4>,
    pub emission_color: Option<Vec3>,
    pub metallic: Option<f32>,
    /// Smoothness; resolved roughness is `1 - glossiness`.
    pub glossiness: Option<f32>,
    pub refraction_index: Option<f32>,
    pub bump_scale: Option<f32>,
    /// Legacy rendering mode; `1` (cutout) maps to alpha mode `2`.
    pub blend_mode: Option<u32>,
    pub cutoff: Option<f32>,

    // glTF convention.
    pub base_color_factor: Option<Vec4>,
    pub emissive_factor: Option<Vec3>,
    pub metallic_factor: Option<f32>,
    pub roughness_factor: Option<f32>,
    pub ior: Option<f32>,
    pub normal_scale: Option<f32>,
    pub alpha_mode: Option<u32>,
    pub alpha_cutoff: Option<f32>,

    // glTF-only extension factors.
    pub anisotropic_factor: Option<f32>,
    pub specular_factor: Option<f32>,
    pub specular_tint_factor: Option<f32>,
    pub sheen_factor: Option<f32>,
    pub sheen_tint_factor: Option<f32>,
    pub subsurface_factor: Option<f32>,
    pub clear_coat_factor: Option<f32>,
    pub clear_coat_gloss_factor: Option<f32>,

    // Texture slots, shared by identity.
    pub base_color_texture: Option<Arc<TextureData>>,
    pub metallic_roughness_texture: Option<Arc<TextureData>>,
    pub normal_texture: Option<Arc<TextureData>>,
    pub emission_texture: Option<Arc<TextureData>>,

    pub uv_scale: Option<Vec2>,
    pub uv_offset: Option<Vec2>,
}

impl MaterialDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color_factor = Some(color);
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic_factor = Some(metallic);
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness_factor = Some(roughness);
        self
    }

    pub fn with_emission(mut self, emission: Vec3) -> Self {
        self.emissive_factor = Some(emission);
        self
    }

    pub fn with_base_color_texture(mut self, texture: Arc<TextureData>) -> Self {
        self.base_color_texture = Some(texture);
        self
    }

    /// Resolve to the GPU record, given the texture slot indices the encoder
    /// assigned (or [`MaterialRecord::NO_TEXTURE`]).
    pub fn resolve(&self, textures: [f32; 4]) -> MaterialRecord {
        let base_color = self
            .color
            .or(self.base_color_factor)
            .unwrap_or(Vec4::new(0.8, 0.8, 0.8, 1.0));
        // Authored colors are sRGB; the kernel works in linear.
        let base_color = Vec4::new(
            base_color.x.powf(2.2),
            base_color.y.powf(2.2),
            base_color.z.powf(2.2),
            base_color.w,
        );

        let roughness = self
            .glossiness
            .map(|g| 1.0 - g)
            .or(self.roughness_factor)
            .unwrap_or(0.0);

        let alpha_mode = self
            .blend_mode
            .map(|mode| if mode == 1 { 2 } else { 0 })
            .or(self.alpha_mode)
            .unwrap_or(0);

        MaterialRecord {
            base_color,
            emission: self
                .emission_color
                .or(self.emissive_factor)
                .unwrap_or(Vec3::ZERO),
            alpha_cutoff: self.cutoff.or(self.alpha_cutoff).unwrap_or(0.5),
            metallic: self.metallic.or(self.metallic_factor).unwrap_or(0.0),
            roughness,
            normal_scale: self.bump_scale.or(self.normal_scale).unwrap_or(1.0),
            ior: self.refraction_index.or(self.ior).unwrap_or(1.1),
            alpha_mode: alpha_mode as f32,
            anisotropic: self.anisotropic_factor.unwrap_or(0.0),
            specular: self.specular_factor.unwrap_or(0.0),
            specular_tint: self.specular_tint_factor.unwrap_or(0.0),
            sheen: self.sheen_factor.unwrap_or(0.0),
            sheen_tint: self.sheen_tint_factor.unwrap_or(0.0),
            subsurface: self.subsurface_factor.unwrap_or(0.0),
            clear_coat: self.clear_coat_factor.unwrap_or(0.0),
            clear_coat_gloss: self.clear_coat_gloss_factor.unwrap_or(0.0),
            transmission: 1.0 - base_color.w,
            _reserved: [0.0; 2],
            base_color_texture: textures[0],
            metallic_roughness_texture: textures[1],
            normal_texture: textures[2],
            emission_texture: textures[3],
            uv_scale: self.uv_scale.unwrap_or(Vec2::ONE),
            uv_offset: self.uv_offset.unwrap_or(Vec2::ZERO),
        }
    }
}

/// Resolved material record: 32 floats, indexed by the trace kernel.
///
/// Texture fields hold slot indices as floats, `NO_TEXTURE` when unbound.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color: Vec4,
    pub emission: Vec3,
    pub alpha_cutoff: f32,
    pub metallic: f32,
    pub roughness: f32,
    pub normal_scale: f32,
    pub ior: f32,
    pub alpha_mode: f32,
    pub anisotropic: f32,
    pub specular: f32,
    pub specular_tint: f32,
    pub sheen: f32,
    pub sheen_tint: f32,
    pub subsurface: f32,
    pub clear_coat: f32,
    pub clear_coat_gloss: f32,
    pub transmission: f32,
    pub _reserved: [f32; 2],
    pub base_color_texture: f32,
    pub metallic_roughness_texture: f32,
    pub normal_texture: f32,
    pub emission_texture: f32,
    pub uv_scale: Vec2,
    pub uv_offset: Vec2,
}

impl MaterialRecord {
    pub const NO_TEXTURE: f32 = -1.0;
    pub const NO_TEXTURES: [f32; 4] = [Self::NO_TEXTURE; 4];
}
